//! Naming rules for the resources cabinetry provisions.
//!
//! Violations are reported as [`Error::InvalidName`] carrying the offending
//! name and the rule it broke.

use crate::{Error, Result};

fn invalid(name: &str, reason: impl Into<String>) -> Error {
    Error::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn check_length(name: &str, min: usize, max: usize) -> Result<()> {
    let len = name.chars().count();
    if len < min || len > max {
        return Err(invalid(
            name,
            format!("must be between {} and {} characters long", min, max),
        ));
    }
    Ok(())
}

/// Lowercase letters, digits and single hyphens; starts and ends with a
/// letter or digit; 3 to 63 characters.
pub fn validate_container_name(name: &str) -> Result<()> {
    check_length(name, 3, 63)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            name,
            "may only contain lowercase letters, digits and hyphens",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid(name, "must start and end with a letter or digit"));
    }
    if name.contains("--") {
        return Err(invalid(name, "cannot contain consecutive hyphens"));
    }
    Ok(())
}

/// Lowercase letters and digits only, 3 to 24 characters.
pub fn validate_storage_account_name(name: &str) -> Result<()> {
    check_length(name, 3, 24)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(invalid(name, "may only contain lowercase letters and digits"));
    }
    Ok(())
}

/// Letters, digits and single hyphens; starts with a letter, ends with a
/// letter or digit; 3 to 24 characters.
pub fn validate_vault_name(name: &str) -> Result<()> {
    check_length(name, 3, 24)?;
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid(name, "may only contain letters, digits and hyphens"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid(name, "must start with a letter"));
    }
    if name.ends_with('-') {
        return Err(invalid(name, "must end with a letter or digit"));
    }
    if name.contains("--") {
        return Err(invalid(name, "cannot contain consecutive hyphens"));
    }
    Ok(())
}

/// Alphanumerics, underscores, hyphens, periods and parentheses; 1 to 90
/// characters; cannot end with a period.
pub fn validate_resource_group_name(name: &str) -> Result<()> {
    check_length(name, 1, 90)?;
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '(' | ')'))
    {
        return Err(invalid(
            name,
            "may only contain alphanumerics, underscores, hyphens, periods and parentheses",
        ));
    }
    if name.ends_with('.') {
        return Err(invalid(name, "cannot end with a period"));
    }
    Ok(())
}

/// Letters, digits and hyphens, 1 to 127 characters.
pub fn validate_secret_name(name: &str) -> Result<()> {
    check_length(name, 1, 127)?;
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid(name, "may only contain letters, digits and hyphens"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_container_names() {
        assert!(validate_container_name("reports").is_ok());
        assert!(validate_container_name("cabinet1").is_ok());
        assert!(validate_container_name("a-b-c").is_ok());

        assert!(validate_container_name("ab").is_err());
        assert!(validate_container_name("Reports").is_err());
        assert!(validate_container_name("-reports").is_err());
        assert!(validate_container_name("reports-").is_err());
        assert!(validate_container_name("re--ports").is_err());
        assert!(validate_container_name("re_ports").is_err());
        assert!(validate_container_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_invalid_name_carries_name() {
        match validate_container_name("Bad_Name") {
            Err(Error::InvalidName { name, .. }) => assert_eq!(name, "Bad_Name"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_storage_account_names() {
        assert!(validate_storage_account_name("demosa").is_ok());
        assert!(validate_storage_account_name("demo-sa").is_err());
        assert!(validate_storage_account_name("DemoSa").is_err());
        assert!(validate_storage_account_name(&"a".repeat(25)).is_err());
    }

    #[test]
    fn test_vault_names() {
        assert!(validate_vault_name("demo-kv").is_ok());
        assert!(validate_vault_name("1demo-kv").is_err());
        assert!(validate_vault_name("demo-kv-").is_err());
        assert!(validate_vault_name("demo--kv").is_err());
    }

    #[test]
    fn test_resource_group_names() {
        assert!(validate_resource_group_name("demo-rg").is_ok());
        assert!(validate_resource_group_name("demo_(rg).1").is_ok());
        assert!(validate_resource_group_name("demo.").is_err());
        assert!(validate_resource_group_name("").is_err());
    }

    #[test]
    fn test_secret_names() {
        assert!(validate_secret_name("reports").is_ok());
        assert!(validate_secret_name("Reports-2").is_ok());
        assert!(validate_secret_name("reports.v2").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_container_names_are_valid_secret_names(
            name in "[a-z0-9](-?[a-z0-9]){2,30}"
        ) {
            prop_assert!(validate_container_name(&name).is_ok());
            prop_assert!(validate_secret_name(&name).is_ok());
        }

        #[test]
        fn prop_uppercase_never_valid_container(name in "[a-z]{2,10}[A-Z][a-z]{0,10}") {
            prop_assert!(validate_container_name(&name).is_err());
        }
    }
}
