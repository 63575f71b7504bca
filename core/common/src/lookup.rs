//! Absence as a value.
//!
//! Providers report a missing resource as a rejected call with a
//! kind-specific code. [`classify`] turns that into a plain branch so
//! callers never use errors for get-or-create control flow.

use crate::{Error, Result};

/// Outcome of looking something up remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Absent,
}

/// Split a provider result into found, absent, or failure.
///
/// Only a [`Error::ProviderRejected`] whose code is listed in
/// `not_found_codes` becomes [`Lookup::Absent`]; every other error is
/// returned unchanged.
pub fn classify<T>(result: Result<T>, not_found_codes: &[&str]) -> Result<Lookup<T>> {
    match result {
        Ok(value) => Ok(Lookup::Found(value)),
        Err(Error::ProviderRejected(err)) if not_found_codes.contains(&err.code.as_str()) => {
            Ok(Lookup::Absent)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_passes_through() {
        let result = classify(Ok(7), &["ResourceNotFound"]).unwrap();
        assert_eq!(result, Lookup::Found(7));
    }

    #[test]
    fn test_listed_code_is_absent() {
        let result: Result<i32> = Err(Error::provider(Some(404), "ResourceGroupNotFound", "gone"));
        let lookup = classify(result, &["ResourceGroupNotFound"]).unwrap();
        assert_eq!(lookup, Lookup::Absent);
    }

    #[test]
    fn test_other_code_propagates_unchanged() {
        let result: Result<i32> = Err(Error::provider(Some(403), "Forbidden", "denied"));
        let err = classify(result, &["ResourceGroupNotFound"]).unwrap_err();
        assert_eq!(err.provider_code(), Some("Forbidden"));
        assert_eq!(err.provider_status(), Some(403));
    }

    #[test]
    fn test_code_of_other_kind_is_not_absence() {
        // A storage-style not-found code must not satisfy a group lookup.
        let result: Result<i32> = Err(Error::provider(Some(404), "ResourceNotFound", "gone"));
        assert!(classify(result, &["ResourceGroupNotFound"]).is_err());
    }

    #[test]
    fn test_non_provider_errors_propagate() {
        let result: Result<i32> = Err(Error::Network("reset".to_string()));
        assert!(matches!(
            classify(result, &["ResourceNotFound"]),
            Err(Error::Network(_))
        ));
    }
}
