//! Platform configuration.
//!
//! Loaded once at process start from `AppConfiguration.json` and passed
//! into [`Platform`](crate::Platform) by value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use cabinetry_common::naming::{
    validate_resource_group_name, validate_storage_account_name, validate_vault_name,
};
use cabinetry_common::{Error, Result};

use crate::grant::PropagationPolicy;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "AppConfiguration.json";

/// "Key Vault Secrets Officer" built-in role.
pub const SECRETS_OFFICER_ROLE_ID: &str = "b86a8fe4-44ce-4948-aee5-eccb2c155cd7";

/// Bounds for the lifetime of a cabinet access URI, in hours.
pub const MIN_ACCESS_TTL_HOURS: u32 = 1;
pub const MAX_ACCESS_TTL_HOURS: u32 = 24;

/// Names of the managed resources, derived from the resource prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub group: String,
    pub storage_account: String,
    pub vault: String,
}

impl ResourceNames {
    /// `{prefix}-rg`, `{prefix}sa` and `{prefix}-kv`.
    pub fn from_prefix(prefix: &str) -> Self {
        Self {
            group: format!("{}-rg", prefix),
            storage_account: format!("{}sa", prefix),
            vault: format!("{}-kv", prefix),
        }
    }
}

/// What happens to a cabinet's vault secret when the cabinet is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretRetention {
    /// Keep the secret; the stale URI stops working once it expires.
    #[default]
    Retain,
    /// Delete the secret together with the container.
    Purge,
}

/// Cabinet access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CabinetPolicy {
    /// Lifetime of minted access URIs.
    #[serde(default = "default_access_ttl_hours")]
    pub access_ttl_hours: u32,
    #[serde(default)]
    pub secret_retention: SecretRetention,
}

fn default_access_ttl_hours() -> u32 {
    MAX_ACCESS_TTL_HOURS
}

impl CabinetPolicy {
    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.access_ttl_hours))
    }
}

impl Default for CabinetPolicy {
    fn default() -> Self {
        Self {
            access_ttl_hours: default_access_ttl_hours(),
            secret_retention: SecretRetention::default(),
        }
    }
}

/// Role grant settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GrantSettings {
    /// Role definition GUID granted on a newly created vault.
    #[serde(default = "default_role_id")]
    pub role_id: String,
    /// Overall bound on waiting for the grant to take effect.
    #[serde(default = "default_propagation_timeout_secs")]
    pub propagation_timeout_secs: u64,
    #[serde(default = "default_propagation_initial_delay_ms")]
    pub propagation_initial_delay_ms: u64,
    #[serde(default = "default_propagation_max_delay_ms")]
    pub propagation_max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub propagation_jitter: bool,
}

fn default_role_id() -> String {
    SECRETS_OFFICER_ROLE_ID.to_string()
}

fn default_propagation_timeout_secs() -> u64 {
    300
}

fn default_propagation_initial_delay_ms() -> u64 {
    2_000
}

fn default_propagation_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl GrantSettings {
    pub fn propagation_policy(&self) -> PropagationPolicy {
        PropagationPolicy::new(Duration::from_secs(self.propagation_timeout_secs))
            .with_initial_delay(Duration::from_millis(self.propagation_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.propagation_max_delay_ms))
            .with_jitter(self.propagation_jitter)
    }
}

impl Default for GrantSettings {
    fn default() -> Self {
        Self {
            role_id: default_role_id(),
            propagation_timeout_secs: default_propagation_timeout_secs(),
            propagation_initial_delay_ms: default_propagation_initial_delay_ms(),
            propagation_max_delay_ms: default_propagation_max_delay_ms(),
            propagation_jitter: default_jitter(),
        }
    }
}

/// Which cloud backend to use, and its backend-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    #[serde(default = "default_backend_name")]
    pub name: String,
    #[serde(default)]
    pub settings: Value,
}

fn default_backend_name() -> String {
    "azure".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend_name(),
            settings: Value::Null,
        }
    }
}

/// Platform configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformConfig {
    /// Entra ID tenant.
    pub tenant: String,
    /// Subscription to provision into.
    pub subscription: String,
    /// Prefix for every derived resource name.
    pub resource_prefix: String,
    /// Region for every resource.
    pub location: String,
    /// Principal to grant vault access to; read from the token when unset.
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cabinets: CabinetPolicy,
    #[serde(default)]
    pub grant: GrantSettings,
}

impl PlatformConfig {
    /// Create a configuration with default backend, cabinet and grant settings.
    pub fn new(
        tenant: impl Into<String>,
        subscription: impl Into<String>,
        resource_prefix: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            subscription: subscription.into(),
            resource_prefix: resource_prefix.into(),
            location: location.into(),
            principal_id: None,
            backend: BackendConfig::default(),
            cabinets: CabinetPolicy::default(),
            grant: GrantSettings::default(),
        }
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Malformed JSON or missing required keys
    /// - Validation failure (see [`PlatformConfig::validate`])
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check every startup invariant.
    ///
    /// # Errors
    /// All failures are [`Error::Configuration`].
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("tenant", &self.tenant),
            ("subscription", &self.subscription),
            ("resource-prefix", &self.resource_prefix),
            ("location", &self.location),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("'{}' is required", key)));
            }
        }

        Uuid::parse_str(&self.tenant).map_err(|_| {
            Error::Configuration(format!("'tenant' must be a GUID, got '{}'", self.tenant))
        })?;
        Uuid::parse_str(&self.grant.role_id).map_err(|_| {
            Error::Configuration(format!(
                "'grant.role-id' must be a GUID, got '{}'",
                self.grant.role_id
            ))
        })?;

        if matches!(&self.principal_id, Some(p) if p.trim().is_empty()) {
            return Err(Error::Configuration(
                "'principal-id' must not be empty when set".to_string(),
            ));
        }

        let names = self.resource_names();
        validate_resource_group_name(&names.group)
            .and_then(|_| validate_storage_account_name(&names.storage_account))
            .and_then(|_| validate_vault_name(&names.vault))
            .map_err(|e| {
                Error::Configuration(format!(
                    "resource prefix '{}' does not produce valid names: {}",
                    self.resource_prefix, e
                ))
            })?;

        let ttl = self.cabinets.access_ttl_hours;
        if !(MIN_ACCESS_TTL_HOURS..=MAX_ACCESS_TTL_HOURS).contains(&ttl) {
            return Err(Error::Configuration(format!(
                "cabinet access TTL must be between {} and {} hours, got {}",
                MIN_ACCESS_TTL_HOURS, MAX_ACCESS_TTL_HOURS, ttl
            )));
        }

        if self.grant.propagation_timeout_secs == 0 {
            return Err(Error::Configuration(
                "'grant.propagation-timeout-secs' must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames::from_prefix(&self.resource_prefix)
    }

    /// Backend settings with `tenant` and `subscription` filled in.
    pub fn backend_settings(&self) -> Value {
        let mut settings = match &self.backend.settings {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        settings
            .entry("tenant")
            .or_insert_with(|| Value::String(self.tenant.clone()));
        settings
            .entry("subscription")
            .or_insert_with(|| Value::String(self.subscription.clone()));
        Value::Object(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TENANT: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";

    fn minimal_json() -> String {
        format!(
            r#"{{
                "tenant": "{}",
                "subscription": "00000000-0000-0000-0000-000000000001",
                "resource-prefix": "demo",
                "location": "westeurope"
            }}"#,
            TENANT
        )
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = PlatformConfig::from_json(&minimal_json()).unwrap();

        assert_eq!(config.backend.name, "azure");
        assert_eq!(config.cabinets.access_ttl_hours, 24);
        assert_eq!(config.cabinets.secret_retention, SecretRetention::Retain);
        assert_eq!(config.grant.role_id, SECRETS_OFFICER_ROLE_ID);
        assert!(config.principal_id.is_none());
    }

    #[test]
    fn test_resource_names() {
        let names = ResourceNames::from_prefix("demo");
        assert_eq!(names.group, "demo-rg");
        assert_eq!(names.storage_account, "demosa");
        assert_eq!(names.vault, "demo-kv");
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let json = format!(r#"{{ "tenant": "{}", "location": "westeurope" }}"#, TENANT);
        assert!(matches!(
            PlatformConfig::from_json(&json),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_value_rejected() {
        let mut config = PlatformConfig::new(TENANT, "sub", "demo", "westeurope");
        config.location = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_tenant_must_be_guid() {
        let config = PlatformConfig::new("contoso", "sub", "demo", "westeurope");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_prefix_must_yield_valid_names() {
        // Uppercase is invalid in a storage account name.
        let config = PlatformConfig::new(TENANT, "sub", "Demo", "westeurope");
        assert!(config.validate().is_err());

        let config = PlatformConfig::new(TENANT, "sub", "averyveryverylongprefix", "westeurope");
        assert!(config.validate().is_err());

        let config = PlatformConfig::new(TENANT, "sub", "demo", "westeurope");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_access_ttl_bounds() {
        let mut config = PlatformConfig::new(TENANT, "sub", "demo", "westeurope");
        config.cabinets.access_ttl_hours = 0;
        assert!(config.validate().is_err());

        config.cabinets.access_ttl_hours = 25;
        assert!(config.validate().is_err());

        config.cabinets.access_ttl_hours = 1;
        assert!(config.validate().is_ok());
        assert_eq!(config.cabinets.access_ttl(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_full_document() {
        let json = format!(
            r#"{{
                "tenant": "{}",
                "subscription": "sub",
                "resource-prefix": "demo",
                "location": "westeurope",
                "principal-id": "11111111-2222-3333-4444-555555555555",
                "backend": {{ "name": "memory", "settings": {{ "authorization-lag": 2 }} }},
                "cabinets": {{ "access-ttl-hours": 4, "secret-retention": "purge" }},
                "grant": {{ "propagation-timeout-secs": 60, "propagation-jitter": false }}
            }}"#,
            TENANT
        );

        let config = PlatformConfig::from_json(&json).unwrap();
        assert_eq!(config.backend.name, "memory");
        assert_eq!(config.cabinets.secret_retention, SecretRetention::Purge);
        assert_eq!(config.cabinets.access_ttl_hours, 4);

        let policy = config.grant.propagation_policy();
        assert_eq!(policy.timeout, Duration::from_secs(60));
        assert!(!policy.jitter);

        let settings = config.backend_settings();
        assert_eq!(settings["subscription"], "sub");
        assert_eq!(settings["tenant"], TENANT);
        assert_eq!(settings["authorization-lag"], 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_json().as_bytes()).unwrap();

        let config = PlatformConfig::load(file.path()).unwrap();
        assert_eq!(config.resource_prefix, "demo");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = PlatformConfig::load(dir.path().join(DEFAULT_CONFIG_FILE));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_json_roundtrip_preserves_policy() {
        let mut config = PlatformConfig::new(TENANT, "sub", "demo", "westeurope");
        config.cabinets.secret_retention = SecretRetention::Purge;

        let parsed = PlatformConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
