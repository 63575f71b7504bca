//! Cabinet platform core.
//!
//! Provisions a resource group, a storage account and a key vault with
//! get-or-create reconciliation, grants the executing principal access to a
//! newly created vault, and brokers cabinets: containers whose read access
//! is a signed URI stored in the vault.
//!
//! # Example
//! ```no_run
//! # async fn run() -> cabinetry_common::Result<()> {
//! use cabinetry_platform::{Platform, PlatformConfig};
//!
//! let platform = Platform::from_config(PlatformConfig::load("AppConfiguration.json")?)?;
//! platform.initialize().await?;
//! let cabinet = platform.create_cabinet("reports").await?;
//! println!("{}", cabinet.access_uri);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod grant;
pub mod platform;
pub mod reconciler;

pub use broker::{Cabinet, CabinetBroker};
pub use config::{
    BackendConfig, CabinetPolicy, GrantSettings, PlatformConfig, ResourceNames, SecretRetention,
    DEFAULT_CONFIG_FILE, SECRETS_OFFICER_ROLE_ID,
};
pub use grant::{
    AccessGrant, AccessGrantManager, AuthorizationProbe, PropagationPolicy, VaultSecretProbe,
};
pub use platform::{InitializeReport, Platform, ProbeFactory};
pub use reconciler::{ProvisioningDefaults, ReconciliationResult, ResourceHandle, ResourceReconciler};
