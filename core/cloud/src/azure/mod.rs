//! Azure backend over the public REST APIs.
//!
//! - [`ArmClient`]: resource groups, storage accounts, key vaults, role
//!   assignments
//! - [`BlobClient`]: container lifecycle and SAS minting
//! - [`KeyVaultSecrets`]: vault secrets

mod auth;
mod blob;
mod http;
mod management;
mod secrets;

pub use auth::{
    default_credential, AzureCliCredential, ClientSecretCredential, CLIENT_ID_ENV,
    CLIENT_SECRET_ENV, DEFAULT_AUTHORITY,
};
pub use blob::BlobClient;
pub use management::{ArmClient, ProvisioningWait, DEFAULT_MANAGEMENT_ENDPOINT};
pub use secrets::KeyVaultSecrets;

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use cabinetry_common::{Error, Result};

use crate::api::CloudBackend;
use crate::credential::{StaticTokenCredential, TokenCredential};

/// Environment variable holding a pre-acquired bearer token.
pub const ACCESS_TOKEN_ENV: &str = "AZURE_ACCESS_TOKEN";

/// How the backend obtains tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Environment service principal, then the Azure CLI.
    #[default]
    Default,
    Cli,
    ClientSecret,
    /// A fixed token, from settings or `AZURE_ACCESS_TOKEN`.
    Static,
}

/// Settings accepted by the "azure" backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AzureSettings {
    pub tenant: String,
    pub subscription: String,
    #[serde(default)]
    pub credential: CredentialMode,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_provisioning_timeout")]
    pub provisioning_timeout_secs: u64,
    #[serde(default = "default_provisioning_poll")]
    pub provisioning_poll_secs: u64,
}

fn default_management_endpoint() -> String {
    DEFAULT_MANAGEMENT_ENDPOINT.to_string()
}

fn default_authority() -> String {
    DEFAULT_AUTHORITY.to_string()
}

fn default_http_timeout() -> u64 {
    60
}

fn default_provisioning_timeout() -> u64 {
    300
}

fn default_provisioning_poll() -> u64 {
    5
}

impl AzureSettings {
    /// Parse from backend settings JSON.
    pub fn from_value(settings: Value) -> Result<Self> {
        serde_json::from_value(settings)
            .map_err(|e| Error::Configuration(format!("invalid azure backend settings: {}", e)))
    }

    fn build_credential(&self) -> Result<Arc<dyn TokenCredential>> {
        match self.credential {
            CredentialMode::Default => Ok(Arc::new(default_credential(&self.tenant)?)),
            CredentialMode::Cli => Ok(Arc::new(AzureCliCredential::new(Some(
                self.tenant.clone(),
            )))),
            CredentialMode::ClientSecret => {
                let client_id = self
                    .client_id
                    .clone()
                    .or_else(|| std::env::var(CLIENT_ID_ENV).ok())
                    .ok_or_else(|| {
                        Error::Configuration("client-secret credential needs a client-id".into())
                    })?;
                let secret = self
                    .client_secret
                    .clone()
                    .or_else(|| std::env::var(CLIENT_SECRET_ENV).ok())
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "client-secret credential needs a client-secret or {}",
                            CLIENT_SECRET_ENV
                        ))
                    })?;
                Ok(Arc::new(ClientSecretCredential::with_authority(
                    &self.tenant,
                    client_id,
                    secret,
                    &self.authority,
                )?))
            }
            CredentialMode::Static => {
                let token = self
                    .token
                    .clone()
                    .or_else(|| std::env::var(ACCESS_TOKEN_ENV).ok())
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "static credential needs a token or {}",
                            ACCESS_TOKEN_ENV
                        ))
                    })?;
                Ok(Arc::new(StaticTokenCredential::new(token)))
            }
        }
    }
}

/// Build the "azure" backend from settings JSON.
///
/// # Errors
/// - Missing or malformed settings
/// - Credential mode requirements not met
pub fn create_azure_backend(settings: Value) -> Result<CloudBackend> {
    let settings = AzureSettings::from_value(settings)?;
    let credential = settings.build_credential()?;
    let http = http::build_client(Duration::from_secs(settings.http_timeout_secs))?;

    let endpoint = Url::parse(&settings.management_endpoint).map_err(|e| {
        Error::Configuration(format!(
            "invalid management endpoint '{}': {}",
            settings.management_endpoint, e
        ))
    })?;

    let management = ArmClient::new(
        http.clone(),
        Arc::clone(&credential),
        crate::sas::with_trailing_slash(&endpoint),
        &settings.subscription,
    )
    .with_provisioning_wait(ProvisioningWait {
        interval: Duration::from_secs(settings.provisioning_poll_secs.max(1)),
        timeout: Duration::from_secs(settings.provisioning_timeout_secs),
    });

    Ok(CloudBackend {
        name: "azure".to_string(),
        management: Arc::new(management),
        blobs: Arc::new(BlobClient::new(http.clone(), Arc::clone(&credential))),
        secrets: Arc::new(KeyVaultSecrets::new(http, Arc::clone(&credential))),
        credential,
    })
}
