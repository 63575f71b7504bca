//! Cabinets: storage containers whose read access is handed out as a
//! signed URI kept in the vault.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use cabinetry_cloud::{AccountKey, BlobApi, SasPermissions, SecretApi, StorageAccount, Vault};
use cabinetry_common::{classify, Error, Lookup, Result};

use crate::config::{CabinetPolicy, SecretRetention};

/// Provider codes for a container name the service will not accept.
const INVALID_NAME_CODES: [&str; 2] = ["InvalidResourceName", "OutOfRangeInput"];

/// A cabinet as read back from the cloud.
///
/// This is a projection: the container and the vault secret are the
/// authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cabinet {
    /// Container name; also the secret name.
    pub name: String,
    /// Read-only, time-bounded signed URI for the container.
    pub access_uri: String,
}

impl fmt::Display for Cabinet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.access_uri)
    }
}

/// Re-surface a provider naming rejection with the offending name.
fn surface_name_error(name: &str, err: Error) -> Error {
    match &err {
        Error::ProviderRejected(rejection)
            if INVALID_NAME_CODES.contains(&rejection.code.as_str()) =>
        {
            Error::InvalidName {
                name: name.to_string(),
                reason: rejection.message.clone(),
            }
        }
        _ => err,
    }
}

/// Manages cabinets against a provisioned storage account and vault.
pub struct CabinetBroker {
    blobs: Arc<dyn BlobApi>,
    secrets: Arc<dyn SecretApi>,
    account: StorageAccount,
    key: AccountKey,
    vault: Vault,
    policy: CabinetPolicy,
}

impl CabinetBroker {
    pub fn new(
        blobs: Arc<dyn BlobApi>,
        secrets: Arc<dyn SecretApi>,
        account: StorageAccount,
        key: AccountKey,
        vault: Vault,
        policy: CabinetPolicy,
    ) -> Self {
        Self {
            blobs,
            secrets,
            account,
            key,
            vault,
            policy,
        }
    }

    pub fn storage_account(&self) -> &StorageAccount {
        &self.account
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn policy(&self) -> &CabinetPolicy {
        &self.policy
    }

    /// Create a cabinet, or refresh the access URI of an existing one.
    ///
    /// # Postconditions
    /// - Container `name` exists
    /// - The vault secret `name` holds the returned URI
    ///
    /// # Errors
    /// - [`Error::InvalidName`] if the provider rejects the container name
    /// - Any other provider rejection
    pub async fn create_cabinet(&self, name: &str) -> Result<Cabinet> {
        let created = self
            .blobs
            .create_container_if_absent(&self.account, name)
            .await
            .map_err(|e| surface_name_error(name, e))?;
        if created {
            info!("Created container {} in {}", name, self.account.name);
        } else {
            debug!("Container {} already exists", name);
        }

        let expiry = Utc::now() + self.policy.access_ttl();
        let uri = self
            .blobs
            .generate_sas_uri(
                &self.account,
                &self.key,
                name,
                SasPermissions::read_only(),
                expiry,
            )
            .await?;

        self.secrets
            .set_secret(&self.vault, name, uri.as_str())
            .await?;
        info!("Stored access for cabinet {} (expires {})", name, expiry);

        Ok(Cabinet {
            name: name.to_string(),
            access_uri: uri.to_string(),
        })
    }

    /// Read a cabinet back. `Ok(None)` when no container exists.
    ///
    /// # Errors
    /// - [`Error::InconsistentState`] when the container exists without an
    ///   access record
    /// - [`Error::InvalidName`] if the provider rejects the container name
    pub async fn get_cabinet(&self, name: &str) -> Result<Option<Cabinet>> {
        let exists = self
            .blobs
            .container_exists(&self.account, name)
            .await
            .map_err(|e| surface_name_error(name, e))?;
        if !exists {
            debug!("Cabinet {} does not exist", name);
            return Ok(None);
        }

        let secret = self.secrets.get_secret(&self.vault, name).await;
        match classify(secret, &["SecretNotFound"])? {
            Lookup::Found(access_uri) => Ok(Some(Cabinet {
                name: name.to_string(),
                access_uri,
            })),
            Lookup::Absent => Err(Error::InconsistentState(format!(
                "cabinet '{}' has a container but no access record in vault {}",
                name, self.vault.name
            ))),
        }
    }

    /// Delete a cabinet's container; returns whether one was removed.
    ///
    /// The vault secret is removed only under [`SecretRetention::Purge`].
    pub async fn delete_cabinet(&self, name: &str) -> Result<bool> {
        let removed = self
            .blobs
            .delete_container(&self.account, name)
            .await
            .map_err(|e| surface_name_error(name, e))?;
        if removed {
            info!("Deleted container {}", name);
        } else {
            debug!("Container {} was already gone", name);
        }

        if self.policy.secret_retention == SecretRetention::Purge {
            let purged = self.secrets.delete_secret(&self.vault, name).await?;
            debug!("Purged access record for {}: {}", name, purged);
        }

        Ok(removed)
    }
}
