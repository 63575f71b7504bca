//! Collaborator traits for the cloud provider.
//!
//! The platform core talks to the provider only through these traits:
//! [`ManagementApi`] for the control plane, [`BlobApi`] for containers and
//! [`SecretApi`] for the vault. Every remote failure is reported as
//! [`Error::ProviderRejected`](cabinetry_common::Error::ProviderRejected)
//! with the provider's own code; implementations never decide what a code
//! means.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use cabinetry_common::Result;

use crate::credential::TokenCredential;

/// Subscription the platform provisions into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub display_name: String,
}

/// A provisioned resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Fully qualified resource id.
    pub id: String,
    pub name: String,
    pub location: String,
}

/// A provisioned storage account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccount {
    /// Fully qualified resource id.
    pub id: String,
    pub name: String,
    pub location: String,
    /// Blob service endpoint, e.g. `https://demosa.blob.core.windows.net/`.
    pub blob_endpoint: Url,
}

/// A provisioned key vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    /// Fully qualified resource id; also the scope of role assignments.
    pub id: String,
    pub name: String,
    pub location: String,
    /// Data plane endpoint, e.g. `https://demo-kv.vault.azure.net/`.
    pub vault_uri: Url,
}

/// Parameters for creating a storage account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccountParams {
    pub location: String,
    pub sku: String,
    pub kind: String,
}

impl StorageAccountParams {
    /// Locally redundant general purpose v2 account.
    pub fn standard_v2(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            sku: "Standard_LRS".to_string(),
            kind: "StorageV2".to_string(),
        }
    }
}

/// Parameters for creating a key vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    pub location: String,
    pub tenant_id: String,
    pub sku_family: String,
    pub sku_name: String,
    pub enable_rbac_authorization: bool,
    pub enable_soft_delete: bool,
}

impl VaultParams {
    /// Standard vault with RBAC authorization and soft delete disabled.
    pub fn standard_rbac(location: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            tenant_id: tenant_id.into(),
            sku_family: "A".to_string(),
            sku_name: "standard".to_string(),
            enable_rbac_authorization: true,
            enable_soft_delete: false,
        }
    }
}

/// Request to assign a role to a principal at a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignmentRequest {
    /// Resource id the assignment applies to.
    pub scope: String,
    /// Fully qualified role definition id.
    pub role_definition_id: String,
    pub principal_id: String,
    /// Client-chosen assignment name.
    pub assignment_id: Uuid,
}

/// A created role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: String,
    pub scope: String,
    pub role_definition_id: String,
    pub principal_id: String,
}

/// Storage account access key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccountKey {
    name: String,
    value: String,
}

impl AccountKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base64 encoded key material.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountKey({}, [REDACTED])", self.name)
    }
}

/// Permissions granted by a shared access signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SasPermissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub list: bool,
}

impl SasPermissions {
    /// Read only; the only permission set cabinets hand out.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Canonical `sp` value; order is fixed by the signing rules.
    pub fn as_sp(&self) -> String {
        let mut sp = String::new();
        if self.read {
            sp.push('r');
        }
        if self.write {
            sp.push('w');
        }
        if self.delete {
            sp.push('d');
        }
        if self.list {
            sp.push('l');
        }
        sp
    }
}

/// Control plane operations.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Look up the configured subscription.
    async fn get_subscription(&self) -> Result<Subscription>;

    /// Get a resource group. Absence is reported with code `ResourceGroupNotFound`.
    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup>;

    /// Create or update a resource group.
    async fn create_resource_group(&self, name: &str, location: &str) -> Result<ResourceGroup>;

    /// Get a storage account. Absence is reported with code `ResourceNotFound`.
    async fn get_storage_account(&self, group: &str, name: &str) -> Result<StorageAccount>;

    /// Create or update a storage account and wait until it is provisioned.
    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        params: &StorageAccountParams,
    ) -> Result<StorageAccount>;

    /// List the access keys of a storage account.
    async fn list_storage_account_keys(&self, group: &str, name: &str) -> Result<Vec<AccountKey>>;

    /// Get a key vault. Absence is reported with code `ResourceNotFound`.
    async fn get_vault(&self, group: &str, name: &str) -> Result<Vault>;

    /// Create or update a key vault and wait until it is provisioned.
    async fn create_vault(&self, group: &str, name: &str, params: &VaultParams) -> Result<Vault>;

    /// Create a role assignment. Not idempotent across assignment ids.
    async fn create_role_assignment(&self, request: &RoleAssignmentRequest)
        -> Result<RoleAssignment>;
}

/// Blob container operations.
#[async_trait]
pub trait BlobApi: Send + Sync {
    /// Check whether a container exists.
    async fn container_exists(&self, account: &StorageAccount, name: &str) -> Result<bool>;

    /// Create a container unless it exists. Returns whether this call created it.
    async fn create_container_if_absent(&self, account: &StorageAccount, name: &str)
        -> Result<bool>;

    /// Delete a container. Returns whether a container was removed.
    async fn delete_container(&self, account: &StorageAccount, name: &str) -> Result<bool>;

    /// Mint a container-scoped signed URI.
    async fn generate_sas_uri(
        &self,
        account: &StorageAccount,
        key: &AccountKey,
        container: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url>;
}

/// Vault secret operations.
#[async_trait]
pub trait SecretApi: Send + Sync {
    /// Write a secret, replacing any previous value.
    async fn set_secret(&self, vault: &Vault, name: &str, value: &str) -> Result<()>;

    /// Read a secret. Absence is reported with code `SecretNotFound`.
    async fn get_secret(&self, vault: &Vault, name: &str) -> Result<String>;

    /// Delete a secret. Returns whether a secret was removed.
    async fn delete_secret(&self, vault: &Vault, name: &str) -> Result<bool>;
}

/// A resolved backend: one implementation of every collaborator.
#[derive(Clone)]
pub struct CloudBackend {
    /// Backend name as registered (e.g. "memory", "azure").
    pub name: String,
    pub management: Arc<dyn ManagementApi>,
    pub blobs: Arc<dyn BlobApi>,
    pub secrets: Arc<dyn SecretApi>,
    pub credential: Arc<dyn TokenCredential>,
}

impl fmt::Debug for CloudBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudBackend").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sas_permissions_order() {
        assert_eq!(SasPermissions::read_only().as_sp(), "r");

        let all = SasPermissions {
            read: true,
            write: true,
            delete: true,
            list: true,
        };
        assert_eq!(all.as_sp(), "rwdl");
    }

    #[test]
    fn test_account_key_debug_redacts() {
        let key = AccountKey::new("key1", "c2VjcmV0");
        let debug = format!("{:?}", key);
        assert!(debug.contains("key1"));
        assert!(!debug.contains("c2VjcmV0"));
    }

    #[test]
    fn test_vault_params_defaults() {
        let params = VaultParams::standard_rbac("westeurope", "tenant");
        assert!(params.enable_rbac_authorization);
        assert!(!params.enable_soft_delete);
        assert_eq!(params.sku_family, "A");
        assert_eq!(params.sku_name, "standard");
    }
}
