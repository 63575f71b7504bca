//! Get-or-create reconciliation of managed resources.
//!
//! One [`ResourceReconciler::ensure_exists`] serves every resource kind. The
//! kind-specific parts (lookup, creation, and which provider code means
//! "absent") live in a static strategy table.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info};

use cabinetry_cloud::{
    ManagementApi, ResourceGroup, StorageAccount, StorageAccountParams, Vault, VaultParams,
};
use cabinetry_common::{classify, Error, Lookup, ResourceDescriptor, ResourceKind, Result};

/// A provisioned resource of any managed kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceHandle {
    Group(ResourceGroup),
    StorageAccount(StorageAccount),
    Vault(Vault),
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Group(_) => ResourceKind::Group,
            Self::StorageAccount(_) => ResourceKind::StorageAccount,
            Self::Vault(_) => ResourceKind::Vault,
        }
    }

    /// Fully qualified resource id.
    pub fn id(&self) -> &str {
        match self {
            Self::Group(g) => &g.id,
            Self::StorageAccount(a) => &a.id,
            Self::Vault(v) => &v.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Group(g) => &g.name,
            Self::StorageAccount(a) => &a.name,
            Self::Vault(v) => &v.name,
        }
    }

    pub fn as_storage_account(&self) -> Option<&StorageAccount> {
        match self {
            Self::StorageAccount(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_vault(&self) -> Option<&Vault> {
        match self {
            Self::Vault(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of [`ResourceReconciler::ensure_exists`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub resource: ResourceHandle,
    /// True iff this call performed the creation.
    pub created: bool,
}

/// Creation parameters shared by every kind.
#[derive(Debug, Clone)]
pub struct ProvisioningDefaults {
    /// Tenant that owns created vaults.
    pub tenant_id: String,
}

impl ProvisioningDefaults {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

type Fetch = for<'a> fn(
    &'a dyn ManagementApi,
    &'a ResourceDescriptor,
) -> BoxFuture<'a, Result<ResourceHandle>>;

type Create = for<'a> fn(
    &'a dyn ManagementApi,
    &'a ResourceDescriptor,
    &'a ProvisioningDefaults,
) -> BoxFuture<'a, Result<ResourceHandle>>;

struct KindStrategy {
    kind: ResourceKind,
    /// Provider code reported when the resource does not exist.
    not_found_code: &'static str,
    fetch: Fetch,
    create: Create,
}

static STRATEGIES: [KindStrategy; 3] = [
    KindStrategy {
        kind: ResourceKind::Group,
        not_found_code: "ResourceGroupNotFound",
        fetch: fetch_group,
        create: create_group,
    },
    KindStrategy {
        kind: ResourceKind::StorageAccount,
        not_found_code: "ResourceNotFound",
        fetch: fetch_storage_account,
        create: create_storage_account,
    },
    KindStrategy {
        kind: ResourceKind::Vault,
        not_found_code: "ResourceNotFound",
        fetch: fetch_vault,
        create: create_vault,
    },
];

fn strategy_for(kind: ResourceKind) -> Result<&'static KindStrategy> {
    STRATEGIES
        .iter()
        .find(|s| s.kind == kind)
        .ok_or_else(|| Error::InvalidInput(format!("no reconciliation strategy for {}", kind)))
}

fn fetch_group<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        api.get_resource_group(descriptor.name())
            .await
            .map(ResourceHandle::Group)
    })
}

fn create_group<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
    _defaults: &'a ProvisioningDefaults,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        api.create_resource_group(descriptor.name(), descriptor.location())
            .await
            .map(ResourceHandle::Group)
    })
}

fn fetch_storage_account<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        api.get_storage_account(descriptor.parent_group()?, descriptor.name())
            .await
            .map(ResourceHandle::StorageAccount)
    })
}

fn create_storage_account<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
    _defaults: &'a ProvisioningDefaults,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        let params = StorageAccountParams::standard_v2(descriptor.location());
        api.create_storage_account(descriptor.parent_group()?, descriptor.name(), &params)
            .await
            .map(ResourceHandle::StorageAccount)
    })
}

fn fetch_vault<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        api.get_vault(descriptor.parent_group()?, descriptor.name())
            .await
            .map(ResourceHandle::Vault)
    })
}

fn create_vault<'a>(
    api: &'a dyn ManagementApi,
    descriptor: &'a ResourceDescriptor,
    defaults: &'a ProvisioningDefaults,
) -> BoxFuture<'a, Result<ResourceHandle>> {
    Box::pin(async move {
        let params = VaultParams::standard_rbac(descriptor.location(), &defaults.tenant_id);
        api.create_vault(descriptor.parent_group()?, descriptor.name(), &params)
            .await
            .map(ResourceHandle::Vault)
    })
}

/// Get-or-create over the management API.
///
/// Takes no lock: concurrent callers racing on one descriptor may both
/// create, and the provider's create-or-update semantics decide the outcome.
pub struct ResourceReconciler {
    management: Arc<dyn ManagementApi>,
    defaults: ProvisioningDefaults,
}

impl ResourceReconciler {
    pub fn new(management: Arc<dyn ManagementApi>, defaults: ProvisioningDefaults) -> Self {
        Self {
            management,
            defaults,
        }
    }

    /// Ensure the described resource exists.
    ///
    /// # Postconditions
    /// - `created` is true only when this call issued the creation
    ///
    /// # Errors
    /// - Any lookup failure other than the kind's not-found code, unchanged
    /// - Creation failure
    pub async fn ensure_exists(&self, descriptor: &ResourceDescriptor) -> Result<ReconciliationResult> {
        let strategy = strategy_for(descriptor.kind())?;
        let api = self.management.as_ref();

        info!("Checking {} {}", descriptor.kind(), descriptor.name());
        let lookup = classify(
            (strategy.fetch)(api, descriptor).await,
            &[strategy.not_found_code],
        )?;

        match lookup {
            Lookup::Found(resource) => {
                debug!("Found {} {}", descriptor.kind(), resource.id());
                Ok(ReconciliationResult {
                    resource,
                    created: false,
                })
            }
            Lookup::Absent => {
                info!(
                    "Cannot find {} {}. Creating {} in {}",
                    descriptor.kind(),
                    descriptor.name(),
                    descriptor.name(),
                    descriptor.location()
                );
                let resource = (strategy.create)(api, descriptor, &self.defaults).await?;
                info!("Created {} {}", descriptor.kind(), resource.name());
                Ok(ReconciliationResult {
                    resource,
                    created: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabinetry_cloud::{MemoryCloud, Operation};

    fn reconciler(cloud: &MemoryCloud) -> ResourceReconciler {
        ResourceReconciler::new(Arc::new(cloud.clone()), ProvisioningDefaults::new("tenant"))
    }

    #[test]
    fn test_strategy_table_covers_every_kind() {
        for kind in [
            ResourceKind::Group,
            ResourceKind::StorageAccount,
            ResourceKind::Vault,
        ] {
            assert!(strategy_for(kind).is_ok());
        }
        assert_eq!(
            strategy_for(ResourceKind::Group).unwrap().not_found_code,
            "ResourceGroupNotFound"
        );
    }

    #[tokio::test]
    async fn test_ensure_exists_is_idempotent() {
        let cloud = MemoryCloud::new("sub");
        let reconciler = reconciler(&cloud);
        let group = ResourceDescriptor::group("demo-rg", "westeurope").unwrap();

        let first = reconciler.ensure_exists(&group).await.unwrap();
        let second = reconciler.ensure_exists(&group).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.resource, second.resource);
        assert_eq!(cloud.count(Operation::CreateResourceGroup), 1);
    }

    #[tokio::test]
    async fn test_children_after_group() {
        let cloud = MemoryCloud::new("sub");
        let reconciler = reconciler(&cloud);

        reconciler
            .ensure_exists(&ResourceDescriptor::group("demo-rg", "westeurope").unwrap())
            .await
            .unwrap();
        let account = reconciler
            .ensure_exists(
                &ResourceDescriptor::storage_account("demo-rg", "demosa", "westeurope").unwrap(),
            )
            .await
            .unwrap();
        let vault = reconciler
            .ensure_exists(&ResourceDescriptor::vault("demo-rg", "demo-kv", "westeurope").unwrap())
            .await
            .unwrap();

        assert!(account.created);
        assert_eq!(account.resource.kind(), ResourceKind::StorageAccount);
        assert!(account.resource.as_storage_account().is_some());
        assert!(vault.created);
        assert_eq!(vault.resource.as_vault().unwrap().name, "demo-kv");
    }

    #[tokio::test]
    async fn test_other_error_propagates_without_creation() {
        let cloud = MemoryCloud::new("sub");
        cloud.fail_next(Operation::GetResourceGroup, 403, "Forbidden");

        let err = reconciler(&cloud)
            .ensure_exists(&ResourceDescriptor::group("demo-rg", "westeurope").unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.provider_code(), Some("Forbidden"));
        assert_eq!(cloud.count(Operation::CreateResourceGroup), 0);
    }

    #[tokio::test]
    async fn test_missing_parent_group_is_not_treated_as_absent() {
        let cloud = MemoryCloud::new("sub");

        let err = reconciler(&cloud)
            .ensure_exists(
                &ResourceDescriptor::storage_account("demo-rg", "demosa", "westeurope").unwrap(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.provider_code(), Some("ResourceGroupNotFound"));
        assert_eq!(cloud.count(Operation::CreateStorageAccount), 0);
    }

    #[tokio::test]
    async fn test_creation_failure_propagates() {
        let cloud = MemoryCloud::new("sub");
        cloud.fail_next(Operation::CreateResourceGroup, 409, "Conflict");

        let err = reconciler(&cloud)
            .ensure_exists(&ResourceDescriptor::group("demo-rg", "westeurope").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.provider_code(), Some("Conflict"));
    }
}
