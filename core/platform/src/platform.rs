//! Composition root: provisioning order and the ready state cabinet
//! operations run against.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cabinetry_cloud::credential::MANAGEMENT_SCOPE;
use cabinetry_cloud::{
    create_default_registry, principal_id_from_token, CloudBackend, StorageAccount, Subscription,
    Vault,
};
use cabinetry_common::{Error, ResourceDescriptor, Result};

use crate::broker::{Cabinet, CabinetBroker};
use crate::config::PlatformConfig;
use crate::grant::{AccessGrant, AccessGrantManager, AuthorizationProbe, VaultSecretProbe};
use crate::reconciler::{ProvisioningDefaults, ReconciliationResult, ResourceReconciler};

/// Summary of one [`Platform::initialize`] run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeReport {
    pub subscription: String,
    pub principal_id: String,
    pub group: String,
    pub group_created: bool,
    pub storage_account: String,
    pub storage_account_created: bool,
    pub vault: String,
    pub vault_created: bool,
    /// Present only when the vault was created by this run.
    pub grant: Option<AccessGrant>,
}

/// Builds the probe used to wait for a new grant; receives the new vault.
pub type ProbeFactory =
    Box<dyn Fn(&CloudBackend, &Vault) -> Arc<dyn AuthorizationProbe> + Send + Sync>;

/// The platform.
///
/// Cabinet operations fail with [`Error::NotInitialized`] until
/// [`Platform::initialize`] has completed once.
pub struct Platform {
    config: PlatformConfig,
    backend: CloudBackend,
    probe_factory: ProbeFactory,
    ready: RwLock<Option<Arc<CabinetBroker>>>,
}

impl Platform {
    pub fn new(config: PlatformConfig, backend: CloudBackend) -> Self {
        Self {
            config,
            backend,
            probe_factory: Box::new(
                |backend: &CloudBackend, vault: &Vault| -> Arc<dyn AuthorizationProbe> {
                    Arc::new(VaultSecretProbe::new(backend.secrets.clone(), vault.clone()))
                },
            ),
            ready: RwLock::new(None),
        }
    }

    /// Resolve the configured backend from the default registry.
    ///
    /// # Errors
    /// - Unknown backend name
    /// - Backend settings rejected
    pub fn from_config(config: PlatformConfig) -> Result<Self> {
        let registry = create_default_registry()?;
        let backend = registry.resolve(&config.backend.name, config.backend_settings())?;
        info!("Using {} backend", backend.name);
        Ok(Self::new(config, backend))
    }

    /// Replace the probe used after a role grant.
    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = factory;
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn backend(&self) -> &CloudBackend {
        &self.backend
    }

    pub async fn is_initialized(&self) -> bool {
        self.ready.read().await.is_some()
    }

    /// Principal to grant vault access to: configured, or the token's `oid`.
    async fn principal_id(&self) -> Result<String> {
        if let Some(principal) = &self.config.principal_id {
            return Ok(principal.clone());
        }
        let token = self.backend.credential.get_token(&[MANAGEMENT_SCOPE]).await?;
        principal_id_from_token(&token)
    }

    /// Provision the group, storage account and vault, grant access on a
    /// new vault, and make cabinet operations available.
    ///
    /// Safe to call again: reconciliation is idempotent and the ready state
    /// is replaced.
    ///
    /// # Errors
    /// - Any provider rejection other than the expected not-found branch
    /// - [`Error::Timeout`] if a new grant does not take effect in time
    /// - The storage account has no access keys
    pub async fn initialize(&self) -> Result<InitializeReport> {
        let subscription: Subscription = self.backend.management.get_subscription().await?;
        info!(
            "Selected subscription {} ({})",
            subscription.display_name, subscription.id
        );
        let principal_id = self.principal_id().await?;
        debug!("Granting new vaults to principal {}", principal_id);

        let names = self.config.resource_names();
        let location = &self.config.location;
        let reconciler = ResourceReconciler::new(
            self.backend.management.clone(),
            ProvisioningDefaults::new(&self.config.tenant),
        );

        let group = reconciler
            .ensure_exists(&ResourceDescriptor::group(&names.group, location)?)
            .await?;

        let account_descriptor =
            ResourceDescriptor::storage_account(&names.group, &names.storage_account, location)?;
        let vault_descriptor = ResourceDescriptor::vault(&names.group, &names.vault, location)?;
        let (account, vault) = tokio::try_join!(
            reconciler.ensure_exists(&account_descriptor),
            reconciler.ensure_exists(&vault_descriptor),
        )?;

        let grant = self.grant_access(&vault, &principal_id).await?;

        let storage_account = expect_storage_account(&account)?;
        let key_vault = expect_vault(&vault)?;
        let key = self
            .backend
            .management
            .list_storage_account_keys(&names.group, &storage_account.name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InconsistentState(format!(
                    "storage account {} has no access keys",
                    storage_account.name
                ))
            })?;
        debug!("Using storage account key {}", key.name());

        let broker = CabinetBroker::new(
            self.backend.blobs.clone(),
            self.backend.secrets.clone(),
            storage_account.clone(),
            key,
            key_vault.clone(),
            self.config.cabinets,
        );
        *self.ready.write().await = Some(Arc::new(broker));
        info!("Platform ready");

        Ok(InitializeReport {
            subscription: subscription.id,
            principal_id,
            group: group.resource.name().to_string(),
            group_created: group.created,
            storage_account: storage_account.name.clone(),
            storage_account_created: account.created,
            vault: key_vault.name.clone(),
            vault_created: vault.created,
            grant,
        })
    }

    /// [`Platform::initialize`], abandoned when `cancel` fires.
    ///
    /// Resources created before cancellation stay; a later run resumes.
    pub async fn initialize_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InitializeReport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Initialization cancelled");
                Err(Error::Cancelled)
            }
            report = self.initialize() => report,
        }
    }

    async fn grant_access(
        &self,
        vault: &ReconciliationResult,
        principal_id: &str,
    ) -> Result<Option<AccessGrant>> {
        let grants = AccessGrantManager::new(
            self.backend.management.clone(),
            &self.config.subscription,
            self.config.grant.propagation_policy(),
        );
        let grant = grants
            .grant_if_first_creation(vault, principal_id, &self.config.grant.role_id)
            .await?;

        if grant.is_some() {
            let probe = (self.probe_factory)(&self.backend, expect_vault(vault)?);
            grants.await_propagation(probe.as_ref()).await?;
        }
        Ok(grant)
    }

    async fn broker(&self) -> Result<Arc<CabinetBroker>> {
        self.ready.read().await.clone().ok_or(Error::NotInitialized)
    }

    /// See [`CabinetBroker::create_cabinet`].
    pub async fn create_cabinet(&self, name: &str) -> Result<Cabinet> {
        self.broker().await?.create_cabinet(name).await
    }

    /// See [`CabinetBroker::get_cabinet`].
    pub async fn get_cabinet(&self, name: &str) -> Result<Option<Cabinet>> {
        self.broker().await?.get_cabinet(name).await
    }

    /// See [`CabinetBroker::delete_cabinet`].
    pub async fn delete_cabinet(&self, name: &str) -> Result<bool> {
        self.broker().await?.delete_cabinet(name).await
    }
}

fn expect_storage_account(result: &ReconciliationResult) -> Result<&StorageAccount> {
    result.resource.as_storage_account().ok_or_else(|| {
        Error::InvalidInput(format!("expected a storage account, got {}", result.resource.kind()))
    })
}

fn expect_vault(result: &ReconciliationResult) -> Result<&Vault> {
    result.resource.as_vault().ok_or_else(|| {
        Error::InvalidInput(format!("expected a key vault, got {}", result.resource.kind()))
    })
}
