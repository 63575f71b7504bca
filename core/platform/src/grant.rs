//! One-time role grant on a newly created vault, and the wait for it to
//! take effect.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use cabinetry_cloud::{ManagementApi, RoleAssignmentRequest, SecretApi, Vault};
use cabinetry_common::{Error, Result};

use crate::reconciler::ReconciliationResult;

/// Secret read by [`VaultSecretProbe`]; it is never written.
pub const PROBE_SECRET_NAME: &str = "cabinetry-authorization-probe";

/// A role granted to a principal on a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub principal_id: String,
    /// Fully qualified role definition id.
    pub role_id: String,
    /// Resource id of the vault.
    pub scope: String,
    pub assignment_id: Uuid,
}

/// Backoff for polling grant propagation.
#[derive(Debug, Clone)]
pub struct PropagationPolicy {
    /// Give up after this long.
    pub timeout: Duration,
    /// Initial delay between checks.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl PropagationPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for PropagationPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Checks whether a grant is in effect yet.
#[async_trait]
pub trait AuthorizationProbe: Send + Sync {
    /// `Ok(false)` means "not yet"; errors abort the wait.
    async fn is_authorized(&self) -> Result<bool>;
}

/// Probes a vault by reading a sentinel secret.
///
/// Absent-but-readable counts as authorized, `Forbidden` as not yet.
pub struct VaultSecretProbe {
    secrets: Arc<dyn SecretApi>,
    vault: Vault,
}

impl VaultSecretProbe {
    pub fn new(secrets: Arc<dyn SecretApi>, vault: Vault) -> Self {
        Self { secrets, vault }
    }
}

#[async_trait]
impl AuthorizationProbe for VaultSecretProbe {
    async fn is_authorized(&self) -> Result<bool> {
        match self.secrets.get_secret(&self.vault, PROBE_SECRET_NAME).await {
            Ok(_) => Ok(true),
            Err(err) if err.provider_code() == Some("SecretNotFound") => Ok(true),
            Err(err) if err.provider_code() == Some("Forbidden") || err.provider_status() == Some(403) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Fully qualified id of a built-in role in `subscription_id`.
pub fn role_definition_id(subscription_id: &str, role_id: &str) -> String {
    format!(
        "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
        subscription_id, role_id
    )
}

/// Grants the executing principal access to a vault it just created.
pub struct AccessGrantManager {
    management: Arc<dyn ManagementApi>,
    subscription_id: String,
    policy: PropagationPolicy,
}

impl AccessGrantManager {
    pub fn new(
        management: Arc<dyn ManagementApi>,
        subscription_id: impl Into<String>,
        policy: PropagationPolicy,
    ) -> Self {
        Self {
            management,
            subscription_id: subscription_id.into(),
            policy,
        }
    }

    /// Grant `role_id` to `principal_id` on the vault, only if the vault was
    /// created by the reconciliation that produced `vault_result`.
    ///
    /// No check for an existing identical assignment is made; the
    /// `created` flag is the only guard.
    ///
    /// # Errors
    /// - `vault_result` does not hold a vault
    /// - Role assignment rejected
    pub async fn grant_if_first_creation(
        &self,
        vault_result: &ReconciliationResult,
        principal_id: &str,
        role_id: &str,
    ) -> Result<Option<AccessGrant>> {
        let vault = vault_result.resource.as_vault().ok_or_else(|| {
            Error::InvalidInput(format!(
                "access grants apply to key vaults, not {}",
                vault_result.resource.kind()
            ))
        })?;

        if !vault_result.created {
            debug!("Key vault {} already existed; no role grant", vault.name);
            return Ok(None);
        }

        let request = RoleAssignmentRequest {
            scope: vault.id.clone(),
            role_definition_id: role_definition_id(&self.subscription_id, role_id),
            principal_id: principal_id.to_string(),
            assignment_id: Uuid::new_v4(),
        };

        info!(
            "Granting role {} on key vault {} to {}",
            role_id, vault.name, principal_id
        );
        self.management.create_role_assignment(&request).await?;

        Ok(Some(AccessGrant {
            principal_id: request.principal_id,
            role_id: request.role_definition_id,
            scope: request.scope,
            assignment_id: request.assignment_id,
        }))
    }

    /// Poll `probe` until the grant is in effect.
    ///
    /// Returns the number of checks made.
    ///
    /// # Errors
    /// - [`Error::Timeout`] when the policy's timeout elapses first
    /// - Any probe error
    pub async fn await_propagation(&self, probe: &dyn AuthorizationProbe) -> Result<u32> {
        let deadline = Instant::now() + self.policy.timeout;
        let mut attempt = 0;

        loop {
            if probe.is_authorized().await? {
                if attempt > 0 {
                    info!("Role assignment took effect after {} checks", attempt + 1);
                }
                return Ok(attempt + 1);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            if Instant::now() + delay > deadline {
                return Err(Error::Timeout(format!(
                    "role assignment not effective after {:?}",
                    self.policy.timeout
                )));
            }

            debug!("Role assignment not effective yet, checking again in {:?}", delay);
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{ProvisioningDefaults, ResourceReconciler, ResourceHandle};
    use cabinetry_cloud::{MemoryCloud, Operation, VaultParams};
    use cabinetry_common::ResourceDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> PropagationPolicy {
        PropagationPolicy::new(Duration::from_secs(2))
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    async fn vault_result(cloud: &MemoryCloud) -> ReconciliationResult {
        let reconciler =
            ResourceReconciler::new(Arc::new(cloud.clone()), ProvisioningDefaults::new("tenant"));
        reconciler
            .ensure_exists(&ResourceDescriptor::group("demo-rg", "westeurope").unwrap())
            .await
            .unwrap();
        reconciler
            .ensure_exists(&ResourceDescriptor::vault("demo-rg", "demo-kv", "westeurope").unwrap())
            .await
            .unwrap()
    }

    /// Not authorized for the first `pending` checks.
    struct CountingProbe {
        pending: u32,
        checks: AtomicU32,
    }

    #[async_trait]
    impl AuthorizationProbe for CountingProbe {
        async fn is_authorized(&self) -> Result<bool> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(n >= self.pending)
        }
    }

    #[test]
    fn test_delay_calculation() {
        let policy = PropagationPolicy::new(Duration::from_secs(60))
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_with_custom_multiplier() {
        let policy = PropagationPolicy::new(Duration::from_secs(60))
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(5000))
            .with_backoff_multiplier(3.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_with_jitter() {
        let policy = PropagationPolicy::new(Duration::from_secs(60))
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter(true);

        for _ in 0..10 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_role_definition_id() {
        assert_eq!(
            role_definition_id("sub", "b86a8fe4-44ce-4948-aee5-eccb2c155cd7"),
            "/subscriptions/sub/providers/Microsoft.Authorization/roleDefinitions/b86a8fe4-44ce-4948-aee5-eccb2c155cd7"
        );
    }

    #[tokio::test]
    async fn test_grant_once_on_creation() {
        let cloud = MemoryCloud::new("sub");
        let manager = AccessGrantManager::new(Arc::new(cloud.clone()), "sub", fast_policy());
        let result = vault_result(&cloud).await;
        assert!(result.created);

        let grant = manager
            .grant_if_first_creation(&result, "oid-1", "role-guid")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(grant.scope, result.resource.id());
        assert_eq!(grant.principal_id, "oid-1");
        assert!(grant.role_id.ends_with("/roleDefinitions/role-guid"));
        assert_eq!(cloud.count(Operation::CreateRoleAssignment), 1);
        assert_eq!(cloud.role_assignments()[0].scope, result.resource.id());
    }

    #[tokio::test]
    async fn test_no_grant_for_existing_vault() {
        let cloud = MemoryCloud::new("sub");
        let manager = AccessGrantManager::new(Arc::new(cloud.clone()), "sub", fast_policy());
        let mut result = vault_result(&cloud).await;
        result.created = false;

        let grant = manager
            .grant_if_first_creation(&result, "oid-1", "role-guid")
            .await
            .unwrap();

        assert!(grant.is_none());
        assert_eq!(cloud.count(Operation::CreateRoleAssignment), 0);
    }

    #[tokio::test]
    async fn test_grant_requires_vault() {
        let cloud = MemoryCloud::new("sub");
        let manager = AccessGrantManager::new(Arc::new(cloud.clone()), "sub", fast_policy());
        let group = cloud.create_resource_group("demo-rg", "westeurope").await;
        let result = ReconciliationResult {
            resource: ResourceHandle::Group(group.unwrap()),
            created: true,
        };

        assert!(matches!(
            manager.grant_if_first_creation(&result, "oid", "role").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_await_propagation_polls_until_authorized() {
        let manager =
            AccessGrantManager::new(Arc::new(MemoryCloud::new("sub")), "sub", fast_policy());
        let probe = CountingProbe {
            pending: 3,
            checks: AtomicU32::new(0),
        };

        assert_eq!(manager.await_propagation(&probe).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_await_propagation_times_out() {
        let policy = PropagationPolicy::new(Duration::from_millis(30))
            .with_initial_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false);
        let manager = AccessGrantManager::new(Arc::new(MemoryCloud::new("sub")), "sub", policy);
        let probe = CountingProbe {
            pending: u32::MAX,
            checks: AtomicU32::new(0),
        };

        assert!(matches!(
            manager.await_propagation(&probe).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_probe_tracks_enforcement() {
        let cloud = MemoryCloud::new("sub").with_rbac_enforcement(1);
        let vault = {
            cloud.create_resource_group("demo-rg", "westeurope").await.unwrap();
            cloud
                .create_vault(
                    "demo-rg",
                    "demo-kv",
                    &VaultParams::standard_rbac("westeurope", "tenant"),
                )
                .await
                .unwrap()
        };
        let probe = VaultSecretProbe::new(Arc::new(cloud.clone()), vault.clone());

        // No assignment yet.
        assert!(!probe.is_authorized().await.unwrap());

        let manager = AccessGrantManager::new(Arc::new(cloud.clone()), "sub", fast_policy());
        let result = ReconciliationResult {
            resource: ResourceHandle::Vault(vault),
            created: true,
        };
        manager
            .grant_if_first_creation(&result, "oid", "role")
            .await
            .unwrap();

        // One refused read of lag, then the sentinel is readable-but-absent.
        assert_eq!(manager.await_propagation(&probe).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_vault_probe_propagates_other_errors() {
        let cloud = MemoryCloud::new("sub");
        cloud.create_resource_group("demo-rg", "westeurope").await.unwrap();
        let vault = cloud
            .create_vault(
                "demo-rg",
                "demo-kv",
                &VaultParams::standard_rbac("westeurope", "tenant"),
            )
            .await
            .unwrap();
        cloud.fail_next(Operation::GetSecret, 500, "InternalServerError");

        let probe = VaultSecretProbe::new(Arc::new(cloud), vault);
        assert!(probe.is_authorized().await.is_err());
    }
}
