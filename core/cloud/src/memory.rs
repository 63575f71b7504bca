//! In-memory cloud backend for testing.
//!
//! Implements every collaborator trait against process-local state and
//! reports failures with the same codes the real provider uses. Every call
//! is journaled so tests can assert ordering, and failures can be injected
//! per operation.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use url::Url;
use uuid::Uuid;

use cabinetry_common::naming::{validate_container_name, validate_secret_name};
use cabinetry_common::{Error, ProviderError, Result};

use crate::api::{
    AccountKey, BlobApi, CloudBackend, ManagementApi, ResourceGroup, RoleAssignment,
    RoleAssignmentRequest, SasPermissions, SecretApi, StorageAccount, StorageAccountParams,
    Subscription, Vault, VaultParams,
};
use crate::credential::{unsigned_jwt, StaticTokenCredential};
use crate::sas::ContainerSas;

/// Principal the in-memory backend's token is issued to.
pub const MEMORY_PRINCIPAL_ID: &str = "00000000-0000-0000-0000-00000000c0de";

/// Operations recorded in the journal and targeted by fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetSubscription,
    GetResourceGroup,
    CreateResourceGroup,
    GetStorageAccount,
    CreateStorageAccount,
    ListStorageAccountKeys,
    GetVault,
    CreateVault,
    CreateRoleAssignment,
    ContainerExists,
    CreateContainer,
    DeleteContainer,
    GenerateSas,
    SetSecret,
    GetSecret,
    DeleteSecret,
}

/// One journaled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    /// Resource the call addressed, e.g. `demo-rg/demosa` or `demo-kv/reports`.
    pub target: String,
}

struct AccountEntry {
    account: StorageAccount,
    keys: Vec<AccountKey>,
}

struct VaultEntry {
    vault: Vault,
    rbac: bool,
}

#[derive(Default)]
struct State {
    groups: HashMap<String, ResourceGroup>,
    accounts: HashMap<(String, String), AccountEntry>,
    vaults: HashMap<(String, String), VaultEntry>,
    /// Containers keyed by storage account name.
    containers: HashMap<String, BTreeSet<String>>,
    /// Secrets keyed by vault name.
    secrets: HashMap<String, HashMap<String, String>>,
    assignments: Vec<RoleAssignment>,
    journal: Vec<Call>,
    faults: HashMap<Operation, VecDeque<ProviderError>>,
    /// Secret reads still refused after the first assignment on a vault.
    rbac_lag: HashMap<String, u32>,
}

/// In-memory cloud.
///
/// Cheap to clone; clones share state. All data is lost on drop.
#[derive(Clone)]
pub struct MemoryCloud {
    subscription_id: String,
    enforce_rbac: bool,
    authorization_lag: u32,
    state: Arc<RwLock<State>>,
}

impl MemoryCloud {
    /// Create an empty cloud for `subscription_id`.
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            enforce_rbac: false,
            authorization_lag: 0,
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Refuse secret access on RBAC vaults until a role is assigned on
    /// them, and keep refusing for `lag` further reads to mimic propagation.
    pub fn with_rbac_enforcement(mut self, lag: u32) -> Self {
        self.enforce_rbac = true;
        self.authorization_lag = lag;
        self
    }

    /// Bundle this cloud as a backend with a local token for `principal_id`.
    pub fn into_backend(self, principal_id: &str) -> CloudBackend {
        let token = unsigned_jwt(&serde_json::json!({ "oid": principal_id }));
        let cloud = Arc::new(self);
        CloudBackend {
            name: "memory".to_string(),
            management: cloud.clone(),
            blobs: cloud.clone(),
            secrets: cloud,
            credential: Arc::new(StaticTokenCredential::new(token)),
        }
    }

    /// Make the next call of `operation` fail with the given status and code.
    pub fn fail_next(&self, operation: Operation, status: u16, code: &str) {
        let mut state = self.state.write().unwrap();
        state
            .faults
            .entry(operation)
            .or_default()
            .push_back(ProviderError::new(
                Some(status),
                code,
                format!("injected failure for {:?}", operation),
            ));
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<Call> {
        self.state.read().unwrap().journal.clone()
    }

    /// Number of journaled calls of `operation`.
    pub fn count(&self, operation: Operation) -> usize {
        self.state
            .read()
            .unwrap()
            .journal
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Role assignments created so far.
    pub fn role_assignments(&self) -> Vec<RoleAssignment> {
        self.state.read().unwrap().assignments.clone()
    }

    /// Whether `container` exists in storage account `account`.
    pub fn has_container(&self, account: &str, container: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .containers
            .get(account)
            .is_some_and(|set| set.contains(container))
    }

    /// Raw secret value, bypassing authorization and the journal.
    pub fn secret_value(&self, vault: &str, name: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .secrets
            .get(vault)
            .and_then(|m| m.get(name).cloned())
    }

    /// Create a container behind the platform's back.
    pub fn seed_container(&self, account: &str, container: &str) {
        let mut state = self.state.write().unwrap();
        state
            .containers
            .entry(account.to_string())
            .or_default()
            .insert(container.to_string());
    }

    /// Remove a secret behind the platform's back.
    pub fn remove_secret(&self, vault: &str, name: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(secrets) = state.secrets.get_mut(vault) {
            secrets.remove(name);
        }
    }

    /// Record the call and pop any injected failure for it.
    fn enter(&self, operation: Operation, target: impl Into<String>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.journal.push(Call {
            operation,
            target: target.into(),
        });
        match state.faults.get_mut(&operation).and_then(|q| q.pop_front()) {
            Some(err) => Err(Error::ProviderRejected(err)),
            None => Ok(()),
        }
    }

    fn group_id(&self, group: &str) -> String {
        format!("/subscriptions/{}/resourceGroups/{}", self.subscription_id, group)
    }

    fn require_group(state: &State, group: &str) -> Result<()> {
        if state.groups.contains_key(group) {
            Ok(())
        } else {
            Err(Error::provider(
                Some(404),
                "ResourceGroupNotFound",
                format!("Resource group '{}' could not be found.", group),
            ))
        }
    }

    fn resource_not_found(kind: &str, group: &str, name: &str) -> Error {
        Error::provider(
            Some(404),
            "ResourceNotFound",
            format!(
                "The Resource '{}/{}' under resource group '{}' was not found.",
                kind, name, group
            ),
        )
    }

    /// Container naming rejections, coded the way the blob service codes them.
    fn check_container_name(name: &str) -> Result<()> {
        match validate_container_name(name) {
            Ok(()) => Ok(()),
            Err(Error::InvalidName { reason, .. }) if !(3..=63).contains(&name.chars().count()) => {
                Err(Error::provider(
                    Some(400),
                    "OutOfRangeInput",
                    format!(
                        "The specified resource name length is not within the permissible limits: {}",
                        reason
                    ),
                ))
            }
            Err(Error::InvalidName { reason, .. }) => Err(Error::provider(
                Some(400),
                "InvalidResourceName",
                format!("The specified resource name contains invalid characters: {}", reason),
            )),
            Err(other) => Err(other),
        }
    }

    /// Refuse secret access on RBAC vaults that are not (yet) authorized.
    fn authorize_secret_access(&self, state: &mut State, vault: &Vault) -> Result<()> {
        if !self.enforce_rbac {
            return Ok(());
        }
        let rbac = state
            .vaults
            .values()
            .any(|entry| entry.vault.name == vault.name && entry.rbac);
        if !rbac {
            return Ok(());
        }

        let assigned = state.assignments.iter().any(|a| a.scope == vault.id);
        let lag = state.rbac_lag.get(&vault.name).copied().unwrap_or(0);
        if assigned && lag == 0 {
            return Ok(());
        }
        if assigned {
            state.rbac_lag.insert(vault.name.clone(), lag - 1);
        }
        Err(Error::provider(
            Some(403),
            "Forbidden",
            format!("Caller is not authorized to access secrets in vault '{}'.", vault.name),
        ))
    }
}

#[async_trait]
impl ManagementApi for MemoryCloud {
    async fn get_subscription(&self) -> Result<Subscription> {
        self.enter(Operation::GetSubscription, &self.subscription_id)?;
        Ok(Subscription {
            id: self.subscription_id.clone(),
            display_name: "In-memory subscription".to_string(),
        })
    }

    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup> {
        self.enter(Operation::GetResourceGroup, name)?;
        let state = self.state.read().unwrap();
        Self::require_group(&state, name)?;
        Ok(state.groups[name].clone())
    }

    async fn create_resource_group(&self, name: &str, location: &str) -> Result<ResourceGroup> {
        self.enter(Operation::CreateResourceGroup, name)?;
        let group = ResourceGroup {
            id: self.group_id(name),
            name: name.to_string(),
            location: location.to_string(),
        };
        let mut state = self.state.write().unwrap();
        let group = state
            .groups
            .entry(name.to_string())
            .or_insert(group)
            .clone();
        Ok(group)
    }

    async fn get_storage_account(&self, group: &str, name: &str) -> Result<StorageAccount> {
        self.enter(Operation::GetStorageAccount, format!("{}/{}", group, name))?;
        let state = self.state.read().unwrap();
        Self::require_group(&state, group)?;
        state
            .accounts
            .get(&(group.to_string(), name.to_string()))
            .map(|entry| entry.account.clone())
            .ok_or_else(|| Self::resource_not_found("Microsoft.Storage/storageAccounts", group, name))
    }

    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        params: &StorageAccountParams,
    ) -> Result<StorageAccount> {
        self.enter(Operation::CreateStorageAccount, format!("{}/{}", group, name))?;
        let mut state = self.state.write().unwrap();
        Self::require_group(&state, group)?;

        let blob_endpoint = Url::parse(&format!("https://{}.blob.core.windows.net/", name))
            .map_err(|e| Error::provider(Some(400), "AccountNameInvalid", e.to_string()))?;
        let account = StorageAccount {
            id: format!(
                "{}/providers/Microsoft.Storage/storageAccounts/{}",
                self.group_id(group),
                name
            ),
            name: name.to_string(),
            location: params.location.clone(),
            blob_endpoint,
        };
        let keys = vec![
            AccountKey::new("key1", STANDARD.encode(Uuid::new_v4().as_bytes())),
            AccountKey::new("key2", STANDARD.encode(Uuid::new_v4().as_bytes())),
        ];

        let entry = state
            .accounts
            .entry((group.to_string(), name.to_string()))
            .or_insert(AccountEntry { account, keys });
        Ok(entry.account.clone())
    }

    async fn list_storage_account_keys(&self, group: &str, name: &str) -> Result<Vec<AccountKey>> {
        self.enter(Operation::ListStorageAccountKeys, format!("{}/{}", group, name))?;
        let state = self.state.read().unwrap();
        state
            .accounts
            .get(&(group.to_string(), name.to_string()))
            .map(|entry| entry.keys.clone())
            .ok_or_else(|| Self::resource_not_found("Microsoft.Storage/storageAccounts", group, name))
    }

    async fn get_vault(&self, group: &str, name: &str) -> Result<Vault> {
        self.enter(Operation::GetVault, format!("{}/{}", group, name))?;
        let state = self.state.read().unwrap();
        Self::require_group(&state, group)?;
        state
            .vaults
            .get(&(group.to_string(), name.to_string()))
            .map(|entry| entry.vault.clone())
            .ok_or_else(|| Self::resource_not_found("Microsoft.KeyVault/vaults", group, name))
    }

    async fn create_vault(&self, group: &str, name: &str, params: &VaultParams) -> Result<Vault> {
        self.enter(Operation::CreateVault, format!("{}/{}", group, name))?;
        let mut state = self.state.write().unwrap();
        Self::require_group(&state, group)?;

        let vault_uri = Url::parse(&format!("https://{}.vault.azure.net/", name))
            .map_err(|e| Error::provider(Some(400), "VaultNameNotValid", e.to_string()))?;
        let vault = Vault {
            id: format!(
                "{}/providers/Microsoft.KeyVault/vaults/{}",
                self.group_id(group),
                name
            ),
            name: name.to_string(),
            location: params.location.clone(),
            vault_uri,
        };
        let lag = self.authorization_lag;
        state.rbac_lag.entry(name.to_string()).or_insert(lag);

        let entry = state
            .vaults
            .entry((group.to_string(), name.to_string()))
            .or_insert(VaultEntry {
                vault,
                rbac: params.enable_rbac_authorization,
            });
        Ok(entry.vault.clone())
    }

    async fn create_role_assignment(
        &self,
        request: &RoleAssignmentRequest,
    ) -> Result<RoleAssignment> {
        self.enter(Operation::CreateRoleAssignment, &request.scope)?;
        let assignment = RoleAssignment {
            id: format!(
                "{}/providers/Microsoft.Authorization/roleAssignments/{}",
                request.scope, request.assignment_id
            ),
            scope: request.scope.clone(),
            role_definition_id: request.role_definition_id.clone(),
            principal_id: request.principal_id.clone(),
        };

        let mut state = self.state.write().unwrap();
        if state.assignments.iter().any(|a| a.id == assignment.id) {
            return Err(Error::provider(
                Some(409),
                "RoleAssignmentExists",
                "The role assignment already exists.",
            ));
        }
        state.assignments.push(assignment.clone());
        Ok(assignment)
    }
}

#[async_trait]
impl BlobApi for MemoryCloud {
    async fn container_exists(&self, account: &StorageAccount, name: &str) -> Result<bool> {
        self.enter(Operation::ContainerExists, format!("{}/{}", account.name, name))?;
        Self::check_container_name(name)?;
        Ok(self.has_container(&account.name, name))
    }

    async fn create_container_if_absent(
        &self,
        account: &StorageAccount,
        name: &str,
    ) -> Result<bool> {
        self.enter(Operation::CreateContainer, format!("{}/{}", account.name, name))?;
        Self::check_container_name(name)?;
        let mut state = self.state.write().unwrap();
        Ok(state
            .containers
            .entry(account.name.clone())
            .or_default()
            .insert(name.to_string()))
    }

    async fn delete_container(&self, account: &StorageAccount, name: &str) -> Result<bool> {
        self.enter(Operation::DeleteContainer, format!("{}/{}", account.name, name))?;
        Self::check_container_name(name)?;
        let mut state = self.state.write().unwrap();
        Ok(state
            .containers
            .get_mut(&account.name)
            .is_some_and(|set| set.remove(name)))
    }

    async fn generate_sas_uri(
        &self,
        account: &StorageAccount,
        key: &AccountKey,
        container: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url> {
        self.enter(Operation::GenerateSas, format!("{}/{}", account.name, container))?;
        ContainerSas::new(&account.name, container, permissions, expiry)
            .to_uri(&account.blob_endpoint, key)
    }
}

#[async_trait]
impl SecretApi for MemoryCloud {
    async fn set_secret(&self, vault: &Vault, name: &str, value: &str) -> Result<()> {
        self.enter(Operation::SetSecret, format!("{}/{}", vault.name, name))?;
        validate_secret_name(name).map_err(|e| {
            Error::provider(Some(400), "BadParameter", e.to_string())
        })?;
        let mut state = self.state.write().unwrap();
        self.authorize_secret_access(&mut state, vault)?;
        state
            .secrets
            .entry(vault.name.clone())
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_secret(&self, vault: &Vault, name: &str) -> Result<String> {
        self.enter(Operation::GetSecret, format!("{}/{}", vault.name, name))?;
        let mut state = self.state.write().unwrap();
        self.authorize_secret_access(&mut state, vault)?;
        state
            .secrets
            .get(&vault.name)
            .and_then(|m| m.get(name).cloned())
            .ok_or_else(|| {
                Error::provider(
                    Some(404),
                    "SecretNotFound",
                    format!("A secret with (name/id) {} was not found in this key vault.", name),
                )
            })
    }

    async fn delete_secret(&self, vault: &Vault, name: &str) -> Result<bool> {
        self.enter(Operation::DeleteSecret, format!("{}/{}", vault.name, name))?;
        let mut state = self.state.write().unwrap();
        self.authorize_secret_access(&mut state, vault)?;
        Ok(state
            .secrets
            .get_mut(&vault.name)
            .is_some_and(|m| m.remove(name).is_some()))
    }
}
