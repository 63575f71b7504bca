//! Azure Resource Manager client (control plane).

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use cabinetry_common::{Error, Result};

use super::http::{read_json, transport_error};
use crate::api::{
    AccountKey, ManagementApi, ResourceGroup, RoleAssignment, RoleAssignmentRequest,
    StorageAccount, StorageAccountParams, Subscription, Vault, VaultParams,
};
use crate::credential::{TokenCredential, MANAGEMENT_SCOPE};

/// Public cloud resource manager endpoint.
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com/";

const SUBSCRIPTION_API_VERSION: &str = "2022-12-01";
const RESOURCE_GROUP_API_VERSION: &str = "2021-04-01";
const STORAGE_API_VERSION: &str = "2023-01-01";
const KEY_VAULT_API_VERSION: &str = "2022-07-01";
const ROLE_ASSIGNMENT_API_VERSION: &str = "2022-04-01";

/// How long to wait for a created resource to reach `Succeeded`.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningWait {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProvisioningWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionDto {
    subscription_id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ResourceGroupDto {
    id: String,
    name: String,
    location: String,
}

#[derive(Debug, Deserialize)]
struct StorageAccountDto {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    properties: StorageAccountProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageAccountProperties {
    provisioning_state: Option<String>,
    primary_endpoints: Option<PrimaryEndpoints>,
}

#[derive(Debug, Deserialize)]
struct PrimaryEndpoints {
    blob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VaultDto {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    properties: VaultProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultProperties {
    provisioning_state: Option<String>,
    vault_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyListDto {
    keys: Vec<KeyDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDto {
    key_name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RoleAssignmentDto {
    id: String,
    properties: RoleAssignmentProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleAssignmentProperties {
    scope: String,
    role_definition_id: String,
    principal_id: String,
}

/// Resources that report a provisioning state.
trait Provisioned {
    fn provisioning_state(&self) -> Option<&str>;
}

impl Provisioned for StorageAccountDto {
    fn provisioning_state(&self) -> Option<&str> {
        self.properties.provisioning_state.as_deref()
    }
}

impl Provisioned for VaultDto {
    fn provisioning_state(&self) -> Option<&str> {
        self.properties.provisioning_state.as_deref()
    }
}

fn parse_endpoint(value: &str, what: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Serialization(format!("invalid {} '{}': {}", what, value, e)))
}

impl StorageAccountDto {
    fn into_model(self) -> Result<StorageAccount> {
        let blob = match self.properties.primary_endpoints.and_then(|e| e.blob) {
            Some(blob) => blob,
            None => format!("https://{}.blob.core.windows.net/", self.name),
        };
        Ok(StorageAccount {
            blob_endpoint: parse_endpoint(&blob, "blob endpoint")?,
            id: self.id,
            name: self.name,
            location: self.location,
        })
    }
}

impl VaultDto {
    fn into_model(self) -> Result<Vault> {
        let uri = match self.properties.vault_uri {
            Some(uri) => uri,
            None => format!("https://{}.vault.azure.net/", self.name),
        };
        Ok(Vault {
            vault_uri: parse_endpoint(&uri, "vault URI")?,
            id: self.id,
            name: self.name,
            location: self.location,
        })
    }
}

/// Resource manager client scoped to one subscription.
pub struct ArmClient {
    http: Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: Url,
    subscription_id: String,
    wait: ProvisioningWait,
}

impl ArmClient {
    pub fn new(
        http: Client,
        credential: Arc<dyn TokenCredential>,
        endpoint: Url,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credential,
            endpoint,
            subscription_id: subscription_id.into(),
            wait: ProvisioningWait::default(),
        }
    }

    pub fn with_provisioning_wait(mut self, wait: ProvisioningWait) -> Self {
        self.wait = wait;
        self
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.credential.get_token(&[MANAGEMENT_SCOPE]).await?;
        Ok(format!("Bearer {}", token.secret()))
    }

    fn url(&self, path: &str, api_version: &str) -> Result<Url> {
        let mut url = self
            .endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("invalid resource path '{}': {}", path, e)))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn group_path(&self, group: &str) -> String {
        format!(
            "subscriptions/{}/resourceGroups/{}",
            self.subscription_id, group
        )
    }

    fn storage_path(&self, group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Storage/storageAccounts/{}",
            self.group_path(group),
            name
        )
    }

    fn vault_path(&self, group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.KeyVault/vaults/{}",
            self.group_path(group),
            name
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> Result<T> {
        let url = self.url(path, api_version)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("Resource manager request failed", e))?;

        read_json(response).await
    }

    /// PUT a resource body. Returns `None` when the request was accepted
    /// for asynchronous completion.
    async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
        body: &serde_json::Value,
    ) -> Result<Option<T>> {
        let url = self.url(path, api_version)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, auth)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("Resource manager request failed", e))?;

        if response.status() == StatusCode::ACCEPTED {
            return Ok(None);
        }
        read_json(response).await.map(Some)
    }

    /// Poll a resource until its provisioning state is `Succeeded`.
    ///
    /// # Errors
    /// - Provisioning ends in `Failed` or `Canceled`
    /// - The wait exceeds the configured timeout
    async fn wait_until_provisioned<T>(&self, path: &str, api_version: &str) -> Result<T>
    where
        T: DeserializeOwned + Provisioned,
    {
        let deadline = Instant::now() + self.wait.timeout;
        loop {
            let resource: T = self.get_json(path, api_version).await?;
            match resource.provisioning_state() {
                None | Some("Succeeded") => return Ok(resource),
                Some(state @ ("Failed" | "Canceled")) => {
                    return Err(Error::provider(
                        None,
                        "ProvisioningFailed",
                        format!("{} ended in state {}", path, state),
                    ));
                }
                Some(state) => debug!("{} is {}", path, state),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} was not provisioned within {:?}",
                    path, self.wait.timeout
                )));
            }
            tokio::time::sleep(self.wait.interval).await;
        }
    }
}

#[async_trait]
impl ManagementApi for ArmClient {
    async fn get_subscription(&self) -> Result<Subscription> {
        let dto: SubscriptionDto = self
            .get_json(
                &format!("subscriptions/{}", self.subscription_id),
                SUBSCRIPTION_API_VERSION,
            )
            .await?;
        Ok(Subscription {
            id: dto.subscription_id,
            display_name: dto.display_name,
        })
    }

    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup> {
        let dto: ResourceGroupDto = self
            .get_json(&self.group_path(name), RESOURCE_GROUP_API_VERSION)
            .await?;
        Ok(ResourceGroup {
            id: dto.id,
            name: dto.name,
            location: dto.location,
        })
    }

    async fn create_resource_group(&self, name: &str, location: &str) -> Result<ResourceGroup> {
        let path = self.group_path(name);
        let body = json!({ "location": location });
        let dto: ResourceGroupDto = match self
            .put_json(&path, RESOURCE_GROUP_API_VERSION, &body)
            .await?
        {
            Some(dto) => dto,
            None => self.get_json(&path, RESOURCE_GROUP_API_VERSION).await?,
        };
        Ok(ResourceGroup {
            id: dto.id,
            name: dto.name,
            location: dto.location,
        })
    }

    async fn get_storage_account(&self, group: &str, name: &str) -> Result<StorageAccount> {
        let dto: StorageAccountDto = self
            .get_json(&self.storage_path(group, name), STORAGE_API_VERSION)
            .await?;
        dto.into_model()
    }

    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        params: &StorageAccountParams,
    ) -> Result<StorageAccount> {
        let path = self.storage_path(group, name);
        let body = json!({
            "location": params.location,
            "sku": { "name": params.sku },
            "kind": params.kind,
            "properties": {
                "minimumTlsVersion": "TLS1_2",
                "allowBlobPublicAccess": false,
                "supportsHttpsTrafficOnly": true
            }
        });

        let created: Option<StorageAccountDto> =
            self.put_json(&path, STORAGE_API_VERSION, &body).await?;
        let dto = match created {
            Some(dto) if dto.provisioning_state() == Some("Succeeded") => dto,
            _ => {
                self.wait_until_provisioned(&path, STORAGE_API_VERSION)
                    .await?
            }
        };
        dto.into_model()
    }

    async fn list_storage_account_keys(&self, group: &str, name: &str) -> Result<Vec<AccountKey>> {
        let url = self.url(
            &format!("{}/listKeys", self.storage_path(group, name)),
            STORAGE_API_VERSION,
        )?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| transport_error("Failed to list storage account keys", e))?;

        let list: KeyListDto = read_json(response).await?;
        Ok(list
            .keys
            .into_iter()
            .map(|k| AccountKey::new(k.key_name, k.value))
            .collect())
    }

    async fn get_vault(&self, group: &str, name: &str) -> Result<Vault> {
        let dto: VaultDto = self
            .get_json(&self.vault_path(group, name), KEY_VAULT_API_VERSION)
            .await?;
        dto.into_model()
    }

    async fn create_vault(&self, group: &str, name: &str, params: &VaultParams) -> Result<Vault> {
        let path = self.vault_path(group, name);
        let body = json!({
            "location": params.location,
            "properties": {
                "tenantId": params.tenant_id,
                "sku": { "family": params.sku_family, "name": params.sku_name },
                "enableRbacAuthorization": params.enable_rbac_authorization,
                "enableSoftDelete": params.enable_soft_delete,
                "accessPolicies": []
            }
        });

        let created: Option<VaultDto> = self.put_json(&path, KEY_VAULT_API_VERSION, &body).await?;
        let dto = match created {
            Some(dto) if dto.provisioning_state() == Some("Succeeded") => dto,
            _ => {
                self.wait_until_provisioned(&path, KEY_VAULT_API_VERSION)
                    .await?
            }
        };
        dto.into_model()
    }

    async fn create_role_assignment(
        &self,
        request: &RoleAssignmentRequest,
    ) -> Result<RoleAssignment> {
        let path = format!(
            "{}/providers/Microsoft.Authorization/roleAssignments/{}",
            request.scope.trim_end_matches('/'),
            request.assignment_id
        );
        let body = json!({
            "properties": {
                "roleDefinitionId": request.role_definition_id,
                "principalId": request.principal_id
            }
        });

        let created: Option<RoleAssignmentDto> = self
            .put_json(&path, ROLE_ASSIGNMENT_API_VERSION, &body)
            .await?;
        let dto = match created {
            Some(dto) => dto,
            None => self.get_json(&path, ROLE_ASSIGNMENT_API_VERSION).await?,
        };
        Ok(RoleAssignment {
            id: dto.id,
            scope: dto.properties.scope,
            role_definition_id: dto.properties.role_definition_id,
            principal_id: dto.properties.principal_id,
        })
    }
}
