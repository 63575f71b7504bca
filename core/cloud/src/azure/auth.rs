//! Entra ID credentials: client secret (OAuth2 client credentials grant)
//! and the Azure CLI login.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use oauth2::{basic::BasicClient, AuthType, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use cabinetry_common::{Error, Result};

use crate::credential::{AccessToken, ChainedCredential, TokenCredential};

/// Default Entra ID authority host.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Environment variables read by [`default_credential`].
pub const CLIENT_ID_ENV: &str = "AZURE_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "AZURE_CLIENT_SECRET";

/// Service principal credential using the client credentials grant.
///
/// Tokens are cached per scope set and reused until they are within five
/// minutes of expiry.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    authority: String,
    http: oauth2::reqwest::Client,
    cache: RwLock<HashMap<String, AccessToken>>,
}

impl ClientSecretCredential {
    /// Create a credential against the public cloud authority.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        Self::with_authority(tenant_id, client_id, client_secret, DEFAULT_AUTHORITY)
    }

    /// Create a credential against a specific authority host.
    pub fn with_authority(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authority: impl Into<String>,
    ) -> Result<Self> {
        // Token endpoints must not be followed through redirects.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            authority: authority.into(),
            http,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn token_url(&self) -> Result<TokenUrl> {
        TokenUrl::new(format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant_id
        ))
        .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))
    }

    /// Request a fresh token from the authority.
    ///
    /// # Errors
    /// - Rejected client credentials
    /// - Network errors
    async fn request_token(&self, scopes: &[&str]) -> Result<AccessToken> {
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.to_string()))
            .set_auth_type(AuthType::RequestBody)
            .set_token_uri(self.token_url()?);

        let mut request = client.exchange_client_credentials();
        for scope in scopes {
            request = request.add_scope(Scope::new(scope.to_string()));
        }

        let token_result = request
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token request failed: {}", e)))?;

        let expires_in = token_result
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(3600));
        let expires_at =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));

        Ok(AccessToken::new(
            token_result.access_token().secret().clone(),
            expires_at,
        ))
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    fn name(&self) -> &str {
        "client-secret"
    }

    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken> {
        let key = scopes.join(" ");

        let cache = self.cache.read().await;
        if let Some(token) = cache.get(&key).filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }
        drop(cache);

        let mut cache = self.cache.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = cache.get(&key).filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }

        tracing::debug!("Requesting token for {}", key);
        let token = self.request_token(scopes).await?;
        cache.insert(key, token.clone());
        Ok(token)
    }
}

/// Output of `az account get-access-token`.
#[derive(Debug, Deserialize)]
struct CliToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    /// Unix timestamp; present on current CLI versions.
    #[serde(rename = "expires_on", default)]
    expires_on: Option<i64>,
}

/// Uses the signed-in Azure CLI account.
#[derive(Debug, Clone, Default)]
pub struct AzureCliCredential {
    tenant_id: Option<String>,
    program: Option<String>,
}

impl AzureCliCredential {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            program: None,
        }
    }

    /// Run a different executable in place of `az`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

fn parse_cli_output(stdout: &[u8]) -> Result<AccessToken> {
    let parsed: CliToken = serde_json::from_slice(stdout)
        .map_err(|e| Error::Serialization(format!("Unexpected Azure CLI output: {}", e)))?;

    let expires_at: DateTime<Utc> = parsed
        .expires_on
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| Utc::now() + Duration::minutes(30));

    Ok(AccessToken::new(parsed.access_token, expires_at))
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &str {
        "azure-cli"
    }

    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken> {
        let scope = scopes
            .first()
            .ok_or_else(|| Error::InvalidInput("a token scope is required".to_string()))?;

        let mut command = Command::new(self.program.as_deref().unwrap_or("az"));
        command.args(["account", "get-access-token", "--output", "json", "--scope", scope]);
        if let Some(tenant) = &self.tenant_id {
            command.args(["--tenant", tenant]);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::Authentication(format!("Failed to run Azure CLI: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Authentication(format!(
                "Azure CLI did not return a token: {}",
                stderr.trim()
            )));
        }

        parse_cli_output(&output.stdout)
    }
}

/// Environment service principal first, then the Azure CLI login.
///
/// The service principal is only part of the chain when both
/// `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET` are set.
pub fn default_credential(tenant_id: &str) -> Result<ChainedCredential> {
    let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::new();

    if let (Ok(client_id), Ok(secret)) = (
        std::env::var(CLIENT_ID_ENV),
        std::env::var(CLIENT_SECRET_ENV),
    ) {
        sources.push(Arc::new(ClientSecretCredential::new(
            tenant_id, client_id, secret,
        )?));
    }
    sources.push(Arc::new(AzureCliCredential::new(Some(tenant_id.to_string()))));

    Ok(ChainedCredential::new(sources))
}
