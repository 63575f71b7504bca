//! Bearer credentials.
//!
//! A single [`TokenCredential`] is shared (behind an `Arc`) by every client;
//! tokens are requested per call for the scope that call needs.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use cabinetry_common::{Error, Result};

/// Scope for the resource manager (control plane).
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
/// Scope for the blob data plane.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
/// Scope for the key vault data plane.
pub const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// A bearer token with expiration tracking.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    token: String,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Check if the token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken([REDACTED], expires_at={})", self.expires_at)
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Credential name for log output.
    fn name(&self) -> &str;

    /// Obtain a token valid for `scopes`.
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken>;
}

/// A fixed, pre-acquired token.
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        // Lifetime is unknown; treat it as valid for an hour from now.
        Self {
            token: AccessToken::new(token, Utc::now() + Duration::hours(1)),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_token(&self, _scopes: &[&str]) -> Result<AccessToken> {
        Ok(self.token.clone())
    }
}

/// Tries each credential in order and returns the first token obtained.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &str {
        "chained"
    }

    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.get_token(scopes).await {
                Ok(token) => {
                    debug!("Acquired token from {} credential", source.name());
                    return Ok(token);
                }
                Err(err) => failures.push(format!("{}: {}", source.name(), err)),
            }
        }
        Err(Error::Authentication(format!(
            "no credential produced a token ({})",
            failures.join("; ")
        )))
    }
}

/// Extract the object id (`oid` claim) of the principal a JWT was issued to.
///
/// The signature is not verified; the token comes straight from the
/// identity provider and is only inspected for its subject.
pub fn principal_id_from_token(token: &AccessToken) -> Result<String> {
    let payload = token
        .secret()
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Authentication("access token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Authentication(format!("invalid JWT payload encoding: {}", e)))?;

    let claims: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("invalid JWT claims: {}", e)))?;

    claims
        .get("oid")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Authentication("access token has no 'oid' claim".to_string()))
}

/// Build an unsigned JWT carrying `claims`. Used for local tokens.
pub fn unsigned_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}
