//! Key Vault secrets client.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use cabinetry_common::Result;

use super::http::{read_json, rejection, transport_error};
use crate::api::{SecretApi, Vault};
use crate::credential::{TokenCredential, VAULT_SCOPE};
use crate::sas::child_url;

const SECRETS_API_VERSION: &str = "7.4";

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

/// Key Vault data plane client for secrets.
pub struct KeyVaultSecrets {
    http: Client,
    credential: Arc<dyn TokenCredential>,
}

impl KeyVaultSecrets {
    pub fn new(http: Client, credential: Arc<dyn TokenCredential>) -> Self {
        Self { http, credential }
    }

    fn secret_url(vault: &Vault, name: &str) -> Result<Url> {
        let mut url = child_url(&vault.vault_uri, &["secrets", name])?;
        url.query_pairs_mut()
            .append_pair("api-version", SECRETS_API_VERSION);
        Ok(url)
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.credential.get_token(&[VAULT_SCOPE]).await?;
        Ok(format!("Bearer {}", token.secret()))
    }
}

#[async_trait]
impl SecretApi for KeyVaultSecrets {
    async fn set_secret(&self, vault: &Vault, name: &str, value: &str) -> Result<()> {
        let url = Self::secret_url(vault, name)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, auth)
            .json(&json!({ "value": value }))
            .send()
            .await
            .map_err(|e| transport_error("Failed to set secret", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    async fn get_secret(&self, vault: &Vault, name: &str) -> Result<String> {
        let url = Self::secret_url(vault, name)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("Failed to get secret", e))?;

        let bundle: SecretBundle = read_json(response).await?;
        Ok(bundle.value)
    }

    async fn delete_secret(&self, vault: &Vault, name: &str) -> Result<bool> {
        let url = Self::secret_url(vault, name)?;
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| transport_error("Failed to delete secret", e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejection(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StaticTokenCredential;
    use mockito::Matcher;

    fn vault(server: &mockito::ServerGuard) -> Vault {
        Vault {
            id: "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/demo-kv"
                .to_string(),
            name: "demo-kv".to_string(),
            location: "westeurope".to_string(),
            vault_uri: Url::parse(&server.url()).unwrap(),
        }
    }

    fn client() -> KeyVaultSecrets {
        KeyVaultSecrets::new(
            Client::new(),
            Arc::new(StaticTokenCredential::new("kv-token")),
        )
    }

    fn api() -> Matcher {
        Matcher::UrlEncoded("api-version".into(), SECRETS_API_VERSION.into())
    }

    #[tokio::test]
    async fn test_set_and_get_secret() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("PUT", "/secrets/reports")
            .match_query(api())
            .match_header("authorization", "Bearer kv-token")
            .match_body(Matcher::Json(json!({ "value": "https://demosa/reports?sig=x" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value":"https://demosa/reports?sig=x","id":"x"}"#)
            .create_async()
            .await;
        let _get = server
            .mock("GET", "/secrets/reports")
            .match_query(api())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value":"https://demosa/reports?sig=x","id":"x"}"#)
            .create_async()
            .await;

        let client = client();
        let vault = vault(&server);
        client
            .set_secret(&vault, "reports", "https://demosa/reports?sig=x")
            .await
            .unwrap();
        assert_eq!(
            client.get_secret(&vault, "reports").await.unwrap(),
            "https://demosa/reports?sig=x"
        );
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_secret_code() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/secrets/nothing")
            .match_query(api())
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"error":{"code":"SecretNotFound","message":"A secret with (name/id) nothing was not found in this key vault."}}"#,
            )
            .create_async()
            .await;

        let err = client()
            .get_secret(&vault(&server), "nothing")
            .await
            .unwrap_err();
        assert_eq!(err.provider_code(), Some("SecretNotFound"));
    }

    #[tokio::test]
    async fn test_forbidden_is_a_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/secrets/probe")
            .match_query(api())
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"code":"Forbidden","message":"Caller is not authorized"}}"#)
            .create_async()
            .await;

        let err = client()
            .get_secret(&vault(&server), "probe")
            .await
            .unwrap_err();
        assert_eq!(err.provider_code(), Some("Forbidden"));
        assert_eq!(err.provider_status(), Some(403));
    }

    #[tokio::test]
    async fn test_delete_secret() {
        let mut server = mockito::Server::new_async().await;
        let _deleted = server
            .mock("DELETE", "/secrets/reports")
            .match_query(api())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _absent = server
            .mock("DELETE", "/secrets/gone")
            .match_query(api())
            .with_status(404)
            .with_body(r#"{"error":{"code":"SecretNotFound","message":"gone"}}"#)
            .create_async()
            .await;

        let client = client();
        let vault = vault(&server);
        assert!(client.delete_secret(&vault, "reports").await.unwrap());
        assert!(!client.delete_secret(&vault, "gone").await.unwrap());
    }

    #[test]
    fn test_secret_url_keeps_name_in_one_segment() {
        let vault = Vault {
            id: "demo-kv".to_string(),
            name: "demo-kv".to_string(),
            location: "westeurope".to_string(),
            vault_uri: Url::parse("https://demo-kv.vault.azure.net/").unwrap(),
        };

        let url = KeyVaultSecrets::secret_url(&vault, "../keys/master").unwrap();
        assert_eq!(url.path(), "/secrets/..%2Fkeys%2Fmaster");

        let url = KeyVaultSecrets::secret_url(&vault, "c1#x").unwrap();
        assert_eq!(url.path(), "/secrets/c1%23x");
        assert_eq!(url.query(), Some("api-version=7.4"));
    }
}
