//! Blob service client for container lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use url::Url;

use cabinetry_common::Result;

use super::http::{rejection, transport_error};
use crate::api::{AccountKey, BlobApi, SasPermissions, StorageAccount};
use crate::credential::{TokenCredential, STORAGE_SCOPE};
use crate::sas::{child_url, ContainerSas};

/// Blob service REST version sent on every request.
const BLOB_API_VERSION: &str = "2023-11-03";

/// Blob data plane client authenticated with Entra ID bearer tokens.
pub struct BlobClient {
    http: Client,
    credential: Arc<dyn TokenCredential>,
}

impl BlobClient {
    pub fn new(http: Client, credential: Arc<dyn TokenCredential>) -> Self {
        Self { http, credential }
    }

    fn container_url(account: &StorageAccount, name: &str) -> Result<Url> {
        let mut url = child_url(&account.blob_endpoint, &[name])?;
        url.query_pairs_mut().append_pair("restype", "container");
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.credential.get_token(&[STORAGE_SCOPE]).await?;
        Ok(request
            .header(header::AUTHORIZATION, format!("Bearer {}", token.secret()))
            .header("x-ms-version", BLOB_API_VERSION)
            .header(
                "x-ms-date",
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ))
    }
}

#[async_trait]
impl BlobApi for BlobClient {
    async fn container_exists(&self, account: &StorageAccount, name: &str) -> Result<bool> {
        let url = Self::container_url(account, name)?;
        let response = self
            .authorize(self.http.get(url))
            .await?
            .send()
            .await
            .map_err(|e| transport_error("Failed to query container", e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejection(response).await),
        }
    }

    async fn create_container_if_absent(
        &self,
        account: &StorageAccount,
        name: &str,
    ) -> Result<bool> {
        let url = Self::container_url(account, name)?;
        let response = self
            .authorize(self.http.put(url))
            .await?
            .header(header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| transport_error("Failed to create container", e))?;

        if response.status().is_success() {
            return Ok(true);
        }
        let err = rejection(response).await;
        if err.provider_code() == Some("ContainerAlreadyExists") {
            Ok(false)
        } else {
            Err(err)
        }
    }

    async fn delete_container(&self, account: &StorageAccount, name: &str) -> Result<bool> {
        let url = Self::container_url(account, name)?;
        let response = self
            .authorize(self.http.delete(url))
            .await?
            .send()
            .await
            .map_err(|e| transport_error("Failed to delete container", e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejection(response).await),
        }
    }

    async fn generate_sas_uri(
        &self,
        account: &StorageAccount,
        key: &AccountKey,
        container: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url> {
        ContainerSas::new(&account.name, container, permissions, expiry)
            .to_uri(&account.blob_endpoint, key)
    }
}
