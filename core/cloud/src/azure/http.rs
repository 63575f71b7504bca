//! HTTP plumbing shared by the Azure clients.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use cabinetry_common::{Error, Result};

/// Header carrying the error code on storage data plane responses.
const STORAGE_ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// `{"error": {"code": ..., "message": ...}}`, as returned by ARM and Key Vault.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Build the HTTP client used by every Azure client.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("cabinetry/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Map a transport failure (no usable response).
pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Turn a failed response into a provider rejection carrying its code.
pub(crate) async fn rejection(response: Response) -> Error {
    let status = response.status();
    let header_code = response
        .headers()
        .get(STORAGE_ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let envelope = serde_json::from_str::<ErrorEnvelope>(&body).ok();

    let code = header_code
        .or_else(|| envelope.as_ref().map(|e| e.error.code.clone()))
        .unwrap_or_else(|| fallback_code(status));
    let message = envelope
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    Error::provider(Some(status.as_u16()), code, message)
}

fn fallback_code(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(|reason| reason.replace(' ', ""))
        .unwrap_or_else(|| format!("Http{}", status.as_u16()))
}

/// Decode a successful JSON response, or reject.
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if response.status().is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    } else {
        Err(rejection(response).await)
    }
}
