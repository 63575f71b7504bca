//! Common error types for cabinetry.

use std::fmt;
use thiserror::Error;

/// A failure reported by a remote provider call.
///
/// The provider layer never interprets `code`; callers classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// HTTP status of the failed response, if one was received.
    pub status: Option<u16>,
    /// Provider error code, e.g. `ResourceGroupNotFound` or `Forbidden`.
    pub code: String,
    /// Human readable message from the provider.
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error.
    pub fn new(status: Option<u16>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.code, status, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Top-level error type for cabinetry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource, container or secret absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A remote call failed with a code this crate does not treat as absence.
    #[error("Provider rejected request: {0}")]
    ProviderRejected(ProviderError),

    /// Remote state contradicts itself (e.g. a cabinet without access record).
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// Cabinet operation attempted before the platform was initialized.
    #[error("Platform is not initialized")]
    NotInitialized,

    /// The provider refused a name.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Credential acquisition failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Request could not be delivered or the response could not be read.
    #[error("Network error: {0}")]
    Network(String),

    /// Startup configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::ProviderRejected`] value.
    pub fn provider(status: Option<u16>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ProviderRejected(ProviderError::new(status, code, message))
    }

    /// The provider error code, if this is a provider rejection.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Error::ProviderRejected(err) => Some(err.code.as_str()),
            _ => None,
        }
    }

    /// The HTTP status of a provider rejection, if any.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Error::ProviderRejected(err) => err.status,
            _ => None,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_code_accessors() {
        let err = Error::provider(Some(404), "ResourceGroupNotFound", "no such group");
        assert_eq!(err.provider_code(), Some("ResourceGroupNotFound"));
        assert_eq!(err.provider_status(), Some(404));

        let other = Error::NotInitialized;
        assert_eq!(other.provider_code(), None);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new(Some(403), "Forbidden", "caller lacks permission");
        assert_eq!(err.to_string(), "Forbidden (403): caller lacks permission");

        let no_status = ProviderError::new(None, "Unknown", "boom");
        assert_eq!(no_status.to_string(), "Unknown: boom");
    }
}
