//! Service shared access signatures for blob containers.
//!
//! A container SAS is an HMAC-SHA256 over a fixed-layout string, keyed with
//! the storage account key. Possession of the resulting URI is the only
//! thing needed to read the container until it expires.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use cabinetry_common::{Error, Result};

use crate::api::{AccountKey, SasPermissions};

/// Signed service version used in the string-to-sign layout.
pub const SAS_VERSION: &str = "2022-11-02";

type HmacSha256 = Hmac<Sha256>;

/// Container-scoped SAS builder.
#[derive(Debug, Clone)]
pub struct ContainerSas<'a> {
    account_name: &'a str,
    container: &'a str,
    permissions: SasPermissions,
    expiry: DateTime<Utc>,
}

impl<'a> ContainerSas<'a> {
    pub fn new(
        account_name: &'a str,
        container: &'a str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            account_name,
            container,
            permissions,
            expiry,
        }
    }

    fn expiry_str(&self) -> String {
        self.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// The exact string the signature covers.
    pub fn string_to_sign(&self) -> String {
        let canonical_resource = format!("/blob/{}/{}", self.account_name, self.container);
        [
            self.permissions.as_sp().as_str(),
            "", // signed start
            self.expiry_str().as_str(),
            canonical_resource.as_str(),
            "", // signed identifier
            "", // signed ip
            "https",
            SAS_VERSION,
            "c",
            "", // snapshot time
            "", // encryption scope
            "", // rscc
            "", // rscd
            "", // rsce
            "", // rscl
            "", // rsct
        ]
        .join("\n")
    }

    /// Compute the base64 signature with `key`.
    pub fn sign(&self, key: &AccountKey) -> Result<String> {
        let key_bytes = STANDARD
            .decode(key.value())
            .map_err(|e| Error::InvalidInput(format!("storage key is not base64: {}", e)))?;
        let mut mac = HmacSha256::new_from_slice(&key_bytes)
            .map_err(|e| Error::InvalidInput(format!("unusable storage key: {}", e)))?;
        mac.update(self.string_to_sign().as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Build the signed container URI under `blob_endpoint`.
    pub fn to_uri(&self, blob_endpoint: &Url, key: &AccountKey) -> Result<Url> {
        if self.permissions.as_sp().is_empty() {
            return Err(Error::InvalidInput(
                "a shared access signature needs at least one permission".to_string(),
            ));
        }

        let signature = self.sign(key)?;
        let mut uri = child_url(blob_endpoint, &[self.container])?;

        uri.query_pairs_mut()
            .clear()
            .append_pair("sv", SAS_VERSION)
            .append_pair("spr", "https")
            .append_pair("se", &self.expiry_str())
            .append_pair("sr", "c")
            .append_pair("sp", &self.permissions.as_sp())
            .append_pair("sig", &signature);

        Ok(uri)
    }
}

/// Ensure `url` ends with `/` so that joins append rather than replace.
pub(crate) fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Append `segments` to `base`, each percent-encoded as exactly one path
/// segment. Empty, `.` and `..` segments are rejected.
pub(crate) fn child_url(base: &Url, segments: &[&str]) -> Result<Url> {
    if let Some(bad) = segments
        .iter()
        .find(|s| s.is_empty() || **s == "." || **s == "..")
    {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a usable path segment",
            bad
        )));
    }

    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| Error::InvalidInput(format!("'{}' cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
