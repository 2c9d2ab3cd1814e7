//! Time-boxed GET URLs for private objects in an S3-compatible store.
//!
//! Implements Signature Version 4 query-string authentication. The URL
//! carries algorithm, credential, date, expiry, signed headers and the final
//! signature; a verifier missing any of them rejects the URL.

pub mod canonical;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use canonical::{
    canonical_query, canonical_request, credential_scope, encode_key_path, signature,
    signing_key, string_to_sign, uri_encode, ALGORITHM, SIGNED_HEADERS,
};

/// SigV4 caps presigned URL lifetime at seven days.
pub const MAX_EXPIRES_SECS: u64 = 604_800;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingStyle {
    /// `https://endpoint/bucket/key` (R2 default)
    #[default]
    Path,
    /// `https://bucket.endpoint/key`
    VirtualHosted,
}

/// Long-term credentials for the object store. Never logged.
#[derive(Clone)]
pub struct SigningCredentials {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub addressing_style: AddressingStyle,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("invalid object store endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("object store credentials are incomplete")]
    MissingCredentials,
    #[error("expiry must be between 1 and {MAX_EXPIRES_SECS} seconds, got {0}")]
    InvalidExpiry(u64),
    #[error("invalid bucket name")]
    InvalidBucket,
    #[error("object key is empty")]
    EmptyKey,
}

/// A signed URL and the instant it stops working. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlGrant {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UrlSigner {
    scheme: String,
    /// Host header value; includes the port when it is not the scheme default
    host: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    addressing_style: AddressingStyle,
}

impl UrlSigner {
    pub fn new(credentials: SigningCredentials) -> Result<Self, PresignError> {
        if credentials.access_key_id.is_empty()
            || credentials.secret_access_key.is_empty()
            || credentials.region.is_empty()
        {
            return Err(PresignError::MissingCredentials);
        }

        let endpoint = url::Url::parse(&credentials.endpoint)
            .map_err(|e| PresignError::InvalidEndpoint(e.to_string()))?;
        let scheme = endpoint.scheme().to_string();
        if scheme != "https" && scheme != "http" {
            return Err(PresignError::InvalidEndpoint(format!(
                "unsupported scheme {}",
                scheme
            )));
        }
        if endpoint.path() != "/" || endpoint.query().is_some() {
            return Err(PresignError::InvalidEndpoint(
                "endpoint must not carry a path or query".to_string(),
            ));
        }
        let host_name = endpoint
            .host_str()
            .ok_or_else(|| PresignError::InvalidEndpoint("missing host".to_string()))?;
        // Url::port() is None for the scheme's default port
        let host = match endpoint.port() {
            Some(port) => format!("{}:{}", host_name, port),
            None => host_name.to_string(),
        };

        Ok(Self {
            scheme,
            host,
            region: credentials.region,
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            addressing_style: credentials.addressing_style,
        })
    }

    pub fn presign_get(
        &self,
        bucket: &str,
        object_key: &str,
        expires_secs: u64,
    ) -> Result<SignedUrlGrant, PresignError> {
        self.presign_get_at(bucket, object_key, expires_secs, Utc::now())
    }

    /// Deterministic for a given `now`: the URL and the grant expiry are both
    /// derived from the same instant.
    pub fn presign_get_at(
        &self,
        bucket: &str,
        object_key: &str,
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<SignedUrlGrant, PresignError> {
        if expires_secs == 0 || expires_secs > MAX_EXPIRES_SECS {
            return Err(PresignError::InvalidExpiry(expires_secs));
        }
        if bucket.is_empty() || bucket.contains('/') {
            return Err(PresignError::InvalidBucket);
        }
        if object_key.is_empty() {
            return Err(PresignError::EmptyKey);
        }

        let (host, canonical_uri) = match self.addressing_style {
            AddressingStyle::Path => (
                self.host.clone(),
                format!("/{}/{}", uri_encode(bucket, false), encode_key_path(object_key)),
            ),
            AddressingStyle::VirtualHosted => (
                format!("{}.{}", bucket, self.host),
                format!("/{}", encode_key_path(object_key)),
            ),
        };

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = credential_scope(&date, &self.region);

        let query = canonical_query(&[
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            ("X-Amz-Credential", format!("{}/{}", self.access_key_id, scope)),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires_secs.to_string()),
            ("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string()),
        ]);

        let request = canonical_request("GET", &canonical_uri, &query, &host);
        let to_sign = string_to_sign(&amz_date, &scope, &request);
        let key = signing_key(&self.secret_access_key, &date, &self.region);
        let sig = signature(&key, &to_sign);

        Ok(SignedUrlGrant {
            url: format!(
                "{}://{}{}?{}&X-Amz-Signature={}",
                self.scheme, host, canonical_uri, query, sig
            ),
            expires_at: now + Duration::seconds(expires_secs as i64),
        })
    }
}
