//! DNS provider contract for DNS-01 challenges
//!
//! Defines the interface the certificate pipeline drives to publish and
//! remove challenge TXT records, plus the record-name derivation shared
//! by all providers.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use thiserror::Error;

/// Result type for DNS operations.
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations.
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Authentication failed with the DNS provider
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The hostname is not inside the managed zone.
    ///
    /// Derivation failure is an explicit error; publishing a challenge
    /// record into the wrong zone would silently break validation.
    #[error("fqdn '{fqdn}' is not inside zone '{zone}'")]
    OutsideZone { fqdn: String, zone: String },

    /// Record creation failed
    #[error("failed to create TXT record '{record_name}': {message}")]
    RecordCreation {
        record_name: String,
        message: String,
    },

    /// Record deletion failed
    #[error("failed to delete TXT record '{record_name}': {message}")]
    RecordDeletion {
        record_name: String,
        message: String,
    },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Request timeout
    #[error("request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Challenge record did not become visible in time
    #[error("DNS propagation timeout for record '{record}' after {elapsed_secs}s")]
    PropagationTimeout { record: String, elapsed_secs: u64 },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// ACME challenge record name prefix.
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL for challenge records.
pub const CHALLENGE_TTL: u32 = 300;

/// Build the full ACME challenge record name for a hostname.
///
/// For `app.example.com`, returns `_acme-challenge.app.example.com`.
pub fn challenge_record_fqdn(fqdn: &str) -> String {
    format!("{ACME_CHALLENGE_RECORD}.{fqdn}")
}

/// Derive a record name relative to a zone by stripping the zone suffix.
///
/// `_acme-challenge.app.example.com` inside `example.com` becomes
/// `_acme-challenge.app`. A record name that does not end in `.{zone}`
/// fails with [`DnsProviderError::OutsideZone`].
pub fn relative_record_name(record_fqdn: &str, zone: &str) -> DnsResult<String> {
    let zone = zone.trim_end_matches('.');
    let suffix = format!(".{zone}");

    match record_fqdn.strip_suffix(&suffix) {
        Some(relative) if !relative.is_empty() => Ok(relative.to_string()),
        _ => Err(DnsProviderError::OutsideZone {
            fqdn: record_fqdn.to_string(),
            zone: zone.to_string(),
        }),
    }
}

/// Compute the DNS-01 TXT record value for a key authorization.
///
/// Per RFC 8555 the value is the base64url-encoded SHA-256 digest of the
/// key authorization, without padding.
pub fn dns01_txt_value(key_authorization: &str) -> String {
    let digest = Sha256::digest(key_authorization.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// DNS provider capability consumed by the certificate pipeline.
///
/// Implementations must be thread-safe; each operation is bounded by the
/// provider's own request timeout.
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Provider name for logging (e.g. "gandi").
    fn name(&self) -> &'static str;

    /// Publish the challenge TXT record for `fqdn` with `value`.
    async fn publish(&self, fqdn: &str, value: &str) -> DnsResult<()>;

    /// Remove the challenge TXT record for `fqdn`.
    ///
    /// Idempotent: removing a record that no longer exists succeeds.
    async fn cleanup(&self, fqdn: &str) -> DnsResult<()>;
}
