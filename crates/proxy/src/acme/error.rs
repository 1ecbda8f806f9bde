//! ACME error types

use std::io;
use thiserror::Error;

use super::dns::DnsProviderError;

/// Errors that can occur during ACME operations.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// No ACME account has been initialized
    #[error("ACME account not initialized - call init_account() first")]
    NoAccount,

    /// Failed to create or load the ACME account
    #[error("failed to create ACME account: {0}")]
    AccountCreation(String),

    /// Persisted account credentials exist but cannot be parsed.
    ///
    /// Fatal at startup: without a working account identity the whole
    /// certificate pipeline is dead and the gateway must not start.
    #[error("persisted ACME account credentials are corrupt: {0}")]
    CorruptAccount(String),

    /// Failed to create a certificate order
    #[error("failed to create certificate order: {0}")]
    OrderCreation(String),

    /// Challenge validation failed
    #[error("challenge validation failed for domain '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    /// Certificate finalization failed
    #[error("failed to finalize certificate: {0}")]
    Finalization(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// ACME protocol error from instant-acme (covers network and
    /// rate-limit failures reported by the directory)
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// No DNS-01 challenge offered for a domain
    #[error("no DNS-01 challenge available for domain '{0}'")]
    NoDns01Challenge(String),

    /// DNS provider operation failed
    #[error("DNS provider error: {0}")]
    DnsProvider(#[from] DnsProviderError),

    /// Obtained material failed to parse or validate
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),
}

/// Errors specific to certificate storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Hostname unsafe to use as a file name
    #[error("refusing to use '{fqdn}' as a storage file name")]
    InvalidFqdn { fqdn: String },
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}
