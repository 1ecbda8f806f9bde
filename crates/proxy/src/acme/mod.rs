//! ACME automatic certificate management
//!
//! Provisions and renews per-hostname TLS certificates via Let's Encrypt
//! (or a compatible CA) using the DNS-01 challenge.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - wrapper around `instant-acme` implementing the
//!   [`CertificateIssuer`] capability
//! - [`CertificateStorage`] - persistent storage for certificates and
//!   account credentials
//! - [`CertificateManager`] - decides obtain/renew timing, caches
//!   material, serves TLS dispatch, single-flights concurrent obtains
//! - [`RenewalSweep`] - periodic renewal check over the route table
//! - [`dns`] - DNS-01 challenge publication and propagation checking
//!
//! # Issuance Flow
//!
//! When a hostname needs a certificate:
//!
//! 1. [`CertificateManager`] wins the per-hostname single-flight and
//!    calls the issuer
//! 2. [`AcmeClient`] creates an order; the CA answers with a DNS-01
//!    challenge per hostname
//! 3. The challenge TXT record is published through the configured
//!    [`dns::DnsProvider`] and awaited via [`dns::PropagationChecker`]
//! 4. The CA validates, the order is finalized with a fresh key, and
//!    the chain is retrieved
//! 5. Only after the material parses into a usable identity is it
//!    persisted and swapped into the serving cache

pub mod dns;

mod client;
mod error;
mod manager;
mod scheduler;
mod storage;

pub use client::{AcmeClient, CertificateIssuer, IssuedCertificate};
pub use error::{AcmeError, StorageError};
pub use manager::{CachedCertificate, CertificateManager, EnsureOutcome};
pub use scheduler::RenewalSweep;
pub use storage::{CertificateStorage, StoredCertificate};
