//! Backend discovery
//!
//! Enumerates backend workloads on a remote host and resolves each to a
//! network address. The discovery source is consumed through the
//! [`DiscoverySource`] trait so the reconciliation engine can be tested
//! against fakes; the production implementation is [`PodmanDiscovery`]
//! running `podman` commands over a [`CommandTransport`].

mod podman;
mod transport;

pub use podman::PodmanDiscovery;
pub use transport::{CommandTransport, SshTransport, TransportError};

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

/// A backend workload advertised for routing.
///
/// Ephemeral: descriptors are rebuilt from scratch on every
/// reconciliation cycle and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Opaque identifier used only for address resolution
    pub id: String,
    /// Human-readable workload name (also the duplicate-fqdn tie-breaker)
    pub name: String,
    /// Hostname this backend wants traffic for
    pub fqdn: String,
    /// Port the backend listens on
    pub port: u16,
}

/// Errors surfaced by a discovery source.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The source could not be reached
    #[error("discovery source unavailable: {0}")]
    Unavailable(String),

    /// The source answered but its output could not be parsed
    #[error("failed to parse discovery output: {0}")]
    Parse(String),

    /// A backend exists but exposes no usable address
    #[error("no address found for backend '{id}'")]
    AddressNotFound { id: String },
}

/// Source of backend workloads and their addresses.
///
/// `list` and `resolve_address` are independent operations: one backend
/// failing to resolve must not prevent others from resolving.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// List the currently running backends eligible for routing.
    async fn list(&self) -> Result<Vec<BackendDescriptor>, DiscoveryError>;

    /// Resolve the network address for a backend id.
    async fn resolve_address(&self, id: &str) -> Result<IpAddr, DiscoveryError>;
}
