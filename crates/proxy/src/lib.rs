//! Portward Gateway Library
//!
//! A self-managing TLS-terminating gateway: hostnames are routed to
//! backend addresses discovered from a remote Podman host, and
//! per-hostname certificates are obtained and renewed automatically via
//! ACME with the DNS-01 challenge.
//!
//! Core components:
//!
//! - **Discovery**: enumerate labeled backends over a command transport
//! - **Routing**: periodic reconciliation into an atomically-published
//!   hostname -> address snapshot
//! - **ACME**: certificate lifecycle with persistent storage, per-fqdn
//!   single-flight, and a background renewal sweep
//! - **TLS dispatch**: SNI-driven certificate selection for handshakes
//! - **Server**: the TLS-terminating HTTP frontend

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod discovery;
pub mod routing;
pub mod server;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate lifecycle
pub use acme::{AcmeClient, CertificateManager, CertificateStorage, RenewalSweep};

// Discovery
pub use discovery::{DiscoverySource, PodmanDiscovery, SshTransport};

// Routing
pub use routing::{Reconciler, Route, RouteResolver, RouteTable};

// TLS dispatch
pub use tls::SniResolver;

// Frontend
pub use server::GatewayServer;
