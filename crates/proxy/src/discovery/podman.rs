//! Podman-backed discovery
//!
//! Lists running containers that carry the `exposed-fqdn` and
//! `exposed-port` labels and resolves container ids to network
//! addresses via `podman container inspect`.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{BackendDescriptor, CommandTransport, DiscoveryError, DiscoverySource};

/// Label naming the hostname a container wants traffic for.
pub const EXPOSED_FQDN_LABEL: &str = "exposed-fqdn";
/// Label naming the port the container listens on.
pub const EXPOSED_PORT_LABEL: &str = "exposed-port";

const LIST_COMMAND: &str = "podman container list \
    --filter label=exposed-port --filter label=exposed-fqdn \
    --filter status=running --no-trunc --format json";

/// One entry of `podman container list --format json`.
#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

/// One entry of `podman container inspect --format json`.
#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

/// Network attachments keyed by network name.
///
/// A `BTreeMap` so attachments are visited in name order: when a
/// container is attached to several networks, the first attachment with
/// a non-empty address wins, making address selection deterministic.
#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, NetworkDetails>,
}

#[derive(Debug, Deserialize)]
struct NetworkDetails {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Discovery source backed by a remote Podman host.
pub struct PodmanDiscovery {
    transport: Arc<dyn CommandTransport>,
}

impl PodmanDiscovery {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DiscoverySource for PodmanDiscovery {
    async fn list(&self) -> Result<Vec<BackendDescriptor>, DiscoveryError> {
        let output = self
            .transport
            .run(LIST_COMMAND)
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        let entries: Vec<ListEntry> =
            serde_json::from_slice(&output).map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        let mut backends = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let Some(fqdn) = entry
                .labels
                .get(EXPOSED_FQDN_LABEL)
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
            else {
                warn!(container = %name, id = %entry.id, "container missing exposed-fqdn label value");
                continue;
            };
            let port = match entry
                .labels
                .get(EXPOSED_PORT_LABEL)
                .and_then(|p| p.trim().parse::<u16>().ok())
            {
                Some(port) => port,
                None => {
                    warn!(
                        container = %name,
                        fqdn = %fqdn,
                        label = ?entry.labels.get(EXPOSED_PORT_LABEL),
                        "invalid exposed-port label, skipping container"
                    );
                    continue;
                }
            };
            if name.is_empty() || entry.id.is_empty() {
                warn!(fqdn = %fqdn, "container listing missing id or name, skipping");
                continue;
            }
            backends.push(BackendDescriptor {
                id: entry.id,
                name,
                fqdn,
                port,
            });
        }

        Ok(backends)
    }

    async fn resolve_address(&self, id: &str) -> Result<IpAddr, DiscoveryError> {
        let command = format!("podman container inspect {id} --format json");
        let output = self
            .transport
            .run(&command)
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        // Inspect returns an array even for a single container
        let entries: Vec<InspectEntry> =
            serde_json::from_slice(&output).map_err(|e| DiscoveryError::Parse(e.to_string()))?;
        let entry = match entries.as_slice() {
            [entry] => entry,
            other => {
                return Err(DiscoveryError::Parse(format!(
                    "expected 1 container inspecting '{id}', got {}",
                    other.len()
                )))
            }
        };

        for (network, details) in &entry.network_settings.networks {
            if details.ip_address.is_empty() {
                continue;
            }
            return details.ip_address.parse::<IpAddr>().map_err(|e| {
                DiscoveryError::Parse(format!(
                    "bad address '{}' on network '{network}' for '{id}': {e}",
                    details.ip_address
                ))
            });
        }

        Err(DiscoveryError::AddressNotFound { id: id.to_string() })
    }
}
