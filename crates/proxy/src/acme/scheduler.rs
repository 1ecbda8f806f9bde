//! Background certificate renewal sweep
//!
//! Reconciliation only triggers certificate checks for hostnames whose
//! routes are new or changed, so a long-stable route would never renew.
//! The sweep closes that gap: on a long interval it walks every hostname
//! in the current route table and runs it through `ensure`, which is a
//! no-op outside the renewal window and single-flighted inside it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::{CertificateManager, EnsureOutcome};
use crate::routing::RouteTable;

/// Minimum sweep interval (1 hour).
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodic renewal check over the live route table.
pub struct RenewalSweep {
    manager: Arc<CertificateManager>,
    routes: Arc<RouteTable>,
    interval: Duration,
}

impl RenewalSweep {
    /// Create a sweep over the given manager and route table.
    ///
    /// The interval is clamped to a minimum of 1 hour to avoid
    /// excessive polling.
    pub fn new(manager: Arc<CertificateManager>, routes: Arc<RouteTable>, interval: Duration) -> Self {
        Self {
            manager,
            routes,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    /// The effective sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the sweep loop until the shutdown signal fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_hours = self.interval.as_secs() / 3600,
            "starting certificate renewal sweep"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The immediate first tick would race startup reconciliation
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping certificate renewal sweep");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Check every routed hostname once.
    async fn sweep(&self) {
        let snapshot = self.routes.snapshot();
        debug!(hostnames = snapshot.len(), "running certificate renewal sweep");

        for fqdn in snapshot.keys() {
            match self.manager.ensure(fqdn).await {
                Ok(EnsureOutcome::Obtained) => {
                    info!(fqdn = %fqdn, "certificate renewed by sweep");
                }
                Ok(_) => {}
                Err(e) => {
                    // Keep sweeping; this hostname retries next round
                    warn!(fqdn = %fqdn, error = %e, "renewal sweep failed for hostname");
                }
            }
        }
    }
}

impl std::fmt::Debug for RenewalSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalSweep")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::{CertificateIssuer, IssuedCertificate};
    use crate::acme::error::AcmeError;
    use crate::acme::storage::CertificateStorage;

    #[derive(Debug)]
    struct NeverIssuer;

    #[async_trait::async_trait]
    impl CertificateIssuer for NeverIssuer {
        async fn obtain(&self, _fqdn: &str) -> Result<IssuedCertificate, AcmeError> {
            Err(AcmeError::Protocol("unused".to_string()))
        }
    }

    #[test]
    fn test_interval_clamped_to_minimum() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        let manager = Arc::new(CertificateManager::new(
            storage,
            Arc::new(NeverIssuer),
            Duration::from_secs(30 * 24 * 3600),
        ));

        let sweep = RenewalSweep::new(manager, Arc::new(RouteTable::new()), Duration::from_secs(10));
        assert_eq!(sweep.interval(), MIN_SWEEP_INTERVAL);
    }
}
