//! Route table and reconciliation engine
//!
//! The route table maps hostnames to backend addresses. It is rebuilt
//! from discovery on a fixed interval and published as an immutable
//! snapshot behind an atomic pointer swap: the request path reads
//! whichever snapshot is current and never observes a table under
//! construction.
//!
//! # Failure policy
//!
//! - Discovery failure: the cycle is abandoned and the previous snapshot
//!   stays published untouched.
//! - Per-backend resolution failure: that backend is dropped from the
//!   candidate table; the rest of the cycle proceeds.
//!
//! # Reentrancy
//!
//! Cycles never overlap: a cycle is awaited inline by the tick loop and
//! ticks that elapse while a cycle is still running are skipped
//! (`MissedTickBehavior::Skip`), bounding resource use on a slow
//! discovery host.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::discovery::{BackendDescriptor, DiscoverySource};

/// How many backend address resolutions run concurrently within a cycle.
const DEFAULT_RESOLVE_CONCURRENCY: usize = 8;

/// A forwarding target for one hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub addr: IpAddr,
    pub port: u16,
}

/// Hostname-to-route snapshot published atomically.
///
/// Single writer (the reconciliation engine), many readers (the request
/// path and TLS dispatch). Readers load the current snapshot pointer;
/// the writer replaces the whole map in one `store`.
#[derive(Debug)]
pub struct RouteTable {
    inner: ArcSwap<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Look up the route for a hostname in the current snapshot.
    pub fn lookup(&self, fqdn: &str) -> Option<Route> {
        self.inner.load().get(fqdn).cloned()
    }

    /// The current snapshot, shared.
    pub fn snapshot(&self) -> Arc<HashMap<String, Route>> {
        self.inner.load_full()
    }

    /// Replace the published snapshot wholesale.
    pub fn publish(&self, routes: HashMap<String, Route>) {
        self.inner.store(Arc::new(routes));
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side view of the route table, injected into the frontend.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, fqdn: &str) -> Option<Route>;
}

impl RouteResolver for RouteTable {
    fn resolve(&self, fqdn: &str) -> Option<Route> {
        self.lookup(fqdn)
    }
}

/// Receives the hostnames whose routes were created or changed.
///
/// Implemented by the certificate lifecycle manager; the engine calls it
/// after publishing a snapshot, off the publish path.
#[async_trait]
pub trait CertificateEnsurer: Send + Sync {
    async fn ensure(&self, fqdn: &str);

    /// Whether usable certificate material already exists for a hostname.
    ///
    /// Local state only; lets the engine re-trigger `ensure` on the next
    /// tick for routed hostnames whose issuance previously failed.
    fn has_certificate(&self, fqdn: &str) -> bool;
}

/// Periodic discovery-to-route-table reconciliation.
pub struct Reconciler {
    discovery: Arc<dyn DiscoverySource>,
    routes: Arc<RouteTable>,
    ensurer: Arc<dyn CertificateEnsurer>,
    interval: Duration,
    resolve_concurrency: usize,
    /// Tracks spawned certificate-ensure tasks for bounded-grace shutdown
    tasks: TaskTracker,
}

impl Reconciler {
    pub fn new(
        discovery: Arc<dyn DiscoverySource>,
        routes: Arc<RouteTable>,
        ensurer: Arc<dyn CertificateEnsurer>,
        interval: Duration,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            discovery,
            routes,
            ensurer,
            interval,
            resolve_concurrency: DEFAULT_RESOLVE_CONCURRENCY,
            tasks,
        }
    }

    /// Run the reconciliation loop until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting route reconciliation loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // Skip-if-busy: a tick that fires while a cycle is still running
        // is dropped rather than queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping route reconciliation loop");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    /// Run one reconciliation cycle.
    pub async fn reconcile(&self) {
        let backends = match self.discovery.list().await {
            Ok(backends) => backends,
            Err(e) => {
                warn!(error = %e, "backend discovery failed, keeping previous route table");
                return;
            }
        };

        // Resolve addresses with bounded fan-out; the collected stream is
        // the cycle's join barrier. A backend that fails to resolve is
        // dropped here without affecting the others.
        let mut resolved: Vec<(BackendDescriptor, IpAddr)> =
            stream::iter(backends.into_iter().map(|b| self.resolve_backend(b)))
                .buffer_unordered(self.resolve_concurrency)
                .filter_map(|r| async move { r })
                .collect()
                .await;

        // Deterministic candidate order regardless of resolution timing:
        // on a duplicate fqdn claim, the first container in (name, id)
        // order wins.
        resolved.sort_by(|(a, _), (b, _)| {
            (a.fqdn.as_str(), a.name.as_str(), a.id.as_str()).cmp(&(
                b.fqdn.as_str(),
                b.name.as_str(),
                b.id.as_str(),
            ))
        });

        let mut candidate: HashMap<String, Route> = HashMap::with_capacity(resolved.len());
        for (backend, addr) in resolved {
            let route = Route {
                addr,
                port: backend.port,
            };
            match candidate.entry(backend.fqdn.clone()) {
                Entry::Occupied(existing) => {
                    warn!(
                        fqdn = %backend.fqdn,
                        kept = ?existing.get(),
                        dropped = ?route,
                        container = %backend.name,
                        "duplicate fqdn claim, keeping first container in name order"
                    );
                }
                Entry::Vacant(slot) => {
                    slot.insert(route);
                }
            }
        }

        let previous = self.routes.snapshot();
        // New or changed routes always get a certificate check; unchanged
        // routes still missing usable material get one too, so a failed
        // issuance is retried on the next tick rather than waiting for
        // the renewal sweep.
        let needs_cert: Vec<String> = candidate
            .iter()
            .filter(|(fqdn, route)| {
                previous.get(*fqdn) != Some(*route) || !self.ensurer.has_certificate(fqdn.as_str())
            })
            .map(|(fqdn, _)| fqdn.clone())
            .collect();

        let total = candidate.len();
        self.routes.publish(candidate);
        if !needs_cert.is_empty() || total != previous.len() {
            info!(
                routes = total,
                pending_certificates = needs_cert.len(),
                "published route table"
            );
        }

        // Certificate work happens after the swap and never delays it
        for fqdn in needs_cert {
            debug!(fqdn = %fqdn, "triggering certificate check");
            let ensurer = Arc::clone(&self.ensurer);
            self.tasks.spawn(async move {
                ensurer.ensure(&fqdn).await;
            });
        }
    }

    async fn resolve_backend(
        &self,
        backend: BackendDescriptor,
    ) -> Option<(BackendDescriptor, IpAddr)> {
        match self.discovery.resolve_address(&backend.id).await {
            Ok(addr) => Some((backend, addr)),
            Err(e) => {
                warn!(
                    container = %backend.name,
                    fqdn = %backend.fqdn,
                    error = %e,
                    "dropping backend, address resolution failed"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::discovery::DiscoveryError;

    /// Discovery source fed with scripted listings and fixed addresses.
    struct FakeDiscovery {
        listings: Mutex<VecDeque<Result<Vec<BackendDescriptor>, DiscoveryError>>>,
        addresses: HashMap<String, IpAddr>,
    }

    impl FakeDiscovery {
        fn new(addresses: HashMap<String, IpAddr>) -> Self {
            Self {
                listings: Mutex::new(VecDeque::new()),
                addresses,
            }
        }

        fn push_listing(&self, listing: Result<Vec<BackendDescriptor>, DiscoveryError>) {
            self.listings.lock().push_back(listing);
        }
    }

    #[async_trait]
    impl DiscoverySource for FakeDiscovery {
        async fn list(&self) -> Result<Vec<BackendDescriptor>, DiscoveryError> {
            self.listings
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn resolve_address(&self, id: &str) -> Result<IpAddr, DiscoveryError> {
            self.addresses
                .get(id)
                .copied()
                .ok_or_else(|| DiscoveryError::AddressNotFound { id: id.to_string() })
        }
    }

    struct RecordingEnsurer {
        calls: Mutex<Vec<String>>,
        /// What `has_certificate` answers; real issuance is out of scope here
        has_certificates: bool,
    }

    impl RecordingEnsurer {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                has_certificates: true,
            }
        }

        fn without_certificates() -> Self {
            Self {
                has_certificates: false,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl CertificateEnsurer for RecordingEnsurer {
        async fn ensure(&self, fqdn: &str) {
            self.calls.lock().push(fqdn.to_string());
        }

        fn has_certificate(&self, _fqdn: &str) -> bool {
            self.has_certificates
        }
    }

    fn backend(id: &str, name: &str, fqdn: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            fqdn: fqdn.to_string(),
            port,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Harness {
        discovery: Arc<FakeDiscovery>,
        routes: Arc<RouteTable>,
        ensurer: Arc<RecordingEnsurer>,
        reconciler: Reconciler,
        tasks: TaskTracker,
    }

    fn harness(addresses: HashMap<String, IpAddr>) -> Harness {
        harness_with(addresses, RecordingEnsurer::new())
    }

    fn harness_with(addresses: HashMap<String, IpAddr>, ensurer: RecordingEnsurer) -> Harness {
        let discovery = Arc::new(FakeDiscovery::new(addresses));
        let routes = Arc::new(RouteTable::new());
        let ensurer = Arc::new(ensurer);
        let tasks = TaskTracker::new();
        let reconciler = Reconciler::new(
            Arc::clone(&discovery) as Arc<dyn DiscoverySource>,
            Arc::clone(&routes),
            Arc::clone(&ensurer) as Arc<dyn CertificateEnsurer>,
            Duration::from_secs(10),
            tasks.clone(),
        );
        Harness {
            discovery,
            routes,
            ensurer,
            reconciler,
            tasks,
        }
    }

    impl Harness {
        /// Run one cycle and wait for its spawned ensure tasks.
        async fn cycle(&self) {
            self.reconciler.reconcile().await;
            // TaskTracker::wait resolves once tracked tasks finish; the
            // tracker is reopened for the next cycle.
            self.tasks.close();
            self.tasks.wait().await;
            self.tasks.reopen();
        }
    }

    #[tokio::test]
    async fn test_discovered_backend_becomes_route() {
        // Scenario: discovery returns c1 for app.example.com:8080 at 10.0.0.5
        let h = harness(HashMap::from([("c1".to_string(), addr("10.0.0.5"))]));
        h.discovery
            .push_listing(Ok(vec![backend("c1", "app", "app.example.com", 8080)]));

        h.cycle().await;

        assert_eq!(
            h.routes.lookup("app.example.com"),
            Some(Route {
                addr: addr("10.0.0.5"),
                port: 8080,
            })
        );
        assert_eq!(h.ensurer.calls.lock().as_slice(), ["app.example.com"]);
    }

    #[tokio::test]
    async fn test_discovery_failure_retains_previous_table() {
        let h = harness(HashMap::from([("c1".to_string(), addr("10.0.0.5"))]));
        h.discovery
            .push_listing(Ok(vec![backend("c1", "app", "app.example.com", 8080)]));
        h.cycle().await;

        let before = h.routes.snapshot();
        h.discovery
            .push_listing(Err(DiscoveryError::Unavailable("ssh: timed out".into())));
        h.cycle().await;

        let after = h.routes.snapshot();
        // The failed cycle must not publish anything: same snapshot pointer
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(
            h.routes.lookup("app.example.com"),
            Some(Route {
                addr: addr("10.0.0.5"),
                port: 8080,
            })
        );
    }

    #[tokio::test]
    async fn test_resolution_failure_drops_only_that_backend() {
        let h = harness(HashMap::from([("c1".to_string(), addr("10.0.0.5"))]));
        h.discovery.push_listing(Ok(vec![
            backend("c1", "app", "app.example.com", 8080),
            backend("c2", "db", "db.example.com", 5432), // no address known
        ]));

        h.cycle().await;

        assert!(h.routes.lookup("app.example.com").is_some());
        assert!(h.routes.lookup("db.example.com").is_none());
        assert_eq!(h.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_fqdn_resolves_deterministically() {
        // Scenario: two containers claim x.example.com with different
        // addresses; the one whose name sorts first wins regardless of
        // resolution order.
        let addresses = HashMap::from([
            ("c9".to_string(), addr("10.0.0.9")),
            ("c1".to_string(), addr("10.0.0.1")),
        ]);

        for listing_order in [["c9", "c1"], ["c1", "c9"]] {
            let h = harness(addresses.clone());
            let listing = listing_order
                .into_iter()
                .map(|id| {
                    let name = if id == "c1" { "alpha" } else { "zulu" };
                    backend(id, name, "x.example.com", 8080)
                })
                .collect();
            h.discovery.push_listing(Ok(listing));

            h.cycle().await;

            assert_eq!(
                h.routes.lookup("x.example.com"),
                Some(Route {
                    addr: addr("10.0.0.1"),
                    port: 8080,
                }),
                "tie-break must pick 'alpha' independent of listing order"
            );
        }
    }

    #[tokio::test]
    async fn test_unchanged_routes_do_not_retrigger_ensure() {
        let h = harness(HashMap::from([("c1".to_string(), addr("10.0.0.5"))]));
        let listing = vec![backend("c1", "app", "app.example.com", 8080)];
        h.discovery.push_listing(Ok(listing.clone()));
        h.cycle().await;
        assert_eq!(h.ensurer.calls.lock().len(), 1);

        h.discovery.push_listing(Ok(listing));
        h.cycle().await;

        // Value-equal route: no second ensure
        assert_eq!(h.ensurer.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_address_retriggers_ensure() {
        let h = harness(HashMap::from([
            ("c1".to_string(), addr("10.0.0.5")),
            ("c1b".to_string(), addr("10.0.0.6")),
        ]));
        h.discovery
            .push_listing(Ok(vec![backend("c1", "app", "app.example.com", 8080)]));
        h.cycle().await;

        // Same fqdn, new container with a new address
        h.discovery
            .push_listing(Ok(vec![backend("c1b", "app", "app.example.com", 8080)]));
        h.cycle().await;

        assert_eq!(
            h.ensurer.calls.lock().as_slice(),
            ["app.example.com", "app.example.com"]
        );
        assert_eq!(
            h.routes.lookup("app.example.com").map(|r| r.addr),
            Some(addr("10.0.0.6"))
        );
    }

    #[tokio::test]
    async fn test_missing_certificate_retries_on_next_tick() {
        // Issuance failed previously: route is stable but no usable
        // certificate exists, so every tick re-triggers ensure
        let h = harness_with(
            HashMap::from([("c1".to_string(), addr("10.0.0.5"))]),
            RecordingEnsurer::without_certificates(),
        );
        let listing = vec![backend("c1", "app", "app.example.com", 8080)];

        h.discovery.push_listing(Ok(listing.clone()));
        h.cycle().await;
        h.discovery.push_listing(Ok(listing));
        h.cycle().await;

        assert_eq!(
            h.ensurer.calls.lock().as_slice(),
            ["app.example.com", "app.example.com"]
        );
    }

    #[tokio::test]
    async fn test_vanished_backend_leaves_candidate_table() {
        let h = harness(HashMap::from([("c1".to_string(), addr("10.0.0.5"))]));
        h.discovery
            .push_listing(Ok(vec![backend("c1", "app", "app.example.com", 8080)]));
        h.cycle().await;

        // Next successful listing no longer includes the backend
        h.discovery.push_listing(Ok(vec![]));
        h.cycle().await;

        assert!(h.routes.lookup("app.example.com").is_none());
        assert!(h.routes.is_empty());
    }

    #[tokio::test]
    async fn test_readers_never_observe_partial_snapshots() {
        let table = Arc::new(RouteTable::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            readers.push(tokio::spawn(async move {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let snapshot = table.snapshot();
                    // Every published table holds either zero or exactly
                    // two entries; a reader must never see one.
                    assert!(snapshot.len() == 0 || snapshot.len() == 2);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for i in 0..200u16 {
            let mut routes = HashMap::new();
            routes.insert(
                "a.example.com".to_string(),
                Route {
                    addr: addr("10.0.0.1"),
                    port: i,
                },
            );
            routes.insert(
                "b.example.com".to_string(),
                Route {
                    addr: addr("10.0.0.2"),
                    port: i,
                },
            );
            table.publish(routes);
            tokio::task::yield_now().await;
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
