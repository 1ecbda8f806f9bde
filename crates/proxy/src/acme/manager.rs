//! Certificate lifecycle manager
//!
//! Decides when a certificate must be obtained or renewed, caches and
//! persists material, and serves it synchronously to TLS dispatch.
//!
//! # Consistency rules
//!
//! - A cached or persisted record is only ever replaced by material that
//!   already parsed into a usable signing identity; a failed obtain
//!   leaves the previous record authoritative everywhere.
//! - Concurrent `ensure` calls for the same hostname collapse into at
//!   most one in-flight obtain (per-fqdn single-flight); different
//!   hostnames proceed independently.
//! - `lookup` never performs network I/O. A handshake either hits the
//!   cache, lazily loads from storage, or fails fast.
//! - No retry loop lives here: a failed obtain is retried by whatever
//!   triggers the next `ensure` (reconciliation tick or renewal sweep).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use portward_common::SingleFlight;

use super::client::CertificateIssuer;
use super::error::AcmeError;
use super::storage::CertificateStorage;
use crate::routing::CertificateEnsurer;
use crate::tls::{certificate_not_after, certified_key_from_pem, CertificateProvider};

/// Cached certificate material for one hostname.
#[derive(Clone)]
pub struct CachedCertificate {
    pub certified: Arc<CertifiedKey>,
    pub not_after: DateTime<Utc>,
}

/// Outcome of an `ensure` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A valid certificate already exists, nothing to do
    Valid,
    /// A certificate was obtained and installed
    Obtained,
    /// Another caller is already obtaining for this hostname
    InFlight,
}

/// Renewal is due once `now` passes `not_after - renew_before`.
fn needs_renewal(
    not_after: DateTime<Utc>,
    renew_before: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    now > not_after - renew_before
}

/// Owns the certificate store and drives the obtain/renew lifecycle.
pub struct CertificateManager {
    /// Read-mostly cache, hostname -> certificate material
    store: RwLock<HashMap<String, CachedCertificate>>,
    storage: Arc<CertificateStorage>,
    issuer: Arc<dyn CertificateIssuer>,
    renew_before: chrono::Duration,
    /// Per-fqdn obtain coordination
    flights: SingleFlight<String>,
}

impl CertificateManager {
    pub fn new(
        storage: Arc<CertificateStorage>,
        issuer: Arc<dyn CertificateIssuer>,
        renew_before: Duration,
    ) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            storage,
            issuer,
            renew_before: chrono::Duration::from_std(renew_before)
                .unwrap_or_else(|_| chrono::Duration::days(30)),
            flights: SingleFlight::new(),
        }
    }

    /// Cached material for a hostname.
    fn cached(&self, fqdn: &str) -> Option<CachedCertificate> {
        self.store.read().get(fqdn).cloned()
    }

    /// Load persisted material into the cache.
    ///
    /// A pair that fails to parse is logged and treated as absent, which
    /// routes the hostname back through issuance on its next `ensure`.
    fn load_from_storage(&self, fqdn: &str) -> Option<CachedCertificate> {
        let stored = match self.storage.load_certificate(fqdn) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(fqdn = %fqdn, error = %e, "failed to read stored certificate");
                return None;
            }
        };

        let certified = match certified_key_from_pem(&stored.cert_pem, &stored.key_pem) {
            Ok(certified) => certified,
            Err(e) => {
                warn!(fqdn = %fqdn, error = %e, "stored certificate is unusable, will re-issue");
                return None;
            }
        };
        let not_after = match certificate_not_after(&stored.cert_pem) {
            Ok(not_after) => not_after,
            Err(e) => {
                warn!(fqdn = %fqdn, error = %e, "stored certificate has unreadable expiry, will re-issue");
                return None;
            }
        };

        let cached = CachedCertificate {
            certified: Arc::new(certified),
            not_after,
        };
        self.store
            .write()
            .insert(fqdn.to_string(), cached.clone());

        debug!(fqdn = %fqdn, not_after = %not_after, "certificate loaded from storage");
        Some(cached)
    }

    /// Certificate material for TLS dispatch: cache, then storage.
    ///
    /// Never triggers issuance; a miss here is a failed handshake.
    pub fn lookup(&self, fqdn: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(cached) = self.cached(fqdn) {
            return Some(cached.certified);
        }
        self.load_from_storage(fqdn).map(|c| c.certified)
    }

    /// Make sure a valid certificate exists for a hostname, obtaining or
    /// renewing through the issuer when needed.
    pub async fn ensure(&self, fqdn: &str) -> Result<EnsureOutcome, AcmeError> {
        let current = self.cached(fqdn).or_else(|| self.load_from_storage(fqdn));

        if let Some(cert) = &current {
            if !needs_renewal(cert.not_after, self.renew_before, Utc::now()) {
                return Ok(EnsureOutcome::Valid);
            }
            info!(
                fqdn = %fqdn,
                not_after = %cert.not_after,
                "certificate inside renewal window"
            );
        }

        // Single-flight: only the winner obtains; concurrent callers for
        // the same hostname back off immediately. The registry lock is
        // only held for this decision, not for the network call.
        let Some(_flight) = self.flights.begin(fqdn.to_string()) else {
            debug!(fqdn = %fqdn, "obtain already in flight, skipping duplicate trigger");
            return Ok(EnsureOutcome::InFlight);
        };

        // A flight that completed while we were deciding may have
        // installed fresh material already.
        if let Some(cert) = self.cached(fqdn) {
            if !needs_renewal(cert.not_after, self.renew_before, Utc::now()) {
                return Ok(EnsureOutcome::Valid);
            }
        }

        match self.obtain(fqdn).await {
            Ok(()) => Ok(EnsureOutcome::Obtained),
            Err(e) => {
                if current.is_some() {
                    warn!(
                        fqdn = %fqdn,
                        error = %e,
                        "renewal failed, previous certificate stays authoritative"
                    );
                } else {
                    warn!(fqdn = %fqdn, error = %e, "certificate issuance failed");
                }
                Err(e)
            }
        }
    }

    /// Obtain, validate, persist, and install a certificate.
    async fn obtain(&self, fqdn: &str) -> Result<(), AcmeError> {
        info!(fqdn = %fqdn, "obtaining certificate");

        let issued = self.issuer.obtain(fqdn).await?;

        // Validation gate: nothing is persisted or cached unless the
        // returned material forms a usable signing identity.
        let certified = certified_key_from_pem(&issued.cert_pem, &issued.key_pem)
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;

        self.storage
            .save_certificate(fqdn, &issued.cert_pem, &issued.key_pem)?;

        self.store.write().insert(
            fqdn.to_string(),
            CachedCertificate {
                certified: Arc::new(certified),
                not_after: issued.not_after,
            },
        );

        info!(fqdn = %fqdn, not_after = %issued.not_after, "certificate installed");
        Ok(())
    }
}

impl CertificateProvider for CertificateManager {
    fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.lookup(server_name)
    }
}

#[async_trait]
impl CertificateEnsurer for CertificateManager {
    async fn ensure(&self, fqdn: &str) {
        if let Err(e) = CertificateManager::ensure(self, fqdn).await {
            warn!(
                fqdn = %fqdn,
                error = %e,
                "certificate ensure failed, will retry on a later cycle"
            );
        }
    }

    fn has_certificate(&self, fqdn: &str) -> bool {
        self.lookup(fqdn).is_some()
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cached", &self.store.read().len())
            .field("renew_before", &self.renew_before)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::super::client::IssuedCertificate;
    use super::*;

    const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 3600);

    /// Mint a self-signed pair expiring `valid_days` from now.
    fn self_signed(fqdn: &str, valid_days: i64) -> (String, String, DateTime<Utc>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![fqdn.to_string()]).unwrap();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(valid_days);
        let cert = params.self_signed(&key).unwrap();
        let not_after = certificate_not_after(&cert.pem()).unwrap();
        (cert.pem(), key.serialize_pem(), not_after)
    }

    /// Issuer minting a fresh certificate per call, counting calls.
    struct FakeIssuer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeIssuer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CertificateIssuer for FakeIssuer {
        async fn obtain(&self, fqdn: &str) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(AcmeError::Protocol("rate limited".to_string()));
            }
            let (cert_pem, key_pem, not_after) = self_signed(fqdn, 90);
            Ok(IssuedCertificate {
                cert_pem,
                key_pem,
                not_after,
            })
        }
    }

    fn manager(issuer: Arc<FakeIssuer>) -> (TempDir, Arc<CertificateManager>, Arc<CertificateStorage>) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        let manager = Arc::new(CertificateManager::new(
            Arc::clone(&storage),
            issuer as Arc<dyn CertificateIssuer>,
            RENEW_BEFORE,
        ));
        (temp_dir, manager, storage)
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = Utc::now();
        let renew_before = chrono::Duration::days(30);

        // Expires in 10 days, renew 30 days ahead: due
        assert!(needs_renewal(now + chrono::Duration::days(10), renew_before, now));
        // Expires in 60 days: not due
        assert!(!needs_renewal(now + chrono::Duration::days(60), renew_before, now));
        // Already expired: due
        assert!(needs_renewal(now - chrono::Duration::days(1), renew_before, now));
    }

    #[tokio::test]
    async fn test_ensure_absent_obtains_and_installs() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        let outcome = manager.ensure("new.example.com").await.unwrap();

        assert_eq!(outcome, EnsureOutcome::Obtained);
        assert_eq!(issuer.calls(), 1);
        // Persisted and served
        assert!(storage.load_certificate("new.example.com").unwrap().is_some());
        assert!(manager.lookup("new.example.com").is_some());
    }

    #[tokio::test]
    async fn test_ensure_valid_certificate_is_a_noop() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        // Pre-seed storage with a certificate well outside the window
        let (cert_pem, key_pem, _) = self_signed("app.example.com", 60);
        storage
            .save_certificate("app.example.com", &cert_pem, &key_pem)
            .unwrap();

        let outcome = manager.ensure("app.example.com").await.unwrap();

        assert_eq!(outcome, EnsureOutcome::Valid);
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_expiring_certificate_renews() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        // Expires in 10 days, renew-before is 30 days
        let (cert_pem, key_pem, _) = self_signed("app.example.com", 10);
        storage
            .save_certificate("app.example.com", &cert_pem, &key_pem)
            .unwrap();

        let outcome = manager.ensure("app.example.com").await.unwrap();

        assert_eq!(outcome, EnsureOutcome::Obtained);
        assert_eq!(issuer.calls(), 1);
        // Storage now holds the renewed material
        let stored = storage.load_certificate("app.example.com").unwrap().unwrap();
        assert_ne!(stored.cert_pem, cert_pem);
    }

    #[tokio::test]
    async fn test_failed_obtain_keeps_previous_record() {
        let issuer = Arc::new(FakeIssuer::new().failing());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        // Expiring but still usable material
        let (cert_pem, key_pem, _) = self_signed("app.example.com", 10);
        storage
            .save_certificate("app.example.com", &cert_pem, &key_pem)
            .unwrap();

        let err = manager.ensure("app.example.com").await.unwrap_err();
        assert!(matches!(err, AcmeError::Protocol(_)));

        // Previous record still served and still on disk
        assert!(manager.lookup("app.example.com").is_some());
        let stored = storage.load_certificate("app.example.com").unwrap().unwrap();
        assert_eq!(stored.cert_pem, cert_pem);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_flight() {
        let issuer = Arc::new(FakeIssuer::new().with_delay(Duration::from_millis(150)));
        let (_tmp, manager, _storage) = manager(Arc::clone(&issuer));

        let barrier = Arc::new(tokio::sync::Barrier::new(5));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                manager.ensure("new.example.com").await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        // Exactly one obtain, everyone else collapsed into it
        assert_eq!(issuer.calls(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == EnsureOutcome::Obtained)
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == EnsureOutcome::InFlight)
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn test_concurrent_ensure_different_fqdns_proceed_independently() {
        let issuer = Arc::new(FakeIssuer::new().with_delay(Duration::from_millis(150)));
        let (_tmp, manager, _storage) = manager(Arc::clone(&issuer));

        let started = tokio::time::Instant::now();
        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure("a.example.com").await })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure("b.example.com").await })
        };

        // Neither obtain blocks the other
        assert_eq!(a.await.unwrap().unwrap(), EnsureOutcome::Obtained);
        assert_eq!(b.await.unwrap().unwrap(), EnsureOutcome::Obtained);
        assert_eq!(issuer.calls(), 2);
        // Overlapping flights: both finish well before two serialized delays
        assert!(started.elapsed() < Duration::from_millis(290));
    }

    #[tokio::test]
    async fn test_lookup_lazily_loads_from_storage() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        let (cert_pem, key_pem, _) = self_signed("app.example.com", 60);
        storage
            .save_certificate("app.example.com", &cert_pem, &key_pem)
            .unwrap();

        // Fresh manager cache: lookup must fall back to storage
        assert!(manager.lookup("app.example.com").is_some());
        // and never touch the issuer
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_lookup_miss_never_issues() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, _storage) = manager(Arc::clone(&issuer));

        assert!(manager.lookup("absent.example.com").is_none());
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_stored_pair_treated_as_absent() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));

        storage
            .save_certificate("app.example.com", "garbage", "garbage")
            .unwrap();

        // Unusable on the dispatch path
        assert!(manager.lookup("app.example.com").is_none());

        // Ensure re-issues over it
        let outcome = manager.ensure("app.example.com").await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Obtained);
        assert_eq!(issuer.calls(), 1);
        assert!(manager.lookup("app.example.com").is_some());
    }

    #[tokio::test]
    async fn test_obtained_material_round_trips_through_storage() {
        let issuer = Arc::new(FakeIssuer::new());
        let (_tmp, manager, storage) = manager(Arc::clone(&issuer));
        manager.ensure("app.example.com").await.unwrap();
        let installed = manager.cached("app.example.com").unwrap();

        // A second manager over the same storage serves the same record
        let manager2 = CertificateManager::new(
            storage,
            Arc::new(FakeIssuer::new()) as Arc<dyn CertificateIssuer>,
            RENEW_BEFORE,
        );
        assert!(manager2.lookup("app.example.com").is_some());
        assert_eq!(
            manager2.cached("app.example.com").unwrap().not_after,
            installed.not_after
        );
    }
}
