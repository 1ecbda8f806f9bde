//! Keyed single-flight coordination
//!
//! Collapses concurrent attempts at the same operation into a single
//! in-flight execution. Callers ask to begin a flight for a key; exactly
//! one caller receives a guard and performs the work, everyone else is
//! told a flight is already underway and backs off. The registry lock is
//! only held while deciding ownership, never while the work itself runs,
//! so flights for different keys proceed independently.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

/// Registry of in-flight operations keyed by `K`.
///
/// # Thread Safety
///
/// Backed by `DashMap`, so `begin` can be called concurrently from any
/// number of tasks. Dropping the returned [`FlightGuard`] releases the
/// key for the next attempt.
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash> {
    in_flight: DashMap<K, ()>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> SingleFlight<K> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Try to become the owner of the flight for `key`.
    ///
    /// Returns `Some(guard)` if no flight is underway for the key; the
    /// caller then performs the operation and drops the guard when done.
    /// Returns `None` if another caller already owns the flight.
    pub fn begin(&self, key: K) -> Option<FlightGuard<'_, K>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                trace!(key = ?key, "flight already in progress");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        trace!(key = ?key, "flight started");
        Some(FlightGuard {
            registry: &self.in_flight,
            key,
        })
    }

    /// Number of flights currently in progress.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of one in-flight operation; releases the key on drop.
#[derive(Debug)]
pub struct FlightGuard<'a, K: Eq + Hash> {
    registry: &'a DashMap<K, ()>,
    key: K,
}

impl<K: Eq + Hash> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}
