//! Request coalescing for concurrent identical misses
//!
//! When several tasks miss the cache for the same key at once, only the first
//! one should reach the backend. Each caller takes the key's in-flight lock;
//! whoever gets it second re-reads the cache and finds the first caller's
//! result there.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key in-flight locks
#[derive(Debug, Default)]
pub struct RequestCoalescer {
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    /// Callers that had to wait behind another caller for the same key
    coalesced: AtomicU64,
}

impl RequestCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    ///
    /// The returned guard releases the lock, and removes the key from the
    /// in-flight map, when dropped (including on early return or panic).
    pub async fn acquire(&self, key: &str) -> InFlightGuard<'_> {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let held = if let Ok(held) = Arc::clone(&lock).try_lock_owned() {
            held
        } else {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            Arc::clone(&lock).lock_owned().await
        };

        InFlightGuard {
            map: &self.in_flight,
            key: key.to_string(),
            lock,
            _held: held,
        }
    }

    /// Keys currently being resolved
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Total callers that waited behind an identical request
    #[must_use]
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// RAII guard for one in-flight key
pub struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        // A newer request may already have installed a fresh lock for the key
        self.map
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.lock));
    }
}
