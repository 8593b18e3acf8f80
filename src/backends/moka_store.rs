//! Moka Store - Bounded In-Memory Store
//!
//! In-process store on Moka's async cache. Bounded and evicting, but without
//! tag or pattern support: tagged invalidation against it reports zero.
//!
//! Counters live beside the Moka cache in a `DashMap`, out of reach of its
//! global `time_to_live` and capacity eviction, so hit/miss statistics are
//! never reset behind the caller's back.

use anyhow::Result;
use dashmap::DashMap;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Value with its own expiry, checked on read
#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Arc<Vec<u8>>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, ttl: Duration) -> Self {
        Self {
            bytes: Arc::new(bytes),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Configuration for `MokaStore`
#[derive(Debug, Clone, Copy)]
pub struct MokaStoreConfig {
    /// Max capacity of the store
    pub max_capacity: u64,
    /// Upper bound on any entry's lifetime, whatever its own TTL
    ///
    /// Does not apply to counters.
    pub time_to_live: Duration,
}

impl Default for MokaStoreConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            time_to_live: Duration::from_secs(3600),
        }
    }
}

/// Moka in-memory store with per-key TTL support
///
/// - Fast in-memory access
/// - Automatic eviction when `max_capacity` is reached
/// - Per-key TTL support
/// - Counters kept outside the evicting cache
/// - No tag or pattern support
pub struct MokaStore {
    cache: Cache<String, StoredValue>,
    counters: DashMap<String, i64>,
}

impl MokaStore {
    /// Create new Moka store
    #[must_use]
    pub fn new(config: MokaStoreConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.time_to_live)
            .build();

        info!(
            capacity = config.max_capacity,
            time_to_live_secs = config.time_to_live.as_secs(),
            "Moka Store initialized with per-key TTL support"
        );

        Self {
            cache,
            counters: DashMap::new(),
        }
    }

    /// Drop `key` only if the entry is still expired when Moka locks it
    async fn evict_if_expired(&self, key: &str) {
        self.cache
            .entry(key.to_string())
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) if entry.value().is_expired() => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(MokaStoreConfig::default())
    }
}

// ===== Trait Implementations =====

use crate::traits::CacheStore;
use async_trait::async_trait;

#[async_trait]
impl CacheStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(count) = self.counters.get(key) {
            return Ok(Some(count.to_string().into_bytes()));
        }
        match self.cache.get(key).await {
            Some(value) if !value.is_expired() => Ok(Some(value.bytes.as_ref().clone())),
            Some(_) => {
                self.evict_if_expired(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.counters.remove(key);
        self.cache
            .insert(key.to_string(), StoredValue::new(value.to_vec(), ttl))
            .await;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Moka] Stored key with TTL");
        Ok(true)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        if self.counters.remove(key).is_some() {
            return Ok(true);
        }
        Ok(self
            .cache
            .remove(key)
            .await
            .is_some_and(|value| !value.is_expired()))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        // A value stored under the same key is replaced by the counter
        self.cache.invalidate(key).await;
        let mut count = self.counters.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(delta);
        Ok(*count)
    }

    async fn health_check(&self) -> bool {
        const HEALTH_KEY: &str = "rebac:health:moka";
        self.cache
            .insert(HEALTH_KEY.to_string(), StoredValue::new(b"ok".to_vec(), Duration::from_secs(1)))
            .await;
        self.cache.remove(HEALTH_KEY).await.is_some()
    }

    fn name(&self) -> &'static str {
        "Moka"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_forget() {
        let store = MokaStore::default();
        store.put("k", b"v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.forget("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn test_optional_capabilities_degrade_to_zero() {
        let store = MokaStore::default();
        let ttl = Duration::from_secs(10);
        store
            .put_tagged("k", b"v", ttl, &["user:1".to_string()])
            .await
            .unwrap();

        assert!(!store.supports_tags());
        assert!(!store.supports_patterns());
        assert_eq!(store.flush_tags(&["user:1".to_string()]).await.unwrap(), 0);
        assert_eq!(store.forget_matching("*").await.unwrap(), 0);
        // The value itself was still stored
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_increment() {
        let store = MokaStore::default();
        assert_eq!(store.increment("n", 5).await.unwrap(), 5);
        assert_eq!(store.increment("n", -2).await.unwrap(), 3);
        assert_eq!(store.get("n").await.unwrap(), Some(b"3".to_vec()));
        assert!(store.forget("n").await.unwrap());
        assert_eq!(store.increment("n", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counters_outlive_global_time_to_live() {
        let store = MokaStore::new(MokaStoreConfig {
            max_capacity: 100,
            time_to_live: Duration::from_millis(20),
        });
        store.increment("rebac:stats:hits", 4).await.unwrap();
        store.put("k", b"v", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.get("rebac:stats:hits").await.unwrap(), Some(b"4".to_vec()));
    }

    #[tokio::test]
    async fn test_expired_read_spares_rewritten_value() {
        let store = MokaStore::default();
        store.put("k", b"old", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Rewritten after expiry: the conditional eviction must keep it
        store.put("k", b"new", Duration::from_secs(60)).await.unwrap();
        store.evict_if_expired("k").await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"new".to_vec()));

        store.put("gone", b"v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(store.cache.get("gone").await.is_none());
    }
}
