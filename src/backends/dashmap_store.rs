//! `DashMap` Store - In-Process Store with Tags and Patterns
//!
//! A concurrent `HashMap` store that supports every optional capability of
//! [`CacheStore`]: tag-based flushes and glob pattern eviction.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with a paused tokio
//! clock can move time forward with `tokio::time::advance`.

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use globset::Glob;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::traits::CacheStore;

/// Stored value with expiration tracking
#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    /// `None` for counters, which never expire
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn counter(value: i64) -> Self {
        Self {
            bytes: value.to_string().into_bytes(),
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// Concurrent in-process store using `DashMap`
///
/// **Features**:
/// - Lock-free concurrent reads/writes
/// - Per-key TTL (lazy expiry on read, plus [`cleanup_expired`](Self::cleanup_expired))
/// - Tag index for [`flush_tags`](CacheStore::flush_tags)
/// - Glob patterns for [`forget_matching`](CacheStore::forget_matching)
///
/// **Limitations**:
/// - No size limits (unbounded growth)
/// - Not shared between processes
///
/// **Example**:
/// ```rust
/// use rebac_cache::backends::DashMapStore;
/// use rebac_cache::CacheStore;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = DashMapStore::new();
/// store.put("rebac:check:user=user:1", b"true", Duration::from_secs(60)).await?;
/// assert_eq!(store.get("rebac:check:user=user:1").await?, Some(b"true".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct DashMapStore {
    map: Arc<DashMap<String, StoredValue>>,
    /// tag -> keys carrying it
    tags: Arc<DashMap<String, HashSet<String>>>,
}

impl DashMapStore {
    /// Create new `DashMap` store
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing DashMap Store (concurrent HashMap)");

        Self {
            map: Arc::new(DashMap::new()),
            tags: Arc::new(DashMap::new()),
        }
    }

    /// Remove expired entries; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, value| {
            if value.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.tags.retain(|_, keys| {
            keys.retain(|key| self.map.contains_key(key));
            !keys.is_empty()
        });
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        removed
    }

    /// Number of stored values, expired ones included until cleaned up
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove `key` only while it is still expired; a value put in the
    /// meantime is kept
    fn evict_if_expired(&self, key: &str) -> bool {
        self.map.remove_if(key, |_, value| value.is_expired()).is_some()
    }

    /// Remove `key` if present; returns whether a live value was removed
    fn remove_live(&self, key: &str) -> bool {
        self.map
            .remove(key)
            .is_some_and(|(_, value)| !value.is_expired())
    }
}

impl Default for DashMapStore {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

use async_trait::async_trait;

#[async_trait]
impl CacheStore for DashMapStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(value) = self.map.get(key) else {
            return Ok(None);
        };
        if !value.is_expired() {
            return Ok(Some(value.bytes.clone()));
        }
        drop(value); // read guard must go before remove
        self.evict_if_expired(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.map
            .insert(key.to_string(), StoredValue::new(value.to_vec(), ttl));
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[DashMap] Stored key with TTL");
        Ok(true)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        Ok(self.remove_live(key))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::counter(0));
        let current = if entry.is_expired() {
            0
        } else {
            let text = std::str::from_utf8(&entry.bytes)
                .with_context(|| format!("key '{key}' does not hold a counter"))?;
            match text.parse::<i64>() {
                Ok(value) => value,
                Err(_) => bail!("key '{key}' does not hold a counter"),
            }
        };
        let next = current.saturating_add(delta);
        *entry = StoredValue::counter(next);
        Ok(next)
    }

    fn supports_tags(&self) -> bool {
        true
    }

    async fn put_tagged(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<bool> {
        self.put(key, value, ttl).await?;
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        Ok(true)
    }

    async fn flush_tags(&self, tags: &[String]) -> Result<usize> {
        let mut keys = HashSet::new();
        for tag in tags {
            // Atomic remove so a concurrent put_tagged lands in a fresh set
            if let Some((_, tagged)) = self.tags.remove(tag) {
                keys.extend(tagged);
            }
        }
        let removed = keys.iter().filter(|key| self.remove_live(key)).count();
        debug!(tags = ?tags, removed, "[DashMap] Flushed tags");
        Ok(removed)
    }

    fn supports_patterns(&self) -> bool {
        true
    }

    async fn forget_matching(&self, pattern: &str) -> Result<usize> {
        let matcher = Glob::new(pattern)
            .with_context(|| format!("invalid key pattern '{pattern}'"))?
            .compile_matcher();
        let mut removed = 0;
        self.map.retain(|key, value| {
            if matcher.is_match(key) {
                if !value.is_expired() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        debug!(pattern = %pattern, removed, "[DashMap] Removed keys matching pattern");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        const HEALTH_KEY: &str = "rebac:health:dashmap";
        self.map
            .insert(HEALTH_KEY.to_string(), StoredValue::new(b"ok".to_vec(), Duration::from_secs(1)));
        self.remove_live(HEALTH_KEY)
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}
