//! Redis Store - Distributed Store Backend
//!
//! Redis-based store shared by every process of a deployment, which is what
//! makes the hit/miss counters and tagged invalidation global:
//!
//! - counters use `INCRBY`
//! - each tag is a Redis set of member keys, written in the same `MULTI` as
//!   the value
//! - pattern eviction walks the keyspace with `SCAN MATCH`

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Keys fetched per `SCAN` round-trip
const SCAN_BATCH: usize = 500;

/// Redis store with `ConnectionManager` for automatic reconnection
pub struct RedisStore {
    conn: ConnectionManager,
    /// Prefix of the sets that index tagged keys
    tag_namespace: String,
}

impl RedisStore {
    /// Connect using `REDIS_URL` (default `redis://127.0.0.1:6379`)
    ///
    /// # Errors
    ///
    /// The client cannot be created or the server does not answer `PING`.
    pub async fn new() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        Self::with_url(&url).await
    }

    /// # Errors
    ///
    /// The client cannot be created or the server does not answer `PING`.
    pub async fn with_url(url: &str) -> Result<Self> {
        info!(redis_url = %url, "Connecting permission store to Redis");

        let client = Client::open(url).with_context(|| format!("invalid Redis URL '{url}'"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("cannot connect to Redis at '{url}'"))?;

        let store = Self {
            conn,
            tag_namespace: "rebac-tag".to_string(),
        };
        store.ping().await?;
        Ok(store)
    }

    /// Use a different prefix for tag index sets
    #[must_use]
    pub fn with_tag_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.tag_namespace = namespace.into();
        self
    }

    fn tag_key(&self, tag: &str) -> String {
        tag_key(&self.tag_namespace, tag)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis did not answer PING")?;
        Ok(())
    }

    /// Every key matching a glob, walking the cursor until it wraps
    ///
    /// # Errors
    ///
    /// A `SCAN` round-trip failed.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SCAN MATCH '{pattern}' failed"))?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, found = found.len(), "[Redis] Scanned keyspace");
        Ok(found)
    }

    /// `DEL` many keys at once; returns how many existed
    ///
    /// # Errors
    ///
    /// The `DEL` failed.
    pub async fn remove_bulk(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(keys).await?;
        Ok(removed)
    }
}

fn tag_key(namespace: &str, tag: &str) -> String {
    format!("{namespace}:{tag}")
}

/// `SET EX` of the value plus `SADD` into each tag set, as one `MULTI`
///
/// Tag sets expire too, never before their longest-lived member: `NX` gives
/// a new set the entry's TTL and `GT` only ever extends it.
fn tagged_set_pipeline(
    namespace: &str,
    key: &str,
    value: &[u8],
    ttl: Duration,
    tags: &[String],
) -> redis::Pipeline {
    // SET EX rejects 0; sub-second TTLs round up
    let secs = ttl.as_secs().max(1);
    let mut pipe = redis::pipe();
    pipe.atomic().set_ex(key, value, secs).ignore();
    for tag in tags {
        let set = tag_key(namespace, tag);
        pipe.sadd(&set, key).ignore();
        for mode in ["NX", "GT"] {
            pipe.cmd("EXPIRE").arg(&set).arg(secs).arg(mode).ignore();
        }
    }
    pipe
}

// ===== Trait Implementations =====

use crate::traits::CacheStore;
use async_trait::async_trait;

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET EX rejects 0; sub-second TTLs round up
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await?;
        Ok(true)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, delta).await?)
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
        let pipe = tagged_set_pipeline(&self.tag_namespace, key, value, ttl, tags);
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("tagged SET of '{key}' failed"))?;
        Ok(true)
    }

    async fn flush_tags(&self, tags: &[String]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut members = HashSet::new();
        for tag in tags {
            let tagged: Vec<String> = conn.smembers(self.tag_key(tag)).await?;
            members.extend(tagged);
        }

        let members: Vec<String> = members.into_iter().collect();
        let removed = self.remove_bulk(&members).await?;
        let index_sets: Vec<String> = tags.iter().map(|tag| self.tag_key(tag)).collect();
        self.remove_bulk(&index_sets).await?;

        debug!(tags = ?tags, removed, "[Redis] Flushed tags");
        Ok(removed)
    }

    fn supports_patterns(&self) -> bool {
        true
    }

    async fn forget_matching(&self, pattern: &str) -> Result<usize> {
        let keys = self.scan_keys(pattern).await?;
        let removed = self.remove_bulk(&keys).await?;
        debug!(pattern = %pattern, removed, "[Redis] Removed keys matching pattern");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        self.ping().await.is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_sets_expire_with_their_members() {
        let tags = vec!["user:1".to_string(), "relation:viewer".to_string()];
        let pipe = tagged_set_pipeline("rebac-tag", "k", b"v", Duration::from_secs(300), &tags);
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned();

        for tag in &tags {
            assert!(packed.contains(&format!("rebac-tag:{tag}")));
        }
        assert_eq!(packed.matches("SADD").count(), 2);
        assert_eq!(packed.matches("EXPIRE").count(), 4);
        assert!(packed.contains("NX"));
        assert!(packed.contains("GT"));
        assert!(packed.contains("MULTI"));
    }
}
