//! Collaborator Traits
//!
//! The cache sits between framework glue and a remote ReBAC service. Every
//! collaborator it talks to is a trait here, injected at construction:
//!
//! - `AuthorizationBackend`: the authorization service (check, batch check,
//!   list objects, tuple writes)
//! - `CacheStore`: key-value store with TTL, optional tags and patterns
//! - `TaskDispatcher`: fire-and-forget job queue for write-behind
//! - `ActivitySource`: recent `(user, object)` access pairs for warming
//! - `CacheCodec`: serialization of stored entries
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use rebac_cache::{CacheStore, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyStore {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> { todo!() }
//!     async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> { todo!() }
//!     async fn forget(&self, key: &str) -> Result<bool> { todo!() }
//!     async fn increment(&self, key: &str, delta: i64) -> Result<i64> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

use crate::queue::WriteTask;
use crate::tuple::PermissionTuple;

/// Trait for stored-entry serialization
///
/// Implementations must be `Send + Sync + Debug` so one codec can be shared
/// by every component.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name for logging
    fn name(&self) -> &'static str;
}

/// The remote relationship-based authorization service
///
/// Calls block on a network round-trip and may fail; the cache never turns
/// a failure into an answer.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
    /// Whether `tuple.user` has `tuple.relation` on `tuple.object`
    ///
    /// # Errors
    ///
    /// Any transport or server failure.
    async fn check(
        &self,
        tuple: &PermissionTuple,
        contextual_tuples: &[PermissionTuple],
        context: Option<&serde_json::Value>,
    ) -> Result<bool>;

    /// Check many tuples at once; results are order-aligned with `checks`
    ///
    /// # Errors
    ///
    /// Any transport or server failure.
    async fn batch_check(&self, checks: &[PermissionTuple]) -> Result<Vec<bool>>;

    /// Objects of `object_type` on which `user` has `relation`
    ///
    /// # Errors
    ///
    /// Any transport or server failure.
    async fn list_objects(
        &self,
        user: &str,
        relation: &str,
        object_type: &str,
        contextual_tuples: &[PermissionTuple],
        context: Option<&serde_json::Value>,
    ) -> Result<Vec<String>>;

    /// Write and delete tuples in one request
    ///
    /// # Errors
    ///
    /// Partial or total failure of the write.
    async fn write(&self, writes: &[PermissionTuple], deletes: &[PermissionTuple]) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Key-value store with TTL support
///
/// Expiry is entirely the store's job. Stores shared between processes must
/// make `get`, `put` and `increment` atomic on their own.
///
/// Tag and pattern support are optional capabilities. Stores without them
/// keep the defaults, and callers degrade to returning zero.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// # Errors
    ///
    /// Store transport failure.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// # Errors
    ///
    /// Store transport failure.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Returns whether a value was removed
    ///
    /// # Errors
    ///
    /// Store transport failure.
    async fn forget(&self, key: &str) -> Result<bool>;

    /// Atomically add `delta` to a counter (missing counters start at 0)
    ///
    /// # Errors
    ///
    /// Store transport failure, or the key holds a non-counter value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Whether `put_tagged` indexes tags and `flush_tags` can evict by them
    fn supports_tags(&self) -> bool {
        false
    }

    /// Store a value and associate it with `tags`
    ///
    /// # Errors
    ///
    /// Store transport failure.
    async fn put_tagged(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<bool> {
        let _ = tags;
        self.put(key, value, ttl).await
    }

    /// Evict every entry carrying any of `tags`; returns the eviction count
    ///
    /// # Errors
    ///
    /// Store transport failure.
    async fn flush_tags(&self, tags: &[String]) -> Result<usize> {
        let _ = tags;
        Ok(0)
    }

    /// Whether `forget_matching` understands glob patterns
    fn supports_patterns(&self) -> bool {
        false
    }

    /// Evict every key matching a glob pattern; returns the eviction count
    ///
    /// # Errors
    ///
    /// Store transport failure or an invalid pattern.
    async fn forget_matching(&self, pattern: &str) -> Result<usize> {
        let _ = pattern;
        Ok(0)
    }

    /// Verify the store is operational
    async fn health_check(&self) -> bool;

    /// Store name for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Fire-and-forget job queue used by queued write-behind flushes
///
/// Retrying a dispatched task is the dispatcher's business, not the cache's.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue `task` on `queue`; returns once enqueued, not once applied
    ///
    /// # Errors
    ///
    /// The task could not be enqueued.
    async fn dispatch(&self, task: WriteTask, queue: &str) -> Result<()>;
}

/// A `(user, object)` pair seen recently
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub struct ActivityRecord {
    pub user: String,
    pub object: String,
}

impl ActivityRecord {
    pub fn new(user: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            object: object.into(),
        }
    }
}

/// Source of recent access activity, such as an access log
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Pairs observed within the last `window`
    ///
    /// # Errors
    ///
    /// The source could not be read.
    async fn recent_activity(&self, window: Duration) -> Result<Vec<ActivityRecord>>;
}
