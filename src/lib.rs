//! ReBAC Permission Cache
//!
//! A caching and batching layer in front of a relationship-based
//! authorization service (Zanzibar style: `user` has `relation` on `object`):
//! - **Read-through cache**: positive, negative and error TTLs, request coalescing
//! - **Write-behind buffer**: last-intent-wins coalescing, batched or queued flushes
//! - **Cache warming**: batches, privilege hierarchies, related objects, recent activity
//! - **Tagged invalidation**: evict by user, object, relation or type
//! - **Pluggable stores**: `DashMap`, Moka, Redis, or your own [`CacheStore`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rebac_cache::PermissionCacheBuilder;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = PermissionCacheBuilder::new(Arc::new(MyBackend::new()))
//!         .build()
//!         .await?;
//!
//!     // Grant, then check: answered by the optimistic cache entry
//!     cache.write_behind().write("user:1", "editor", "document:9").await?;
//!     assert!(cache.check("user:1", "editor", "document:9").await?);
//!
//!     let stats = cache.read_through().stats().await?;
//!     tracing::info!("Hit rate: {:.2}%", stats.hit_rate);
//!
//!     cache.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! check ──→ ReadThroughCache ──hit──→ answer
//!                 │ miss
//!                 ↓
//!         AuthorizationBackend ──→ classify ──→ CacheStore (TTL by class)
//!
//! write ──→ WriteBehindCache ──→ prime ReadThroughCache
//!                 │ batch size / interval / explicit
//!                 ↓
//!         backend.write (sync)  or  TaskDispatcher (queued)
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod backends;
pub mod batching;
pub mod builder;
pub mod codecs;
pub mod config;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod events;
pub mod queue;
pub mod read_through;
pub mod tagged;
pub mod traits;
pub mod tuple;
pub mod warmer;
pub mod write_behind;

pub use backends::DashMapStore;
#[cfg(feature = "moka")]
pub use backends::{MokaStore, MokaStoreConfig};
#[cfg(feature = "redis")]
pub use backends::RedisStore;

pub use builder::PermissionCacheBuilder;
pub use config::{CacheConfig, PermissionCacheConfig, QueueConfig, WarmingConfig, WriteBehindConfig};
pub use entry::{CacheEntry, CachedValue, Classification};
pub use error::{CacheError, Result};
pub use events::{BroadcastObserver, CacheEvent, CacheObserver, Observers};
pub use queue::{ChannelTaskQueue, QueueStats, WriteOperation, WriteTask};
pub use read_through::{CacheStats, ReadThroughCache};
pub use tagged::TaggedCache;
pub use traits::{
    ActivityRecord, ActivitySource, AuthorizationBackend, CacheCodec, CacheStore, TaskDispatcher,
};
pub use tuple::{PermissionTuple, TupleInput};
pub use warmer::CacheWarmer;
pub use write_behind::{FlushResult, OperationKind, PendingCount, PendingOperation, WriteBehindCache};

// Re-export async_trait for implementors of the collaborator traits
pub use async_trait::async_trait;

/// Main entry point: every cache component wired to one backend and store
///
/// Built with [`PermissionCacheBuilder`]. Components are shared behind
/// `Arc`, so the accessors can be cloned into other tasks.
pub struct PermissionCache {
    read_through: Arc<ReadThroughCache>,
    write_behind: Arc<WriteBehindCache>,
    warmer: Arc<CacheWarmer>,
    tagged: Arc<TaggedCache>,
    observers: Observers,
    queue: Option<Arc<ChannelTaskQueue>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    config: PermissionCacheConfig,
}

impl PermissionCache {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        read_through: Arc<ReadThroughCache>,
        write_behind: Arc<WriteBehindCache>,
        warmer: Arc<CacheWarmer>,
        tagged: Arc<TaggedCache>,
        observers: Observers,
        queue: Option<Arc<ChannelTaskQueue>>,
        flush_task: Option<JoinHandle<()>>,
        config: PermissionCacheConfig,
    ) -> Self {
        Self {
            read_through,
            write_behind,
            warmer,
            tagged,
            observers,
            queue,
            flush_task: Mutex::new(flush_task),
            config,
        }
    }

    /// Shorthand for [`ReadThroughCache::check`]
    ///
    /// # Errors
    ///
    /// See [`ReadThroughCache::check`].
    pub async fn check(&self, user: &str, relation: &str, object: &str) -> Result<bool> {
        self.read_through.check(user, relation, object).await
    }

    #[must_use]
    pub fn read_through(&self) -> &Arc<ReadThroughCache> {
        &self.read_through
    }

    #[must_use]
    pub fn write_behind(&self) -> &Arc<WriteBehindCache> {
        &self.write_behind
    }

    #[must_use]
    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    #[must_use]
    pub fn tagged(&self) -> &Arc<TaggedCache> {
        &self.tagged
    }

    /// Register an observer for warming and flush events
    pub fn subscribe(&self, observer: Arc<dyn CacheObserver>) {
        self.observers.subscribe(observer);
    }

    #[must_use]
    pub fn config(&self) -> &PermissionCacheConfig {
        &self.config
    }

    /// Counters of the in-process write queue, when one was started
    #[must_use]
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.queue.as_ref().map(|queue| queue.stats())
    }

    /// Verify the store is operational
    pub async fn health_check(&self) -> bool {
        let healthy = self.read_through.health_check().await;
        if healthy {
            info!("Permission cache health check passed");
        } else {
            warn!("Permission cache health check failed");
        }
        healthy
    }

    /// Stop background work and flush buffered writes if configured
    ///
    /// Waits for the in-process write queue to drain.
    ///
    /// # Errors
    ///
    /// Errors of the final write-behind flush; the queue is still drained.
    pub async fn shutdown(&self) -> Result<FlushResult> {
        info!("Shutting down permission cache");
        let flushed = self.write_behind.shutdown().await;

        let flush_task = self.flush_task.lock().take();
        if let Some(task) = flush_task {
            if let Err(e) = task.await {
                error!(error = %e, "Write-behind flush task panicked");
            }
        }
        if let Some(queue) = &self.queue {
            queue.shutdown().await;
        }
        flushed
    }
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("read_through", &self.read_through)
            .field("write_behind", &self.write_behind)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}
