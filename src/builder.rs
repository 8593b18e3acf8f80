//! Permission Cache Builder
//!
//! Wires the components of a [`PermissionCache`] around one backend and one
//! store from a single validated configuration.
//!
//! # Example: Defaults
//!
//! ```rust,ignore
//! use rebac_cache::PermissionCacheBuilder;
//! use std::sync::Arc;
//!
//! let cache = PermissionCacheBuilder::new(Arc::new(MyBackend::new()))
//!     .build()
//!     .await?;
//! ```
//!
//! # Example: Shared Store and Queued Writes
//!
//! ```rust,ignore
//! use rebac_cache::{PermissionCacheBuilder, PermissionCacheConfig};
//! use rebac_cache::backends::RedisStore;
//! use std::sync::Arc;
//!
//! let mut config = PermissionCacheConfig::from_env()?;
//! config.write_behind = config.write_behind.with_queue(true);
//!
//! let cache = PermissionCacheBuilder::new(Arc::new(MyBackend::new()))
//!     .with_config(config)
//!     .with_store(Arc::new(RedisStore::new().await?))
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;
use tracing::info;

use crate::backends::DashMapStore;
use crate::config::PermissionCacheConfig;
use crate::error::{CacheError, Result};
use crate::events::Observers;
use crate::queue::ChannelTaskQueue;
use crate::read_through::ReadThroughCache;
use crate::tagged::TaggedCache;
use crate::traits::{ActivitySource, AuthorizationBackend, CacheStore, TaskDispatcher};
use crate::warmer::CacheWarmer;
use crate::write_behind::WriteBehindCache;
use crate::PermissionCache;

/// Builder for [`PermissionCache`]
///
/// # Default Behavior
///
/// - **Store**: picked by `cache.store` (`memory`, `moka`, `redis`)
/// - **Dispatcher**: an in-process [`ChannelTaskQueue`] when queued
///   write-behind is enabled and no dispatcher was given
/// - **Flush ticker**: started when write-behind is enabled
pub struct PermissionCacheBuilder {
    backend: Arc<dyn AuthorizationBackend>,
    store: Option<Arc<dyn CacheStore>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    activity: Option<Arc<dyn ActivitySource>>,
    config: PermissionCacheConfig,
    flush_task: bool,
}

impl PermissionCacheBuilder {
    pub fn new(backend: Arc<dyn AuthorizationBackend>) -> Self {
        Self {
            backend,
            store: None,
            dispatcher: None,
            activity: None,
            config: PermissionCacheConfig::default(),
            flush_task: true,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PermissionCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `store` instead of the one named by `cache.store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Dispatcher for queued write-behind flushes (e.g. an external job system)
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn with_activity_source(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Whether to start the interval flush ticker (default `true`)
    #[must_use]
    pub fn with_flush_task(mut self, enabled: bool) -> Self {
        self.flush_task = enabled;
        self
    }

    /// Validate the configuration and wire every component
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidConfiguration`] for an invalid configuration or
    /// unknown store name, [`CacheError::Store`] when the store cannot be
    /// reached.
    pub async fn build(self) -> Result<PermissionCache> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => default_store(&config.cache.store).await?,
        };

        info!(
            backend = self.backend.name(),
            store = store.name(),
            write_behind = config.write_behind.enabled,
            use_queue = config.write_behind.use_queue,
            "Building permission cache"
        );

        let observers = Observers::new();
        let read = Arc::new(ReadThroughCache::new(
            Arc::clone(&self.backend),
            Arc::clone(&store),
            config.cache.clone(),
        )?);

        let mut queue = None;
        let dispatcher = match self.dispatcher {
            Some(dispatcher) => Some(dispatcher),
            None if config.write_behind.enabled && config.write_behind.use_queue => {
                let channel = Arc::new(ChannelTaskQueue::spawn(
                    Arc::clone(&self.backend),
                    config.queue.clone(),
                )?);
                queue = Some(Arc::clone(&channel));
                Some(channel as Arc<dyn TaskDispatcher>)
            }
            None => None,
        };

        let write_behind = Arc::new(
            WriteBehindCache::new(
                Arc::clone(&self.backend),
                Arc::clone(&read),
                dispatcher,
                config.write_behind.clone(),
            )?
            .with_observers(observers.clone()),
        );

        let mut warmer = CacheWarmer::new(
            Arc::clone(&self.backend),
            Arc::clone(&read),
            config.warming.clone(),
        )?
        .with_observers(observers.clone());
        if let Some(activity) = self.activity {
            warmer = warmer.with_activity_source(activity);
        }

        let tagged = Arc::new(TaggedCache::new(Arc::clone(&store), config.cache.clone())?);

        let flush_task = (self.flush_task && config.write_behind.enabled)
            .then(|| write_behind.spawn_flush_task());

        Ok(PermissionCache::from_parts(
            read,
            write_behind,
            Arc::new(warmer),
            tagged,
            observers,
            queue,
            flush_task,
            config,
        ))
    }
}

async fn default_store(name: &str) -> Result<Arc<dyn CacheStore>> {
    match name {
        "memory" | "dashmap" => Ok(Arc::new(DashMapStore::new())),
        #[cfg(feature = "moka")]
        "moka" => Ok(Arc::new(crate::backends::MokaStore::new(
            crate::backends::MokaStoreConfig::default(),
        ))),
        #[cfg(feature = "redis")]
        "redis" => {
            let store = crate::backends::RedisStore::new()
                .await
                .map_err(|e| CacheError::store("connect", e))?;
            Ok(Arc::new(store))
        }
        other => Err(CacheError::InvalidConfiguration(format!(
            "unknown cache store '{other}'"
        ))),
    }
}
