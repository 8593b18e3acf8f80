//! Cache Store Implementations
//!
//! # Available Stores
//!
//! - **`DashMap`** - In-process, tags and glob patterns supported (always available)
//! - **Moka** - In-process and bounded, no tags or patterns (feature: `moka`)
//! - **Redis** - Shared between processes, tags and patterns supported (feature: `redis`)
//!
//! Any other key-value system can be plugged in by implementing
//! [`CacheStore`](crate::traits::CacheStore).
//!
//! # Usage
//!
//! ```rust,no_run
//! use rebac_cache::backends::{DashMapStore, RedisStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let local = DashMapStore::new();
//! let shared = RedisStore::new().await?;
//! # Ok(())
//! # }
//! ```

pub mod dashmap_store;

#[cfg(feature = "moka")]
pub mod moka_store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use dashmap_store::DashMapStore;

#[cfg(feature = "moka")]
pub use moka_store::{MokaStore, MokaStoreConfig};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
