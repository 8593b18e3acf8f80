//! Cache configuration
//!
//! All settings have working defaults. Configuration is validated once, when
//! the cache is built, so a bad TTL is reported at boot instead of in the
//! middle of a request.
//!
//! # Environment
//!
//! [`PermissionCacheConfig::from_env`] overlays these variables on the
//! defaults (durations in seconds unless noted):
//!
//! | Variable | Field |
//! |----------|-------|
//! | `REBAC_CACHE_ENABLED` | `cache.enabled` |
//! | `REBAC_CACHE_STORE` | `cache.store` |
//! | `REBAC_CACHE_PREFIX` | `cache.prefix` |
//! | `REBAC_CACHE_POSITIVE_TTL` | `cache.positive_ttl` |
//! | `REBAC_CACHE_NEGATIVE_TTL` | `cache.negative_ttl` |
//! | `REBAC_CACHE_ERROR_TTL` | `cache.error_ttl` |
//! | `REBAC_CACHE_LOG_MISSES` | `cache.log_misses` |
//! | `REBAC_WRITE_BEHIND_ENABLED` | `write_behind.enabled` |
//! | `REBAC_WRITE_BEHIND_BATCH_SIZE` | `write_behind.batch_size` |
//! | `REBAC_WRITE_BEHIND_FLUSH_INTERVAL` | `write_behind.flush_interval` |
//! | `REBAC_WRITE_BEHIND_USE_QUEUE` | `write_behind.use_queue` |
//! | `REBAC_WRITE_BEHIND_QUEUE` | `write_behind.queue_name` |
//! | `REBAC_QUEUE_WORKERS` | `queue.workers` |

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Read-through and tagged cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When `false`, no component touches the store at all
    pub enabled: bool,
    /// Name of the store the cache lives in
    pub store: String,
    /// Prefix for every key written by this crate
    pub prefix: String,
    /// TTL for `true` check results and non-empty object lists
    #[serde(with = "duration_secs")]
    pub positive_ttl: Duration,
    /// TTL for `false` check results and empty object lists
    #[serde(with = "duration_secs")]
    pub negative_ttl: Duration,
    /// Cooldown during which a backend failure is replayed from the cache
    #[serde(with = "duration_secs")]
    pub error_ttl: Duration,
    /// Log every read-through miss at debug level
    pub log_misses: bool,
    /// Tag entries for selective invalidation when the store supports it
    pub tags: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: "memory".to_string(),
            prefix: "rebac".to_string(),
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(60),
            error_ttl: Duration::from_secs(5),
            log_misses: false,
            tags: true,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_ttls(mut self, positive: Duration, negative: Duration, error: Duration) -> Self {
        self.positive_ttl = positive;
        self.negative_ttl = negative;
        self.error_ttl = error;
        self
    }

    #[must_use]
    pub fn with_log_misses(mut self, log_misses: bool) -> Self {
        self.log_misses = log_misses;
        self
    }

    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] for empty names, zero
    /// TTLs, or TTLs not ordered `error <= negative <= positive`.
    pub fn validate(&self) -> Result<()> {
        if self.store.trim().is_empty() {
            return Err(invalid("cache.store must not be empty"));
        }
        if self.prefix.trim().is_empty() {
            return Err(invalid("cache.prefix must not be empty"));
        }
        for (name, ttl) in [
            ("positive_ttl", self.positive_ttl),
            ("negative_ttl", self.negative_ttl),
            ("error_ttl", self.error_ttl),
        ] {
            if ttl.is_zero() {
                return Err(invalid(format!("cache.{name} must be greater than zero")));
            }
        }
        if self.negative_ttl > self.positive_ttl {
            return Err(invalid(format!(
                "cache.negative_ttl ({}s) must not exceed cache.positive_ttl ({}s)",
                self.negative_ttl.as_secs(),
                self.positive_ttl.as_secs()
            )));
        }
        if self.error_ttl > self.negative_ttl {
            return Err(invalid(format!(
                "cache.error_ttl ({}s) must not exceed cache.negative_ttl ({}s)",
                self.error_ttl.as_secs(),
                self.negative_ttl.as_secs()
            )));
        }
        Ok(())
    }
}

/// Write-behind buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    pub enabled: bool,
    /// Pending operation count that triggers a flush
    pub batch_size: usize,
    /// Time since the last flush that triggers a flush
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    /// Dispatch one task per operation instead of writing synchronously
    pub use_queue: bool,
    /// Backend connection name carried on each dispatched task
    pub connection: String,
    pub queue_name: String,
    /// Flush pending operations when the cache is shut down
    pub flush_on_shutdown: bool,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            use_queue: false,
            connection: "default".to_string(),
            queue_name: "rebac-writes".to_string(),
            flush_on_shutdown: true,
        }
    }
}

impl WriteBehindConfig {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, use_queue: bool) -> Self {
        self.use_queue = use_queue;
        self
    }

    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] for a zero batch size or
    /// interval, or empty queue names when queueing is on.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("write_behind.batch_size must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("write_behind.flush_interval must be greater than zero"));
        }
        if self.use_queue && self.queue_name.trim().is_empty() {
            return Err(invalid("write_behind.queue_name must not be empty when use_queue is set"));
        }
        if self.use_queue && self.connection.trim().is_empty() {
            return Err(invalid("write_behind.connection must not be empty when use_queue is set"));
        }
        Ok(())
    }
}

/// Cache warming settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    pub enabled: bool,
    /// Maximum checks per `batch_check` call
    pub chunk_size: usize,
    /// Relations warmed for pairs found in recent activity
    pub common_relations: Vec<String>,
    /// Prime relations below the first granted one in a hierarchy as granted
    ///
    /// Only correct when higher relations imply lower ones in the model
    /// (`owner` ⊇ `editor` ⊇ `viewer`).
    pub infer_hierarchy: bool,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 100,
            common_relations: vec![
                "viewer".to_string(),
                "editor".to_string(),
                "owner".to_string(),
            ],
            infer_hierarchy: true,
        }
    }
}

impl WarmingConfig {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] for a zero chunk size.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(invalid("warming.chunk_size must be at least 1"));
        }
        Ok(())
    }
}

/// Worker pool settings for [`ChannelTaskQueue`](crate::queue::ChannelTaskQueue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// Attempts per task before it is dropped and logged
    pub max_attempts: u32,
    /// Base delay between attempts, doubled after each failure
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
    /// Channel capacity
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] for zero workers,
    /// attempts or capacity.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(invalid("queue.workers must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be at least 1"));
        }
        if self.capacity == 0 {
            return Err(invalid("queue.capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Complete configuration for a [`PermissionCache`](crate::PermissionCache)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionCacheConfig {
    pub cache: CacheConfig,
    pub write_behind: WriteBehindConfig,
    pub warming: WarmingConfig,
    pub queue: QueueConfig,
}

impl PermissionCacheConfig {
    /// Defaults overlaid with `REBAC_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] when a variable cannot be
    /// parsed or the result fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let cache = &mut config.cache;
        override_parsed(&lookup, "REBAC_CACHE_ENABLED", &mut cache.enabled)?;
        override_string(&lookup, "REBAC_CACHE_STORE", &mut cache.store);
        override_string(&lookup, "REBAC_CACHE_PREFIX", &mut cache.prefix);
        override_secs(&lookup, "REBAC_CACHE_POSITIVE_TTL", &mut cache.positive_ttl)?;
        override_secs(&lookup, "REBAC_CACHE_NEGATIVE_TTL", &mut cache.negative_ttl)?;
        override_secs(&lookup, "REBAC_CACHE_ERROR_TTL", &mut cache.error_ttl)?;
        override_parsed(&lookup, "REBAC_CACHE_LOG_MISSES", &mut cache.log_misses)?;

        let write_behind = &mut config.write_behind;
        override_parsed(&lookup, "REBAC_WRITE_BEHIND_ENABLED", &mut write_behind.enabled)?;
        override_parsed(&lookup, "REBAC_WRITE_BEHIND_BATCH_SIZE", &mut write_behind.batch_size)?;
        override_secs(
            &lookup,
            "REBAC_WRITE_BEHIND_FLUSH_INTERVAL",
            &mut write_behind.flush_interval,
        )?;
        override_parsed(&lookup, "REBAC_WRITE_BEHIND_USE_QUEUE", &mut write_behind.use_queue)?;
        override_string(&lookup, "REBAC_WRITE_BEHIND_QUEUE", &mut write_behind.queue_name);

        override_parsed(&lookup, "REBAC_QUEUE_WORKERS", &mut config.queue.workers)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first [`CacheError::InvalidConfiguration`] found.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.write_behind.validate()?;
        self.warming.validate()?;
        self.queue.validate()
    }
}

fn invalid(message: impl Into<String>) -> CacheError {
    CacheError::InvalidConfiguration(message.into())
}

fn override_string<F>(lookup: &F, name: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(name) {
        *target = value;
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| invalid(format!("{name}={raw:?}: {e}")))?;
    }
    Ok(())
}

fn override_secs<F>(lookup: &F, name: &str, target: &mut Duration) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs();
    override_parsed(lookup, name, &mut secs)?;
    *target = Duration::from_secs(secs);
    Ok(())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
