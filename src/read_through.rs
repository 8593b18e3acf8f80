//! Read-Through Permission Cache
//!
//! Wraps the backend's `check`, `batch_check` and `list_objects` calls:
//!
//! ```text
//! Request → store lookup → hit: return cached value
//!                        → miss: coalesce → backend → classify → store (TTL by class)
//! ```
//!
//! Classification picks the TTL once, when the entry is written:
//!
//! | Result | TTL |
//! |--------|-----|
//! | `true` / non-empty list | `positive_ttl` |
//! | `false` / empty list | `negative_ttl` |
//! | backend error | `error_ttl` |
//!
//! A backend error is stored as an error entry and then returned. While that
//! entry lives, identical requests get the same error without reaching the
//! backend. The cache never answers `true` or `false` on its own.

use indexmap::IndexSet;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::batching::{build_cache_key, normalize_contextual_tuples, sanitize_str};
use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::dedup::RequestCoalescer;
use crate::entry::{CacheEntry, CachedValue};
use crate::error::{CacheError, Result};
use crate::traits::{AuthorizationBackend, CacheCodec, CacheStore};
use crate::tuple::{
    PermissionTuple, TupleInput, object_type_tag, relation_tag, type_of, user_type_tag,
};

/// Hit/miss statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups served from the cache, `0.0` before any lookup
    pub hit_rate: f64,
}

impl CacheStats {
    #[must_use]
    pub fn new(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            hits,
            misses,
            hit_rate,
        }
    }
}

/// Outcome of reading one key
enum Lookup {
    Hit(CachedValue),
    /// An error entry is cooling down
    Failed(String),
    Miss,
}

/// Read-through cache in front of an [`AuthorizationBackend`]
///
/// Safe to share between tasks: all state lives in the store, apart from the
/// in-flight map used to coalesce identical misses.
pub struct ReadThroughCache {
    backend: Arc<dyn AuthorizationBackend>,
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    codec: JsonCodec,
    coalescer: RequestCoalescer,
}

impl ReadThroughCache {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] when `config` is invalid.
    pub fn new(
        backend: Arc<dyn AuthorizationBackend>,
        store: Arc<dyn CacheStore>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            backend = backend.name(),
            store = store.name(),
            enabled = config.enabled,
            positive_ttl_secs = config.positive_ttl.as_secs(),
            negative_ttl_secs = config.negative_ttl.as_secs(),
            error_ttl_secs = config.error_ttl.as_secs(),
            "Initializing read-through permission cache"
        );
        Ok(Self {
            backend,
            store,
            config,
            codec: JsonCodec,
            coalescer: RequestCoalescer::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Cache key of a check
    #[must_use]
    pub fn check_key(&self, user: &str, relation: &str, object: &str) -> String {
        build_cache_key(
            &self.config.prefix,
            "check",
            [("user", user), ("relation", relation), ("object", object)],
        )
    }

    /// Cache key of a list-objects call
    #[must_use]
    pub fn list_objects_key(&self, user: &str, relation: &str, object_type: &str) -> String {
        build_cache_key(
            &self.config.prefix,
            "list_objects",
            [("user", user), ("relation", relation), ("type", object_type)],
        )
    }

    /// Whether `user` has `relation` on `object`
    ///
    /// # Errors
    ///
    /// [`CacheError::BackendUnavailable`] when the backend fails (or failed
    /// within the last `error_ttl`), [`CacheError::Store`] when the store does.
    pub async fn check(&self, user: &str, relation: &str, object: &str) -> Result<bool> {
        self.check_with_context(user, relation, object, &[], None)
            .await
    }

    /// [`check`](Self::check) with contextual tuples and condition context
    ///
    /// Non-empty contextual tuples or context bypass the cache entirely:
    /// such results depend on request data and are not safely cacheable.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub async fn check_with_context(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual_tuples: &[TupleInput],
        context: Option<&Value>,
    ) -> Result<bool> {
        let tuple = PermissionTuple::new(user, relation, object);
        let contextual = normalize_contextual_tuples(contextual_tuples);

        if !self.config.enabled || !contextual.is_empty() || has_context(context) {
            return self
                .backend
                .check(&tuple, &contextual, context)
                .await
                .map_err(|e| CacheError::backend("check", e));
        }

        let key = self.check_key(user, relation, object);
        let backend = Arc::clone(&self.backend);
        let value = self
            .read_through(
                &key,
                &tuple.tags(),
                "check",
                CachedValue::Allowed(false),
                || async move {
                    backend
                        .check(&tuple, &[], None)
                        .await
                        .map(CachedValue::Allowed)
                },
            )
            .await?;

        match value {
            CachedValue::Allowed(allowed) => Ok(allowed),
            CachedValue::Objects(_) => Err(CacheError::Codec(anyhow::anyhow!(
                "check entry '{key}' holds an object list"
            ))),
        }
    }

    /// Objects of `object_type` on which `user` has `relation`
    ///
    /// Non-empty lists are kept for `positive_ttl`, empty ones for
    /// `negative_ttl`. Contextual tuples or context bypass the cache.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub async fn list_objects(
        &self,
        user: &str,
        relation: &str,
        object_type: &str,
        contextual_tuples: &[TupleInput],
        context: Option<&Value>,
    ) -> Result<Vec<String>> {
        let contextual = normalize_contextual_tuples(contextual_tuples);

        if !self.config.enabled || !contextual.is_empty() || has_context(context) {
            return self
                .backend
                .list_objects(user, relation, object_type, &contextual, context)
                .await
                .map_err(|e| CacheError::backend("list_objects", e));
        }

        let key = self.list_objects_key(user, relation, object_type);
        let tags = vec![
            user.to_string(),
            relation_tag(relation),
            user_type_tag(type_of(user)),
            object_type_tag(object_type),
        ];
        let backend = Arc::clone(&self.backend);
        let (user_owned, relation_owned, type_owned) =
            (user.to_string(), relation.to_string(), object_type.to_string());
        let value = self
            .read_through(
                &key,
                &tags,
                "list_objects",
                CachedValue::Objects(Vec::new()),
                || async move {
                    backend
                        .list_objects(&user_owned, &relation_owned, &type_owned, &[], None)
                        .await
                        .map(CachedValue::Objects)
                },
            )
            .await?;

        match value {
            CachedValue::Objects(objects) => Ok(objects),
            CachedValue::Allowed(_) => Err(CacheError::Codec(anyhow::anyhow!(
                "list_objects entry '{key}' holds a check result"
            ))),
        }
    }

    /// Check many tuples; results are order-aligned with `checks`
    ///
    /// Duplicate triples are resolved once. Cached triples are answered from
    /// the store and only the distinct misses go to the backend, in a single
    /// `batch_check` call.
    ///
    /// # Errors
    ///
    /// [`CacheError::BackendUnavailable`] when the backend call fails or
    /// returns a result count that does not match the request.
    pub async fn batch_check(&self, checks: &[PermissionTuple]) -> Result<Vec<bool>> {
        if !self.config.enabled {
            return self
                .backend
                .batch_check(checks)
                .await
                .map_err(|e| CacheError::backend("batch_check", e));
        }

        // Identity is the tuple itself, never a joined string
        let distinct: IndexSet<&PermissionTuple> = checks.iter().collect();
        let mut answers: HashMap<&PermissionTuple, bool> = HashMap::with_capacity(distinct.len());
        let mut misses = Vec::new();

        for &tuple in &distinct {
            let key = self.check_key(&tuple.user, &tuple.relation, &tuple.object);
            match self.lookup(&key).await? {
                Lookup::Hit(CachedValue::Allowed(allowed)) => {
                    answers.insert(tuple, allowed);
                }
                // Cooling-down failures are retried: the batch call happens anyway
                Lookup::Hit(CachedValue::Objects(_)) | Lookup::Failed(_) | Lookup::Miss => {
                    misses.push((key, tuple));
                }
            }
        }

        self.record("hits", answers.len()).await;
        self.record("misses", misses.len()).await;

        if !misses.is_empty() {
            let tuples: Vec<PermissionTuple> =
                misses.iter().map(|(_, tuple)| (*tuple).clone()).collect();
            let results = self
                .backend
                .batch_check(&tuples)
                .await
                .map_err(|e| CacheError::backend("batch_check", e))?;

            if results.len() != tuples.len() {
                return Err(CacheError::backend(
                    "batch_check",
                    anyhow::anyhow!(
                        "backend returned {} results for {} checks",
                        results.len(),
                        tuples.len()
                    ),
                ));
            }

            for ((key, tuple), allowed) in misses.into_iter().zip(results) {
                self.store_entry(&key, &CacheEntry::allowed(allowed), &tuple.tags())
                    .await?;
                answers.insert(tuple, allowed);
            }
        }

        debug!(
            requested = checks.len(),
            distinct = distinct.len(),
            "Resolved batch check"
        );

        Ok(checks
            .iter()
            .map(|check| answers.get(check).copied().unwrap_or(false))
            .collect())
    }

    /// Store a known check result (optimistic writes, warming)
    ///
    /// No-op when the cache is disabled.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the store fails.
    pub async fn prime(&self, user: &str, relation: &str, object: &str, allowed: bool) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let tuple = PermissionTuple::new(user, relation, object);
        let key = self.check_key(user, relation, object);
        self.store_entry(&key, &CacheEntry::allowed(allowed), &tuple.tags())
            .await
    }

    /// Remove a cached check result; returns whether one was removed
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the store fails.
    pub async fn forget(&self, user: &str, relation: &str, object: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        self.store
            .forget(&self.check_key(user, relation, object))
            .await
            .map_err(|e| CacheError::store("forget", e))
    }

    /// Evict every entry tagged with `identifier`
    ///
    /// `identifier` is a user or object (`user:1`, `document:9`) or a derived
    /// tag such as `relation:viewer`. Returns `0` when the store has no tag
    /// support.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the store fails.
    pub async fn invalidate(&self, identifier: &str) -> Result<usize> {
        if !self.config.enabled || !self.config.tags || !self.store.supports_tags() {
            return Ok(0);
        }
        let removed = self
            .store
            .flush_tags(&[identifier.to_string()])
            .await
            .map_err(|e| CacheError::store("flush_tags", e))?;
        debug!(identifier = %sanitize_str(identifier), removed, "Invalidated permission entries");
        Ok(removed)
    }

    /// Hit/miss counters, shared by every process using the same store
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the counters cannot be read.
    pub async fn stats(&self) -> Result<CacheStats> {
        if !self.config.enabled {
            return Ok(CacheStats::new(0, 0));
        }
        let hits = self.read_counter("hits").await?;
        let misses = self.read_counter("misses").await?;
        Ok(CacheStats::new(hits, misses))
    }

    /// Zero the hit/miss counters; cached entries are left alone
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the counters cannot be removed.
    pub async fn reset_stats(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        for name in ["hits", "misses"] {
            self.store
                .forget(&self.stats_key(name))
                .await
                .map_err(|e| CacheError::store("forget", e))?;
        }
        Ok(())
    }

    /// Verify the store is operational
    pub async fn health_check(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.store.health_check().await
    }

    async fn read_through<F, Fut>(
        &self,
        key: &str,
        tags: &[String],
        operation: &'static str,
        placeholder: CachedValue,
        fetch: F,
    ) -> Result<CachedValue>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<CachedValue>> + Send,
    {
        // Fast path without taking the in-flight lock
        if let Some(value) = self.resolve_cached(key, operation).await? {
            return Ok(value);
        }

        let _guard = self.coalescer.acquire(key).await;

        // Another request may have filled the entry while we waited
        if let Some(value) = self.resolve_cached(key, operation).await? {
            return Ok(value);
        }

        self.record("misses", 1).await;
        if self.config.log_misses {
            debug!(operation, key = %sanitize_str(key), "Permission cache miss");
        }

        match fetch().await {
            Ok(value) => {
                let entry = CacheEntry::of(value);
                self.store_entry(key, &entry, tags).await?;
                Ok(entry.value)
            }
            Err(error) => {
                let entry = CacheEntry::error(placeholder, error.to_string());
                if let Err(store_error) = self.store_entry(key, &entry, tags).await {
                    warn!(
                        operation,
                        error = %store_error,
                        "Failed to store backend error entry"
                    );
                }
                Err(CacheError::backend(operation, error))
            }
        }
    }

    /// `Some` when the key is answered from the cache (value or cached failure)
    async fn resolve_cached(
        &self,
        key: &str,
        operation: &'static str,
    ) -> Result<Option<CachedValue>> {
        match self.lookup(key).await? {
            Lookup::Hit(value) => {
                self.record("hits", 1).await;
                Ok(Some(value))
            }
            Lookup::Failed(message) => {
                self.record("hits", 1).await;
                Err(CacheError::BackendUnavailable {
                    operation,
                    cached: true,
                    source: anyhow::anyhow!(message),
                })
            }
            Lookup::Miss => Ok(None),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Lookup> {
        let Some(bytes) = self
            .store
            .get(key)
            .await
            .map_err(|e| CacheError::store("get", e))?
        else {
            return Ok(Lookup::Miss);
        };

        match self.codec.deserialize::<CacheEntry>(&bytes) {
            Ok(entry) if entry.is_error => Ok(Lookup::Failed(
                entry
                    .message
                    .unwrap_or_else(|| "backend failure".to_string()),
            )),
            Ok(entry) => Ok(Lookup::Hit(entry.value)),
            Err(error) => {
                warn!(key = %sanitize_str(key), error = %error, "Discarding undecodable cache entry");
                Ok(Lookup::Miss)
            }
        }
    }

    async fn store_entry(&self, key: &str, entry: &CacheEntry, tags: &[String]) -> Result<()> {
        let ttl = entry.classification().ttl(&self.config);
        let bytes = self.codec.serialize(entry).map_err(CacheError::Codec)?;
        let stored = if self.config.tags && self.store.supports_tags() {
            self.store.put_tagged(key, &bytes, ttl, tags).await
        } else {
            self.store.put(key, &bytes, ttl).await
        };
        stored.map_err(|e| CacheError::store("put", e))?;
        debug!(
            key = %sanitize_str(key),
            ttl_secs = ttl.as_secs(),
            error = entry.is_error,
            "Stored permission entry"
        );
        Ok(())
    }

    fn stats_key(&self, name: &str) -> String {
        format!("{}:stats:{name}", self.config.prefix)
    }

    /// Counter failures are logged; they never fail the request
    async fn record(&self, name: &str, count: usize) {
        if count == 0 {
            return;
        }
        let delta = i64::try_from(count).unwrap_or(i64::MAX);
        if let Err(error) = self.store.increment(&self.stats_key(name), delta).await {
            warn!(counter = name, error = %error, "Failed to update cache statistics");
        }
    }

    async fn read_counter(&self, name: &str) -> Result<u64> {
        let raw = self
            .store
            .get(&self.stats_key(name))
            .await
            .map_err(|e| CacheError::store("get", e))?;
        Ok(raw
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("backend", &self.backend.name())
            .field("store", &self.store.name())
            .field("config", &self.config)
            .field("in_flight", &self.coalescer.in_flight())
            .finish()
    }
}

/// Whether a condition context carries any data
fn has_context(context: Option<&Value>) -> bool {
    match context {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}
