//! Cache Warmer
//!
//! Populates the read-through cache ahead of demand. Every method returns the
//! number of entries it warmed, so callers (and tests) can see exactly how
//! much work was done.
//!
//! Warming is best-effort. A failed backend call is logged and counts as
//! nothing warmed; it is never reported as an error, since the read path will
//! simply miss and ask the backend itself.

use futures_util::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::batching::escape_key_part;
use crate::config::WarmingConfig;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, Observers};
use crate::read_through::ReadThroughCache;
use crate::traits::{ActivitySource, AuthorizationBackend};
use crate::tuple::{PermissionTuple, type_of};

/// Proactively fills a [`ReadThroughCache`]
pub struct CacheWarmer {
    backend: Arc<dyn AuthorizationBackend>,
    cache: Arc<ReadThroughCache>,
    activity: Option<Arc<dyn ActivitySource>>,
    config: WarmingConfig,
    observers: Observers,
}

impl CacheWarmer {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] when `config` is invalid.
    pub fn new(
        backend: Arc<dyn AuthorizationBackend>,
        cache: Arc<ReadThroughCache>,
        config: WarmingConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            cache,
            activity: None,
            config,
            observers: Observers::new(),
        })
    }

    #[must_use]
    pub fn with_activity_source(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = Some(activity);
        self
    }

    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    #[must_use]
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    fn is_active(&self) -> bool {
        self.config.enabled && self.cache.is_enabled()
    }

    /// Check `users × relations × objects` and cache every result
    ///
    /// Returns the number of results received; equal to the product of the
    /// three lengths when every backend call succeeds.
    pub async fn warm_batch(&self, users: &[String], relations: &[String], objects: &[String]) -> usize {
        if !self.is_active() {
            return 0;
        }

        let checks: Vec<PermissionTuple> = users
            .iter()
            .flat_map(|user| {
                relations.iter().flat_map(move |relation| {
                    objects
                        .iter()
                        .map(move |object| PermissionTuple::new(user, relation, object))
                })
            })
            .collect();

        let mut warmed = 0;
        for chunk in checks.chunks(self.config.chunk_size) {
            let results = match self.backend.batch_check(chunk).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(checks = chunk.len(), error = %e, "[Warmer] Batch check failed");
                    continue;
                }
            };
            if results.len() != chunk.len() {
                warn!(
                    checks = chunk.len(),
                    results = results.len(),
                    "[Warmer] Batch check returned a mismatched result count"
                );
            }
            for (tuple, allowed) in chunk.iter().zip(results) {
                if self.prime(tuple, allowed).await {
                    warmed += 1;
                }
            }
        }

        debug!(requested = checks.len(), warmed, "[Warmer] Warmed batch");
        warmed
    }

    /// [`warm_batch`](Self::warm_batch) for one user; emits `CacheWarmed`
    pub async fn warm_for_user(&self, user: &str, relations: &[String], objects: &[String]) -> usize {
        let warmed = self
            .warm_batch(&[user.to_string()], relations, objects)
            .await;
        self.observers.emit(&CacheEvent::CacheWarmed {
            identifier: user.to_string(),
            entries_warmed: warmed,
        });
        warmed
    }

    /// Warm a privilege hierarchy for one `(user, object)` pair
    ///
    /// `relations` goes from lowest to highest privilege and is checked from
    /// the top. With `infer_hierarchy` set, the first granted relation ends
    /// the walk and the relations below it are cached as granted without
    /// asking the backend; otherwise every relation is checked. Returns the
    /// number of relations whose answer is now known, which is all of them
    /// unless a check fails.
    pub async fn warm_hierarchy(&self, user: &str, object: &str, relations: &[String]) -> usize {
        if !self.is_active() {
            return 0;
        }

        let descending: Vec<&String> = relations.iter().rev().collect();
        let mut warmed = 0;

        for (position, relation) in descending.iter().enumerate() {
            let tuple = PermissionTuple::new(user, relation.as_str(), object);
            let allowed = match self.backend.check(&tuple, &[], None).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!(tuple = %tuple, error = %e, "[Warmer] Hierarchy check failed");
                    return warmed;
                }
            };
            self.prime(&tuple, allowed).await;
            warmed += 1;

            if allowed && self.config.infer_hierarchy {
                let lower = descending.get(position + 1..).unwrap_or_default();
                for inferred in lower {
                    self.prime(&PermissionTuple::new(user, inferred.as_str(), object), true)
                        .await;
                }
                debug!(
                    user = %user,
                    object = %object,
                    granted = %relation,
                    inferred = lower.len(),
                    "[Warmer] Hierarchy resolved early"
                );
                return warmed + lower.len();
            }
        }

        warmed
    }

    /// Warm the objects of the same type that `user` can reach by `relations`
    ///
    /// Each relation's `list_objects` call runs concurrently; the found
    /// objects are then checked against every relation.
    pub async fn warm_related(&self, user: &str, object: &str, relations: &[String]) -> usize {
        if !self.is_active() {
            return 0;
        }

        let object_type = type_of(object);
        let listings = join_all(relations.iter().map(|relation| async move {
            let found = self
                .backend
                .list_objects(user, relation, object_type, &[], None)
                .await;
            (relation, found)
        }))
        .await;

        let mut warmed = 0;
        for (relation, found) in listings {
            match found {
                Ok(objects) if !objects.is_empty() => {
                    warmed += self.warm_batch(&[user.to_string()], relations, &objects).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(relation = %relation, object_type, error = %e, "[Warmer] Related lookup failed");
                }
            }
        }
        warmed
    }

    /// Warm the configured common relations for recently active pairs
    ///
    /// `0` when no activity source is configured or nothing happened within
    /// `window`.
    pub async fn warm_from_activity(&self, window: Duration) -> usize {
        if !self.is_active() {
            return 0;
        }
        let Some(activity) = &self.activity else {
            debug!("[Warmer] No activity source configured");
            return 0;
        };

        let records = match activity.recent_activity(window).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "[Warmer] Failed to read recent activity");
                return 0;
            }
        };

        let mut by_user: IndexMap<String, Vec<String>> = IndexMap::new();
        for record in records {
            let objects = by_user.entry(record.user).or_default();
            if !objects.contains(&record.object) {
                objects.push(record.object);
            }
        }

        let mut warmed = 0;
        for (user, objects) in &by_user {
            warmed += self
                .warm_for_user(user, &self.config.common_relations, objects)
                .await;
        }

        info!(
            users = by_user.len(),
            warmed,
            window_secs = window.as_secs(),
            "[Warmer] Warmed from recent activity"
        );
        warmed
    }

    /// Drop cached checks of `user` for `relation` whose object matches `pattern`
    ///
    /// `pattern` is a glob over object identifiers and defaults to `*`.
    /// Returns `0` when the store cannot match patterns.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] when the store fails.
    pub async fn invalidate(&self, user: &str, relation: &str, pattern: Option<&str>) -> Result<usize> {
        let store = self.cache.store();
        if !self.cache.is_enabled() || !store.supports_patterns() {
            return Ok(0);
        }
        // Identifiers match literally; only the object pattern keeps its wildcards
        let template = escape_glob(&self.cache.check_key(user, relation, OBJECT_MARKER));
        let glob = template.replacen(OBJECT_MARKER, &escape_key_part(pattern.unwrap_or("*")), 1);
        let removed = store
            .forget_matching(&glob)
            .await
            .map_err(|e| CacheError::store("forget_matching", e))?;
        debug!(user = %user, relation = %relation, removed, "[Warmer] Invalidated warmed checks");
        Ok(removed)
    }

    async fn prime(&self, tuple: &PermissionTuple, allowed: bool) -> bool {
        match self
            .cache
            .prime(&tuple.user, &tuple.relation, &tuple.object, allowed)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(tuple = %tuple, error = %e, "[Warmer] Failed to cache warmed result");
                false
            }
        }
    }
}

/// Stands in for the object while the rest of a key is escaped; the object
/// sorts first among the key's parameters, so it is the first occurrence
const OBJECT_MARKER: &str = "\u{1}";

/// Wrap glob metacharacters in single-character classes, a form both
/// `globset` and Redis `SCAN MATCH` read literally
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | '{' | '}') {
            escaped.push('[');
            escaped.push(c);
            escaped.push(']');
        } else {
            escaped.push(c);
        }
    }
    escaped
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("activity", &self.activity.is_some())
            .finish_non_exhaustive()
    }
}
