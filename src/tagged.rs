//! Tag-Based Cache
//!
//! Arbitrary JSON values stored under a key and a set of tags. The stored key
//! is namespaced by the sorted tag set, the way tagged caches usually work,
//! so a value put with tags `[a, b]` is read back with `[a, b]` (or `[b, a]`).
//!
//! The permission helpers derive tags from a tuple, which lets one call evict
//! everything cached about a user, an object, a relation or a type.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::traits::{CacheCodec, CacheStore};
use crate::tuple::{PermissionTuple, object_type_tag, relation_tag, user_type_tag};

/// Tagged key-value cache over a [`CacheStore`]
pub struct TaggedCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    codec: JsonCodec,
}

impl TaggedCache {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] when `config` is invalid.
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            codec: JsonCodec,
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Store `value` for `positive_ttl`
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] or [`CacheError::Codec`].
    pub async fn put(&self, key: &str, value: &Value, tags: &[String]) -> Result<bool> {
        self.put_with_ttl(key, value, tags, self.config.positive_ttl)
            .await
    }

    /// # Errors
    ///
    /// [`CacheError::Store`] or [`CacheError::Codec`].
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: &Value,
        tags: &[String],
        ttl: Duration,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let bytes = self.codec.serialize(value).map_err(CacheError::Codec)?;
        self.store
            .put_tagged(&self.tagged_key(key, tags), &bytes, ttl, tags)
            .await
            .map_err(|e| CacheError::store("put_tagged", e))
    }

    /// # Errors
    ///
    /// [`CacheError::Store`] or [`CacheError::Codec`].
    pub async fn get(&self, key: &str, tags: &[String]) -> Result<Option<Value>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let Some(bytes) = self
            .store
            .get(&self.tagged_key(key, tags))
            .await
            .map_err(|e| CacheError::store("get", e))?
        else {
            return Ok(None);
        };
        self.codec
            .deserialize(&bytes)
            .map(Some)
            .map_err(CacheError::Codec)
    }

    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn forget(&self, key: &str, tags: &[String]) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        self.store
            .forget(&self.tagged_key(key, tags))
            .await
            .map_err(|e| CacheError::store("forget", e))
    }

    /// Evict every entry carrying any of `tags`
    ///
    /// `false` when disabled or when the store has no tag support.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn flush(&self, tags: &[String]) -> Result<bool> {
        if !self.config.enabled || !self.store.supports_tags() {
            return Ok(false);
        }
        self.evict(tags).await?;
        Ok(true)
    }

    /// Cache a check result under the tuple's tags
    ///
    /// # Errors
    ///
    /// See [`put`](Self::put).
    pub async fn put_permission(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        allowed: bool,
    ) -> Result<bool> {
        let tuple = PermissionTuple::new(user, relation, object);
        self.put(&permission_key(&tuple), &Value::Bool(allowed), &tuple.tags())
            .await
    }

    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn get_permission(
        &self,
        user: &str,
        relation: &str,
        object: &str,
    ) -> Result<Option<bool>> {
        let tuple = PermissionTuple::new(user, relation, object);
        let value = self.get(&permission_key(&tuple), &tuple.tags()).await?;
        Ok(value.and_then(|value| value.as_bool()))
    }

    /// # Errors
    ///
    /// See [`forget`](Self::forget).
    pub async fn forget_permission(&self, user: &str, relation: &str, object: &str) -> Result<bool> {
        let tuple = PermissionTuple::new(user, relation, object);
        self.forget(&permission_key(&tuple), &tuple.tags()).await
    }

    /// Evict everything cached about `user` (e.g. `user:123`)
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn invalidate_user(&self, user: &str) -> Result<usize> {
        self.invalidate(user.to_string()).await
    }

    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn invalidate_object(&self, object: &str) -> Result<usize> {
        self.invalidate(object.to_string()).await
    }

    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn invalidate_relation(&self, relation: &str) -> Result<usize> {
        self.invalidate(relation_tag(relation)).await
    }

    /// Evict entries for every user of a type (`user`, `group`, ...)
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn invalidate_user_type(&self, user_type: &str) -> Result<usize> {
        self.invalidate(user_type_tag(user_type)).await
    }

    /// # Errors
    ///
    /// [`CacheError::Store`].
    pub async fn invalidate_object_type(&self, object_type: &str) -> Result<usize> {
        self.invalidate(object_type_tag(object_type)).await
    }

    async fn invalidate(&self, tag: String) -> Result<usize> {
        if !self.config.enabled || !self.store.supports_tags() {
            return Ok(0);
        }
        self.evict(&[tag]).await
    }

    async fn evict(&self, tags: &[String]) -> Result<usize> {
        let removed = self
            .store
            .flush_tags(tags)
            .await
            .map_err(|e| CacheError::store("flush_tags", e))?;
        debug!(tags = ?tags, removed, "[Tagged] Flushed tags");
        Ok(removed)
    }

    fn tagged_key(&self, key: &str, tags: &[String]) -> String {
        let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        format!("{}:tagged:{}:{key}", self.config.prefix, sorted.join(","))
    }
}

fn permission_key(tuple: &PermissionTuple) -> String {
    format!("permission:{}:{}:{}", tuple.user, tuple.relation, tuple.object)
}

impl std::fmt::Debug for TaggedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedCache")
            .field("store", &self.store.name())
            .field("enabled", &self.config.enabled)
            .finish_non_exhaustive()
    }
}
