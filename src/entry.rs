//! Stored cache entries and their TTL classification

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::CacheConfig;

/// Value held by a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue {
    Allowed(bool),
    Objects(Vec<String>),
}

/// How an entry was classified when it was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Positive,
    Negative,
    Error,
}

impl Classification {
    /// TTL for this classification under `config`
    #[must_use]
    pub fn ttl(self, config: &CacheConfig) -> Duration {
        match self {
            Self::Positive => config.positive_ttl,
            Self::Negative => config.negative_ttl,
            Self::Error => config.error_ttl,
        }
    }
}

/// A cached check or list-objects result
///
/// The TTL is picked from the classification once, at write time; the
/// entry itself carries no expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedValue,
    /// Unix seconds at write time
    pub cached_at: u64,
    #[serde(rename = "error")]
    pub is_error: bool,
    /// Backend failure message for error entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CacheEntry {
    /// Successful result
    #[must_use]
    pub fn of(value: CachedValue) -> Self {
        Self::new(value, false, None)
    }

    #[must_use]
    pub fn allowed(allowed: bool) -> Self {
        Self::new(CachedValue::Allowed(allowed), false, None)
    }

    #[must_use]
    pub fn objects(objects: Vec<String>) -> Self {
        Self::new(CachedValue::Objects(objects), false, None)
    }

    /// Sentinel for a failed backend call; `placeholder` keeps the value shape
    #[must_use]
    pub fn error(placeholder: CachedValue, message: impl Into<String>) -> Self {
        Self::new(placeholder, true, Some(message.into()))
    }

    fn new(value: CachedValue, is_error: bool, message: Option<String>) -> Self {
        Self {
            value,
            cached_at: unix_now(),
            is_error,
            message,
        }
    }

    #[must_use]
    pub fn classification(&self) -> Classification {
        if self.is_error {
            return Classification::Error;
        }
        match &self.value {
            CachedValue::Allowed(true) => Classification::Positive,
            CachedValue::Allowed(false) => Classification::Negative,
            CachedValue::Objects(objects) if objects.is_empty() => Classification::Negative,
            CachedValue::Objects(_) => Classification::Positive,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
