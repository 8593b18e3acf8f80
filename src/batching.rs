//! Batching and deduplication helpers
//!
//! Stateless functions shared by the cache components: cache key
//! construction, tuple normalization, batch deduplication, object id
//! extraction and the observability helpers used at logging boundaries.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::tuple::{PermissionTuple, TupleInput};

/// Longest string kept intact by [`sanitize_for_logging`]
pub const LOG_STRING_LIMIT: usize = 100;

/// Canonical tuples for a mix of raw and typed inputs, in input order
///
/// Missing fields become empty strings so one malformed entry does not sink
/// the rest of the batch.
#[must_use]
pub fn normalize_contextual_tuples(inputs: &[TupleInput]) -> Vec<PermissionTuple> {
    inputs.iter().map(TupleInput::normalize).collect()
}

/// Deterministic cache key for `operation` and `params`
///
/// Parameters are sorted by name, so two calls that differ only in
/// parameter order produce the same key:
///
/// ```rust
/// use rebac_cache::batching::build_cache_key;
///
/// let a = build_cache_key("rebac", "check", [("user", "user:1"), ("object", "doc:1")]);
/// let b = build_cache_key("rebac", "check", [("object", "doc:1"), ("user", "user:1")]);
/// assert_eq!(a, b);
/// assert_eq!(a, "rebac:check:object=doc:1|user=user:1");
/// ```
pub fn build_cache_key<I, K, V>(prefix: &str, operation: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", escape_key_part(k), escape_key_part(v)))
        .collect::<Vec<_>>()
        .join("|");
    format!("{prefix}:{operation}:{joined}")
}

/// Percent-escape the separators of [`build_cache_key`] so distinct
/// parameter sets never share a key
///
/// Only `%`, `|` and `=` change; identifiers without them are kept as is.
#[must_use]
pub fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '|' => escaped.push_str("%7C"),
            '=' => escaped.push_str("%3D"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Distinct checks of a batch keyed by `"{user}_{relation}_{object}"`
///
/// The first occurrence of a triple wins and first-seen order is kept.
#[must_use]
pub fn build_batch_check_keys(checks: &[PermissionTuple]) -> IndexMap<String, PermissionTuple> {
    let mut keyed = IndexMap::with_capacity(checks.len());
    for check in checks {
        keyed
            .entry(batch_check_key(check))
            .or_insert_with(|| check.clone());
    }
    keyed
}

/// Key of one check inside [`build_batch_check_keys`]
#[must_use]
pub fn batch_check_key(check: &PermissionTuple) -> String {
    format!("{}_{}_{}", check.user, check.relation, check.object)
}

/// Ids of `type:id` objects, split at the first colon
///
/// Everything after the first colon is the id (`"document:123:version:1"`
/// yields `"123:version:1"`). Entries without a colon are skipped.
#[must_use]
pub fn extract_object_ids<S: AsRef<str>>(objects: &[S]) -> Vec<String> {
    objects
        .iter()
        .filter_map(|object| object.as_ref().split_once(':'))
        .map(|(_, id)| id.to_string())
        .collect()
}

/// Starting point for [`calculate_metrics`]
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    started: Instant,
    memory: u64,
}

impl MetricsSnapshot {
    /// Capture the current time and resident memory
    #[must_use]
    pub fn now() -> Self {
        Self {
            started: Instant::now(),
            memory: resident_memory(),
        }
    }
}

/// Elapsed wall-clock time and resident memory delta since a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub duration: Duration,
    /// Bytes; negative when memory was released
    pub memory: i64,
}

/// Observability only; never feed the result into a cache decision
#[must_use]
pub fn calculate_metrics(start: &MetricsSnapshot) -> Metrics {
    let now = resident_memory();
    let memory = i64::try_from(now).unwrap_or(i64::MAX)
        - i64::try_from(start.memory).unwrap_or(i64::MAX);
    Metrics {
        duration: start.started.elapsed(),
        memory,
    }
}

/// Resident memory of this process in bytes, `0` when unavailable
fn resident_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

/// Copy of `value` safe to put in a log line
///
/// Strings over [`LOG_STRING_LIMIT`] characters are cut and suffixed with
/// `...`; arrays and objects are sanitized recursively; other scalars pass
/// through.
#[must_use]
pub fn sanitize_for_logging(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(truncate(text)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_for_logging).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_for_logging(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// [`sanitize_for_logging`] for a plain string
#[must_use]
pub fn sanitize_str(text: &str) -> String {
    truncate(text)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= LOG_STRING_LIMIT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(LOG_STRING_LIMIT).collect();
    cut.push_str("...");
    cut
}
