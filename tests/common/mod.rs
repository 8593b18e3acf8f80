//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scripted authorization backend with call counters
//! - A store wrapper that records every interaction
//! - A dispatcher and activity source that record what they are given
//! - Tracing setup

#![allow(dead_code)]

use anyhow::{Result, bail};
use parking_lot::Mutex;
use rebac_cache::backends::DashMapStore;
use rebac_cache::{
    ActivityRecord, ActivitySource, AuthorizationBackend, CacheConfig, CacheStore, PermissionTuple,
    ReadThroughCache, TaskDispatcher, WriteTask, async_trait,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Route `tracing` output to the test harness (`RUST_LOG=debug cargo test`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

/// Authorization backend driven by test data
///
/// Answers, in order: failure switches, explicit grants, per-relation
/// answers, then `false`. Writes are applied to the grant set.
#[derive(Default)]
pub struct MockBackend {
    grants: Mutex<HashSet<PermissionTuple>>,
    relation_answers: Mutex<HashMap<String, bool>>,
    objects: Mutex<HashMap<(String, String), Vec<String>>>,
    failing: AtomicBool,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    check_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    list_calls: AtomicUsize,
    write_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    contextual_seen: Mutex<Vec<usize>>,
    writes: Mutex<Vec<(Vec<PermissionTuple>, Vec<PermissionTuple>)>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant(&self, user: &str, relation: &str, object: &str) {
        self.grants
            .lock()
            .insert(PermissionTuple::new(user, relation, object));
    }

    /// Answer every check of `relation` with `allowed` unless explicitly granted
    pub fn answer_relation(&self, relation: &str, allowed: bool) {
        self.relation_answers
            .lock()
            .insert(relation.to_string(), allowed);
    }

    pub fn set_objects(&self, relation: &str, object_type: &str, objects: &[&str]) {
        self.objects.lock().insert(
            (relation.to_string(), object_type.to_string()),
            strings(objects),
        );
    }

    /// Fail every call until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` calls
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Simulated network latency for every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Size of every `batch_check` request, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Contextual tuple counts seen by `check`, in call order
    pub fn contextual_seen(&self) -> Vec<usize> {
        self.contextual_seen.lock().clone()
    }

    /// Every `write` request, in call order
    pub fn writes(&self) -> Vec<(Vec<PermissionTuple>, Vec<PermissionTuple>)> {
        self.writes.lock().clone()
    }

    pub fn is_granted(&self, user: &str, relation: &str, object: &str) -> bool {
        self.grants
            .lock()
            .contains(&PermissionTuple::new(user, relation, object))
    }

    fn answer(&self, tuple: &PermissionTuple) -> bool {
        if self.grants.lock().contains(tuple) {
            return true;
        }
        self.relation_answers
            .lock()
            .get(&tuple.relation)
            .copied()
            .unwrap_or(false)
    }

    async fn simulate_call(&self) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("authorization service unreachable");
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            bail!("authorization service timed out");
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationBackend for MockBackend {
    async fn check(
        &self,
        tuple: &PermissionTuple,
        contextual_tuples: &[PermissionTuple],
        _context: Option<&serde_json::Value>,
    ) -> Result<bool> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.contextual_seen.lock().push(contextual_tuples.len());
        self.simulate_call().await?;
        Ok(self.answer(tuple) || contextual_tuples.contains(tuple))
    }

    async fn batch_check(&self, checks: &[PermissionTuple]) -> Result<Vec<bool>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().push(checks.len());
        self.simulate_call().await?;
        Ok(checks.iter().map(|tuple| self.answer(tuple)).collect())
    }

    async fn list_objects(
        &self,
        _user: &str,
        relation: &str,
        object_type: &str,
        _contextual_tuples: &[PermissionTuple],
        _context: Option<&serde_json::Value>,
    ) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        Ok(self
            .objects
            .lock()
            .get(&(relation.to_string(), object_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, writes: &[PermissionTuple], deletes: &[PermissionTuple]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        self.writes.lock().push((writes.to_vec(), deletes.to_vec()));
        let mut grants = self.grants.lock();
        for tuple in writes {
            grants.insert(tuple.clone());
        }
        for tuple in deletes {
            grants.remove(tuple);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// `DashMapStore` wrapper that counts every interaction
pub struct RecordingStore {
    inner: DashMapStore,
    tags: bool,
    patterns: bool,
    failing: AtomicBool,
    interactions: AtomicUsize,
    puts: Mutex<Vec<(String, Duration)>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_capabilities(true, true))
    }

    /// A store without tag and pattern support
    pub fn plain() -> Arc<Self> {
        Arc::new(Self::with_capabilities(false, false))
    }

    fn with_capabilities(tags: bool, patterns: bool) -> Self {
        Self {
            inner: DashMapStore::new(),
            tags,
            patterns,
            failing: AtomicBool::new(false),
            interactions: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls of any kind, capability queries excluded
    pub fn interactions(&self) -> usize {
        self.interactions.load(Ordering::SeqCst)
    }

    /// `(key, ttl)` of every put, tagged or not
    pub fn puts(&self) -> Vec<(String, Duration)> {
        self.puts.lock().clone()
    }

    /// TTL of the last put of `key`
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.puts
            .lock()
            .iter()
            .rev()
            .find(|(put_key, _)| put_key == key)
            .map(|(_, ttl)| *ttl)
    }

    fn touch(&self) -> Result<()> {
        self.interactions.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("store connection lost");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.touch()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.touch()?;
        self.puts.lock().push((key.to_string(), ttl));
        self.inner.put(key, value, ttl).await
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        self.touch()?;
        self.inner.forget(key).await
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.touch()?;
        self.inner.increment(key, delta).await
    }

    fn supports_tags(&self) -> bool {
        self.tags
    }

    async fn put_tagged(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<bool> {
        self.touch()?;
        self.puts.lock().push((key.to_string(), ttl));
        if self.tags {
            self.inner.put_tagged(key, value, ttl, tags).await
        } else {
            self.inner.put(key, value, ttl).await
        }
    }

    async fn flush_tags(&self, tags: &[String]) -> Result<usize> {
        self.touch()?;
        if !self.tags {
            return Ok(0);
        }
        self.inner.flush_tags(tags).await
    }

    fn supports_patterns(&self) -> bool {
        self.patterns
    }

    async fn forget_matching(&self, pattern: &str) -> Result<usize> {
        self.touch()?;
        if !self.patterns {
            return Ok(0);
        }
        self.inner.forget_matching(pattern).await
    }

    async fn health_check(&self) -> bool {
        if self.touch().is_err() {
            return false;
        }
        self.inner.health_check().await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Dispatcher that keeps every task it is handed
#[derive(Default)]
pub struct RecordingDispatcher {
    tasks: Mutex<Vec<(WriteTask, String)>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(task, queue)` pairs in dispatch order
    pub fn tasks(&self) -> Vec<(WriteTask, String)> {
        self.tasks.lock().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: WriteTask, queue: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("job queue rejected the task");
        }
        self.tasks.lock().push((task, queue.to_string()));
        Ok(())
    }
}

/// Activity source returning a fixed list
pub struct StaticActivity {
    records: Vec<ActivityRecord>,
}

impl StaticActivity {
    pub fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            records: pairs
                .iter()
                .map(|(user, object)| ActivityRecord::new(*user, *object))
                .collect(),
        })
    }
}

#[async_trait]
impl ActivitySource for StaticActivity {
    async fn recent_activity(&self, _window: Duration) -> Result<Vec<ActivityRecord>> {
        Ok(self.records.clone())
    }
}

/// Read-through cache over a mock backend and a recording store
pub fn read_cache(
    config: CacheConfig,
) -> (Arc<ReadThroughCache>, Arc<MockBackend>, Arc<RecordingStore>) {
    let backend = MockBackend::new();
    let store = RecordingStore::new();
    let cache = ReadThroughCache::new(backend.clone(), store.clone(), config)
        .expect("valid cache config");
    (Arc::new(cache), backend, store)
}
