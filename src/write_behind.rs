//! Write-Behind Tuple Buffer
//!
//! Tuple writes and deletes are buffered in memory and persisted in batches.
//! Every mutation also primes the read-through cache right away, so a grant
//! followed by a check is answered from the cache before the flush happens.
//!
//! # Buffer rules
//!
//! - At most one pending operation per tuple. A delete arriving after a
//!   pending write (or the reverse) replaces it: last intent wins.
//! - Mutations of one tuple take its in-flight lock around the buffer insert
//!   and the read-cache prime, so the cached answer always matches the
//!   buffered operation.
//! - A flush is triggered when the buffer holds `batch_size` operations, when
//!   `flush_interval` has elapsed since the last flush (checked on each
//!   mutation and by the optional ticker), or explicitly.
//!
//! # Flush modes
//!
//! | Mode | Backend interaction | Buffer cleared |
//! |------|---------------------|----------------|
//! | sync | one `write(writes, deletes)` call | after the call succeeds |
//! | queue | one [`WriteTask`] per operation | right after dispatch |

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WriteBehindConfig;
use crate::dedup::RequestCoalescer;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, Observers};
use crate::queue::{WriteOperation, WriteTask};
use crate::read_through::ReadThroughCache;
use crate::traits::{AuthorizationBackend, TaskDispatcher};
use crate::tuple::{PermissionTuple, TupleKey};

/// Kind of a buffered operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Delete,
}

impl From<OperationKind> for WriteOperation {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Write => Self::Write,
            OperationKind::Delete => Self::Delete,
        }
    }
}

/// A buffered tuple mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub user: String,
    pub relation: String,
    pub object: String,
    /// Unix milliseconds when the operation was buffered
    pub timestamp: u64,
    pub kind: OperationKind,
}

impl PendingOperation {
    fn new(tuple: PermissionTuple, kind: OperationKind) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self {
            user: tuple.user,
            relation: tuple.relation,
            object: tuple.object,
            timestamp,
            kind,
        }
    }

    #[must_use]
    pub fn tuple(&self) -> PermissionTuple {
        PermissionTuple::new(&self.user, &self.relation, &self.object)
    }
}

/// Operations handled by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub writes: usize,
    pub deletes: usize,
}

/// Buffered operations by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub writes: usize,
    pub deletes: usize,
    pub total: usize,
}

struct Buffer {
    pending: IndexMap<TupleKey, PendingOperation>,
    last_flush: Instant,
}

/// Buffers tuple mutations and flushes them in batches
pub struct WriteBehindCache {
    backend: Arc<dyn AuthorizationBackend>,
    read_cache: Arc<ReadThroughCache>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    config: WriteBehindConfig,
    buffer: Mutex<Buffer>,
    /// Per-tuple ordering of buffer insert and prime
    in_flight: RequestCoalescer,
    observers: Observers,
    shutdown_tx: broadcast::Sender<()>,
}

impl WriteBehindCache {
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`] when `config` is invalid
    /// or queue mode is requested without a dispatcher.
    pub fn new(
        backend: Arc<dyn AuthorizationBackend>,
        read_cache: Arc<ReadThroughCache>,
        dispatcher: Option<Arc<dyn TaskDispatcher>>,
        config: WriteBehindConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.enabled && config.use_queue && dispatcher.is_none() {
            return Err(CacheError::InvalidConfiguration(
                "write_behind.use_queue requires a task dispatcher".to_string(),
            ));
        }

        info!(
            enabled = config.enabled,
            batch_size = config.batch_size,
            flush_interval_ms = u64::try_from(config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            use_queue = config.use_queue,
            "Initializing write-behind buffer"
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            backend,
            read_cache,
            dispatcher,
            config,
            buffer: Mutex::new(Buffer {
                pending: IndexMap::new(),
                last_flush: Instant::now(),
            }),
            in_flight: RequestCoalescer::new(),
            observers: Observers::new(),
            shutdown_tx,
        })
    }

    /// Share an observer list (e.g. the one of a [`PermissionCache`](crate::PermissionCache))
    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    #[must_use]
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    #[must_use]
    pub fn config(&self) -> &WriteBehindConfig {
        &self.config
    }

    /// Grant `relation` on `object` to `user`
    ///
    /// # Errors
    ///
    /// Errors of a flush triggered by this call, or of the direct backend
    /// write when buffering is disabled.
    pub async fn write(&self, user: &str, relation: &str, object: &str) -> Result<()> {
        self.enqueue(PermissionTuple::new(user, relation, object), OperationKind::Write)
            .await
    }

    /// Revoke `relation` on `object` from `user`
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn delete(&self, user: &str, relation: &str, object: &str) -> Result<()> {
        self.enqueue(PermissionTuple::new(user, relation, object), OperationKind::Delete)
            .await
    }

    /// Persist everything buffered
    ///
    /// # Errors
    ///
    /// [`CacheError::FlushFailure`] when the synchronous backend write fails
    /// (the operations stay buffered), [`CacheError::Dispatch`] when a task
    /// cannot be enqueued.
    pub async fn flush(&self) -> Result<FlushResult> {
        let drained: Vec<PendingOperation> = {
            let mut buffer = self.buffer.lock();
            buffer.last_flush = Instant::now();
            buffer.pending.drain(..).map(|(_, operation)| operation).collect()
        };

        if drained.is_empty() {
            return Ok(FlushResult::default());
        }

        let result = match &self.dispatcher {
            Some(dispatcher) if self.config.use_queue => {
                self.flush_to_queue(dispatcher.as_ref(), drained).await?
            }
            _ => self.flush_to_backend(drained).await?,
        };

        info!(
            writes = result.writes,
            deletes = result.deletes,
            queued = self.config.use_queue,
            "Write-behind flush completed"
        );
        self.observers.emit(&CacheEvent::FlushCompleted {
            writes: result.writes,
            deletes: result.deletes,
        });
        Ok(result)
    }

    #[must_use]
    pub fn pending_count(&self) -> PendingCount {
        let buffer = self.buffer.lock();
        let writes = buffer
            .pending
            .values()
            .filter(|operation| operation.kind == OperationKind::Write)
            .count();
        let total = buffer.pending.len();
        PendingCount {
            writes,
            deletes: total - writes,
            total,
        }
    }

    /// Snapshot of the buffer, in arrival order
    #[must_use]
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.buffer.lock().pending.values().cloned().collect()
    }

    /// Flush on `flush_interval` even when no mutation arrives
    ///
    /// The task holds only a weak reference and ends when the cache is
    /// dropped or [`shutdown`](Self::shutdown) is called.
    pub fn spawn_flush_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.flush_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => {
                        debug!("Write-behind flush task stopping");
                        break;
                    }
                }

                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if cache.is_due() {
                    if let Err(e) = cache.flush().await {
                        warn!(error = %e, "Scheduled write-behind flush failed");
                    }
                }
            }
        })
    }

    /// Stop the ticker and, if `flush_on_shutdown` is set, flush
    ///
    /// # Errors
    ///
    /// Errors of the final flush.
    pub async fn shutdown(&self) -> Result<FlushResult> {
        let _ = self.shutdown_tx.send(());
        if self.config.flush_on_shutdown {
            return self.flush().await;
        }
        let pending = self.pending_count();
        if pending.total > 0 {
            warn!(
                pending_writes = pending.writes,
                pending_deletes = pending.deletes,
                "Discarding buffered tuple operations on shutdown"
            );
        }
        Ok(FlushResult::default())
    }

    async fn enqueue(&self, tuple: PermissionTuple, kind: OperationKind) -> Result<()> {
        if !self.config.enabled {
            return self.write_through(tuple, kind).await;
        }

        let guard = self
            .in_flight
            .acquire(&self.read_cache.check_key(&tuple.user, &tuple.relation, &tuple.object))
            .await;
        let should_flush = {
            let mut buffer = self.buffer.lock();
            let key = tuple.key();
            if let Some(previous) = buffer.pending.shift_remove(&key) {
                if previous.kind != kind {
                    debug!(tuple = %tuple, cancelled = ?previous.kind, "Cancelled opposing pending operation");
                }
            }
            buffer
                .pending
                .insert(key, PendingOperation::new(tuple.clone(), kind));
            buffer.pending.len() >= self.config.batch_size
                || buffer.last_flush.elapsed() >= self.config.flush_interval
        };

        self.prime(&tuple, kind).await;
        drop(guard);

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Buffering disabled: apply immediately, then prime
    async fn write_through(&self, tuple: PermissionTuple, kind: OperationKind) -> Result<()> {
        let single = std::slice::from_ref(&tuple);
        let written = match kind {
            OperationKind::Write => self.backend.write(single, &[]).await,
            OperationKind::Delete => self.backend.write(&[], single).await,
        };
        written.map_err(|e| CacheError::backend("write", e))?;
        self.prime(&tuple, kind).await;
        Ok(())
    }

    /// Optimistic read-cache update; a failure only costs a later miss
    async fn prime(&self, tuple: &PermissionTuple, kind: OperationKind) {
        let allowed = kind == OperationKind::Write;
        if let Err(e) = self
            .read_cache
            .prime(&tuple.user, &tuple.relation, &tuple.object, allowed)
            .await
        {
            warn!(tuple = %tuple, error = %e, "Failed to prime read cache");
        }
    }

    fn is_due(&self) -> bool {
        let buffer = self.buffer.lock();
        !buffer.pending.is_empty() && buffer.last_flush.elapsed() >= self.config.flush_interval
    }

    async fn flush_to_backend(&self, drained: Vec<PendingOperation>) -> Result<FlushResult> {
        let (writes, deletes): (Vec<PermissionTuple>, Vec<PermissionTuple>) = {
            let mut writes = Vec::new();
            let mut deletes = Vec::new();
            for operation in &drained {
                match operation.kind {
                    OperationKind::Write => writes.push(operation.tuple()),
                    OperationKind::Delete => deletes.push(operation.tuple()),
                }
            }
            (writes, deletes)
        };

        match self.backend.write(&writes, &deletes).await {
            Ok(()) => Ok(FlushResult {
                writes: writes.len(),
                deletes: deletes.len(),
            }),
            Err(e) => {
                error!(
                    error = %e,
                    pending_writes = writes.len(),
                    pending_deletes = deletes.len(),
                    "Write-behind flush failed"
                );
                let restored = self.restore(drained);
                // The optimistic answers are no longer backed by the backend
                for tuple in &restored {
                    if let Err(forget_error) = self
                        .read_cache
                        .forget(&tuple.user, &tuple.relation, &tuple.object)
                        .await
                    {
                        warn!(tuple = %tuple, error = %forget_error, "Failed to forget optimistic entry");
                    }
                }
                Err(CacheError::FlushFailure {
                    writes: writes.len(),
                    deletes: deletes.len(),
                    source: e,
                })
            }
        }
    }

    async fn flush_to_queue(
        &self,
        dispatcher: &dyn TaskDispatcher,
        drained: Vec<PendingOperation>,
    ) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        let mut remaining = drained.into_iter();

        while let Some(operation) = remaining.next() {
            let kind = operation.kind;
            let task = WriteTask::new(operation.tuple(), kind.into(), &self.config.connection);
            if let Err(e) = dispatcher.dispatch(task, &self.config.queue_name).await {
                let mut undispatched = vec![operation];
                undispatched.extend(remaining);
                error!(
                    error = %e,
                    queue = %self.config.queue_name,
                    undispatched = undispatched.len(),
                    "Failed to dispatch write-behind task"
                );
                self.restore(undispatched);
                return Err(CacheError::Dispatch(e));
            }
            match kind {
                OperationKind::Write => result.writes += 1,
                OperationKind::Delete => result.deletes += 1,
            }
        }

        debug!(
            queue = %self.config.queue_name,
            connection = %self.config.connection,
            tasks = result.writes + result.deletes,
            "Dispatched write-behind tasks"
        );
        Ok(result)
    }

    /// Put drained operations back unless a newer one for the tuple arrived
    fn restore(&self, operations: Vec<PendingOperation>) -> Vec<PermissionTuple> {
        let mut buffer = self.buffer.lock();
        let mut restored = Vec::with_capacity(operations.len());
        for operation in operations {
            let tuple = operation.tuple();
            let key = tuple.key();
            if !buffer.pending.contains_key(&key) {
                buffer.pending.insert(key, operation);
                restored.push(tuple);
            }
        }
        restored
    }
}

impl std::fmt::Debug for WriteBehindCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindCache")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
