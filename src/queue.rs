//! In-process write queue
//!
//! [`WriteTask`] is the unit of work a queued write-behind flush hands to a
//! [`TaskDispatcher`]. [`ChannelTaskQueue`] is a dispatcher that needs no
//! external job system: an `mpsc` channel drained by a small worker pool,
//! each task applied to the backend with retries.
//!
//! ```text
//! flush → dispatch(task) → channel → worker N → backend.write (retry, backoff ×2)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::traits::{AuthorizationBackend, TaskDispatcher};
use crate::tuple::PermissionTuple;

/// Whether a task adds or removes its tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Write,
    Delete,
}

/// One tuple write or delete, applied asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTask {
    pub user: String,
    pub relation: String,
    pub object: String,
    pub operation: WriteOperation,
    /// Backend connection the task targets
    pub connection: String,
}

impl WriteTask {
    pub fn new(tuple: PermissionTuple, operation: WriteOperation, connection: impl Into<String>) -> Self {
        Self {
            user: tuple.user,
            relation: tuple.relation,
            object: tuple.object,
            operation,
            connection: connection.into(),
        }
    }

    #[must_use]
    pub fn tuple(&self) -> PermissionTuple {
        PermissionTuple::new(&self.user, &self.relation, &self.object)
    }
}

/// Counters of a [`ChannelTaskQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    /// Tasks dropped after exhausting their attempts
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct QueuedTask {
    task: WriteTask,
    queue: String,
}

/// Channel-backed [`TaskDispatcher`] with a worker pool
pub struct ChannelTaskQueue {
    sender: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ChannelTaskQueue {
    /// Start `config.workers` workers applying tasks to `backend`
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfiguration`](crate::CacheError::InvalidConfiguration)
    /// when `config` is invalid.
    pub fn spawn(backend: Arc<dyn AuthorizationBackend>, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel::<QueuedTask>(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let backend = Arc::clone(&backend);
                let counters = Arc::clone(&counters);
                let config = config.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only while waiting for the next task
                        let next = receiver.lock().await.recv().await;
                        let Some(queued) = next else {
                            break;
                        };
                        apply(backend.as_ref(), queued, &config, &counters, worker).await;
                    }
                    debug!(worker, "Write queue worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers,
            capacity = config.capacity,
            max_attempts = config.max_attempts,
            "Write queue started"
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting tasks and wait until the queued ones are applied
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Write queue worker panicked");
            }
        }
        let stats = self.stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            "Write queue shut down"
        );
    }
}

async fn apply(
    backend: &dyn AuthorizationBackend,
    queued: QueuedTask,
    config: &QueueConfig,
    counters: &Counters,
    worker: usize,
) {
    let QueuedTask { task, queue } = queued;
    let tuple = task.tuple();
    let mut delay = config.backoff;

    for attempt in 1..=config.max_attempts {
        let single = std::slice::from_ref(&tuple);
        let result = match task.operation {
            WriteOperation::Write => backend.write(single, &[]).await,
            WriteOperation::Delete => backend.write(&[], single).await,
        };

        match result {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(worker, queue = %queue, tuple = %tuple, operation = ?task.operation, "Applied queued write");
                return;
            }
            Err(e) if attempt < config.max_attempts => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker,
                    attempt,
                    tuple = %tuple,
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Queued write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker,
                    attempts = attempt,
                    queue = %queue,
                    connection = %task.connection,
                    tuple = %tuple,
                    operation = ?task.operation,
                    error = %e,
                    "Dropping queued write after final attempt"
                );
            }
        }
    }
}

#[async_trait]
impl TaskDispatcher for ChannelTaskQueue {
    async fn dispatch(&self, task: WriteTask, queue: &str) -> anyhow::Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("write queue is shut down"))?;
        sender
            .send(QueuedTask {
                task,
                queue: queue.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("write queue workers have stopped"))?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for ChannelTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTaskQueue")
            .field("open", &self.sender.lock().is_some())
            .field("workers", &self.workers.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}
