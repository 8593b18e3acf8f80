//! Cache notifications
//!
//! Components report warming and flush completion to a list of observers.
//! Observers are called synchronously on the emitting task, so they should
//! hand work off rather than block. [`BroadcastObserver`] does exactly that
//! for callers that prefer subscribing to a channel.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Something worth telling the application about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// The warmer populated entries for `identifier` (usually a user)
    CacheWarmed {
        identifier: String,
        entries_warmed: usize,
    },
    /// A write-behind flush wrote or dispatched the pending operations
    FlushCompleted { writes: usize, deletes: usize },
}

/// Receives [`CacheEvent`]s
pub trait CacheObserver: Send + Sync {
    fn notify(&self, event: &CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn notify(&self, event: &CacheEvent) {
        self(event);
    }
}

/// Registered observers, shared by the components of one cache
#[derive(Default, Clone)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Arc<dyn CacheObserver>>>>,
}

impl Observers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn CacheObserver>) {
        self.inner.write().push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub(crate) fn emit(&self, event: &CacheEvent) {
        debug!(event = ?event, "Emitting cache event");
        let observers = self.inner.read().clone();
        for observer in observers {
            observer.notify(event);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.len())
            .finish()
    }
}

/// Forwards events into a `tokio::sync::broadcast` channel
pub struct BroadcastObserver {
    sender: broadcast::Sender<CacheEvent>,
}

impl BroadcastObserver {
    /// Observer plus a first receiver
    #[must_use]
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<CacheEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

impl CacheObserver for BroadcastObserver {
    fn notify(&self, event: &CacheEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event.clone());
    }
}
