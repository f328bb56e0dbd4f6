use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::watch;

/// Upload progress of the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub processed: usize,
    pub total: usize,
}

/// Point-in-time view of the sync engine. Recomputed on every change, never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub is_syncing: bool,
    /// Milliseconds since UNIX_EPOCH of the last cycle that finished without
    /// a fatal error.
    pub last_sync_at_ms: Option<u64>,
    pub pending_count: usize,
    pub conflict_count: usize,
    pub failed_count: usize,
    /// Messages observed during the current (or last) cycle.
    pub errors: Vec<String>,
    pub progress: Option<SyncProgress>,
}

type Listener = Arc<dyn Fn(&SyncSnapshot) + Send + Sync>;
type Registry = Mutex<Vec<(u64, Listener)>>;

/// Fans snapshots out to subscribers.
///
/// Listeners run synchronously on the publishing task, in subscription
/// order. A panicking listener is logged and skipped; the others still
/// receive the snapshot. Async consumers can use [`StatusPublisher::watch`]
/// instead, which only ever holds the latest snapshot.
pub struct StatusPublisher {
    listeners: Arc<Registry>,
    next_id: AtomicU64,
    latest: watch::Sender<SyncSnapshot>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(SyncSnapshot::default());
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
            latest,
        }
    }

    /// Registers a listener. It stays registered until the returned handle
    /// is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> SyncSnapshot {
        self.latest.borrow().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, snapshot: SyncSnapshot) {
        // Listeners are called outside the lock so they may (un)subscribe.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener(&snapshot)));
            if delivered.is_err() {
                log::error!("Sync status listener panicked; continuing with remaining listeners");
            }
        }

        self.latest.send_replace(snapshot);
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`StatusPublisher::subscribe`].
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keeps the listener registered for the publisher's lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
