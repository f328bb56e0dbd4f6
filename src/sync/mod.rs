//! The sync engine: one orchestrator per application instance that moves
//! queued mutations to the remote service and refreshes read data.

mod batch;
pub mod error;
pub mod status;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::common::{Clock, SystemClock};
use crate::network::{NetworkSignal, Refresher, RemoteMutationClient};
use crate::storage::{MutationId, QueueStats, ReadCache, SharedQueueStore, StorageError};

pub use self::error::SyncError;
pub use self::status::{StatusPublisher, Subscription, SyncProgress, SyncSnapshot};
pub use self::worker::{SyncWorker, SyncWorkerHandle};

/// Mutations dispatched concurrently per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Pending mutations considered by the upload phase.
    pub total: usize,
    pub batches: usize,
    pub succeeded: usize,
    pub conflicts: usize,
    /// Transient failures that stay pending for a later cycle.
    pub retried: usize,
    /// Mutations parked as `Failed` during this cycle.
    pub failed: usize,
    /// Unrecognized kinds dropped from the queue.
    pub discarded: usize,
    pub errors: Vec<(MutationId, String)>,
    /// Refreshers that completed during the download phase.
    pub refreshed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(SyncReport),
    Skipped { reason: SkipReason },
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            CycleOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CycleOutcome::Skipped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    /// Upload, then refresh reads.
    Full,
    /// Upload only (manual flush).
    UploadOnly,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Full => f.write_str("full"),
            CycleMode::UploadOnly => f.write_str("upload-only"),
        }
    }
}

#[derive(Debug, Default)]
struct CycleState {
    errors: Vec<String>,
    last_sync_at_ms: Option<u64>,
    progress: Option<SyncProgress>,
}

/// Releases the sync lock when dropped, including on unwind.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the Idle/Syncing state machine.
///
/// At most one cycle runs at a time; a call made while a cycle is running,
/// or while the network signal says the remote is unreachable, returns
/// `CycleOutcome::Skipped` without side effects. A cycle uploads every
/// pending mutation in sequential batches, then runs the refreshers
/// concurrently, and always returns to Idle.
///
/// Each cycle runs on its own task. Dropping the future returned by
/// [`sync_all`](Self::sync_all) does not cancel it: the lock stays held
/// until every dispatch has settled and its outcome is stored.
pub struct SyncOrchestrator {
    engine: Arc<Engine>,
}

/// Everything a running cycle needs, shared with the cycle task.
struct Engine {
    store: SharedQueueStore,
    client: Arc<dyn RemoteMutationClient>,
    signal: Arc<dyn NetworkSignal>,
    refreshers: Vec<Arc<dyn Refresher>>,
    read_cache: Option<ReadCache>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    syncing: AtomicBool,
    cycle: Mutex<CycleState>,
    publisher: StatusPublisher,
}

impl SyncOrchestrator {
    pub fn new(
        store: SharedQueueStore,
        client: Arc<dyn RemoteMutationClient>,
        signal: Arc<dyn NetworkSignal>,
    ) -> Self {
        let engine = Engine {
            store,
            client,
            signal,
            refreshers: Vec::new(),
            read_cache: None,
            clock: Arc::new(SystemClock),
            batch_size: DEFAULT_BATCH_SIZE,
            syncing: AtomicBool::new(false),
            cycle: Mutex::new(CycleState::default()),
            publisher: StatusPublisher::new(),
        };
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn with_refreshers(self, refreshers: Vec<Arc<dyn Refresher>>) -> Self {
        self.configure(|engine| engine.refreshers = refreshers)
    }

    pub fn with_read_cache(self, cache: ReadCache) -> Self {
        self.configure(|engine| engine.read_cache = Some(cache))
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.configure(|engine| engine.clock = clock)
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        self.configure(|engine| engine.batch_size = batch_size.max(1))
    }

    fn configure(mut self, f: impl FnOnce(&mut Engine)) -> Self {
        match Arc::get_mut(&mut self.engine) {
            Some(engine) => f(engine),
            None => log::warn!("Sync cycle still running; orchestrator settings left unchanged"),
        }
        self
    }

    pub fn store(&self) -> &SharedQueueStore {
        &self.engine.store
    }

    pub fn signal(&self) -> &Arc<dyn NetworkSignal> {
        &self.engine.signal
    }

    pub fn batch_size(&self) -> usize {
        self.engine.batch_size
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing()
    }

    /// Registers a snapshot listener; see [`StatusPublisher::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        self.engine.publisher.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.engine.publisher.watch()
    }

    /// Current snapshot, with counts read from the queue store.
    pub async fn snapshot(&self) -> Result<SyncSnapshot, StorageError> {
        let stats = self.engine.store.stats().await?;
        Ok(self.engine.compose(stats, self.is_syncing()))
    }

    /// Full cycle: upload, refresh, stamp `last_sync_at`.
    pub async fn sync_all(&self) -> Result<CycleOutcome, SyncError> {
        self.run_cycle(CycleMode::Full).await
    }

    /// Upload phase only, under the same lock and connectivity guard.
    pub async fn process_queue(&self) -> Result<CycleOutcome, SyncError> {
        self.run_cycle(CycleMode::UploadOnly).await
    }

    async fn run_cycle(&self, mode: CycleMode) -> Result<CycleOutcome, SyncError> {
        let engine = Arc::clone(&self.engine);
        match tokio::spawn(async move { engine.run_cycle(mode).await }).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Sync cycle task failed: {e}");
                Err(SyncError::Aborted(e.to_string()))
            }
        }
    }
}

impl Engine {
    fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    fn begin(&self) -> Option<SyncGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                flag: &self.syncing,
            })
    }

    async fn run_cycle(&self, mode: CycleMode) -> Result<CycleOutcome, SyncError> {
        if !self.is_syncing() && !self.signal.usable() {
            log::debug!("Offline, skipping {mode} sync");
            crate::network::metrics::record_cycle(true);
            return Ok(CycleOutcome::Skipped {
                reason: SkipReason::Offline,
            });
        }

        let guard = match self.begin() {
            Some(guard) => guard,
            None => {
                log::debug!("Sync already in progress, skipping {mode} sync");
                crate::network::metrics::record_cycle(true);
                return Ok(CycleOutcome::Skipped {
                    reason: SkipReason::AlreadySyncing,
                });
            }
        };

        crate::network::metrics::record_cycle(false);
        self.with_cycle(|cycle| {
            cycle.errors.clear();
            cycle.progress = None;
        });
        self.publish(true).await;
        log::info!("Starting {mode} sync cycle");

        let result = self.execute(mode).await;

        match &result {
            Ok(report) => {
                if mode == CycleMode::Full {
                    let now = self.clock.now_ms();
                    self.with_cycle(|cycle| cycle.last_sync_at_ms = Some(now));
                }
                log::info!(
                    "Sync cycle finished: {} considered, {} accepted, {} conflicts, {} retried, {} failed, {} discarded",
                    report.total,
                    report.succeeded,
                    report.conflicts,
                    report.retried,
                    report.failed,
                    report.discarded
                );
            }
            Err(e) => {
                log::error!("Sync cycle aborted: {e}");
                self.record_error(e.to_string());
            }
        }

        // Closing snapshot goes out before the lock is released.
        self.with_cycle(|cycle| cycle.progress = None);
        self.publish(false).await;
        drop(guard);

        result.map(CycleOutcome::Completed)
    }

    async fn execute(&self, mode: CycleMode) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        // Local writes go first so downloaded data never masks them.
        self.upload(&mut report).await?;

        if mode == CycleMode::Full {
            self.refresh(&mut report).await;
        }
        Ok(report)
    }

    /// Runs every refresher concurrently. Failures are recorded and never
    /// fail the cycle.
    async fn refresh(&self, report: &mut SyncReport) {
        if self.refreshers.is_empty() {
            return;
        }

        let handles: Vec<_> = self
            .refreshers
            .iter()
            .map(|refresher| {
                let refresher = Arc::clone(refresher);
                let name = refresher.name().to_string();
                (name, tokio::spawn(async move { refresher.refresh().await }))
            })
            .collect();

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(body)) => {
                    if let Some(cache) = &self.read_cache {
                        if let Err(e) = cache.put(&name, &body, self.clock.now_ms()).await {
                            log::warn!("Could not cache refreshed '{name}': {e}");
                            self.record_error(format!("refresh {name}: {e}"));
                            continue;
                        }
                    }
                    log::debug!("Refreshed '{name}'");
                    report.refreshed.push(name);
                }
                Ok(Err(e)) => {
                    log::warn!("Failed to refresh '{name}': {e}");
                    self.record_error(format!("refresh {name}: {e}"));
                }
                Err(e) => {
                    log::error!("Refresh task '{name}' did not complete: {e}");
                    self.record_error(format!("refresh {name}: {e}"));
                }
            }
        }
    }

    fn with_cycle<R>(&self, f: impl FnOnce(&mut CycleState) -> R) -> R {
        let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut cycle)
    }

    fn record_error(&self, message: String) {
        self.with_cycle(|cycle| cycle.errors.push(message));
    }

    fn set_progress(&self, processed: usize, total: usize) {
        self.with_cycle(|cycle| cycle.progress = Some(SyncProgress { processed, total }));
    }

    fn compose(&self, stats: QueueStats, is_syncing: bool) -> SyncSnapshot {
        self.with_cycle(|cycle| SyncSnapshot {
            is_syncing,
            last_sync_at_ms: cycle.last_sync_at_ms,
            pending_count: stats.pending_count,
            conflict_count: stats.conflict_count,
            failed_count: stats.failed_count,
            errors: cycle.errors.clone(),
            progress: cycle.progress,
        })
    }

    /// Queue counts from the store, or the last published ones when the
    /// store cannot be read.
    async fn current_stats(&self) -> QueueStats {
        match self.store.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                log::warn!("Could not read queue stats for sync snapshot: {e}");
                let last = self.publisher.latest();
                QueueStats {
                    pending_count: last.pending_count,
                    conflict_count: last.conflict_count,
                    failed_count: last.failed_count,
                }
            }
        }
    }

    async fn publish(&self, is_syncing: bool) {
        let stats = self.current_stats().await;
        self.publish_counts(stats, is_syncing);
    }

    fn publish_counts(&self, stats: QueueStats, is_syncing: bool) {
        self.publisher.publish(self.compose(stats, is_syncing));
    }
}
