use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::{CycleOutcome, SyncOrchestrator};

/// Quiet period after the network comes back before a cycle starts.
pub const DEFAULT_RECONNECT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Background driver that starts full sync cycles on its own.
///
/// Triggers: once at startup, when the network signal turns usable again
/// (after `debounce`, restarted by every flap), and on an optional fixed
/// interval. Cycles that overlap a manual one are skipped by the
/// orchestrator's lock.
pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    debounce: Duration,
    interval: Option<Duration>,
    sync_on_start: bool,
}

impl SyncWorker {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            debounce: DEFAULT_RECONNECT_DEBOUNCE,
            interval: None,
            sync_on_start: true,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn with_sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }

    pub fn spawn(self) -> SyncWorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        SyncWorkerHandle { shutdown, join }
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.orchestrator.signal().subscribe();
        let mut was_usable = *online.borrow_and_update();
        let mut signal_open = true;

        if self.sync_on_start {
            self.sync_once("startup").await;
        }

        let mut ticker = self.interval.map(|period| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut reconnect_at: Option<Instant> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = online.changed(), if signal_open => {
                    if changed.is_err() {
                        log::warn!("Network signal closed; reconnect sync disabled");
                        signal_open = false;
                        reconnect_at = None;
                        continue;
                    }
                    let usable = *online.borrow_and_update();
                    if usable && !was_usable {
                        log::debug!("Network usable again, syncing in {:?}", self.debounce);
                        reconnect_at = Some(Instant::now() + self.debounce);
                    } else if !usable {
                        reconnect_at = None;
                    }
                    was_usable = usable;
                }
                _ = wait_until(reconnect_at) => {
                    reconnect_at = None;
                    self.sync_once("reconnect").await;
                }
                _ = next_tick(&mut ticker) => {
                    self.sync_once("interval").await;
                }
            }
        }

        log::info!("SyncWorker stopped");
    }

    async fn sync_once(&self, trigger: &str) {
        match self.orchestrator.sync_all().await {
            Ok(CycleOutcome::Completed(report)) => {
                log::debug!(
                    "Auto-sync ({trigger}) done: {} accepted of {}",
                    report.succeeded,
                    report.total
                );
            }
            Ok(CycleOutcome::Skipped { reason }) => {
                log::debug!("Auto-sync ({trigger}) skipped: {reason:?}");
            }
            Err(e) => log::error!("SyncWorker error: {e}"),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

/// Stops the worker when shut down or dropped.
pub struct SyncWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Signals the worker and waits for it. A cycle in flight finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            log::error!("SyncWorker task failed: {e}");
        }
    }
}
