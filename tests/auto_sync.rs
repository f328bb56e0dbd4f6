use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tally::network::{RemoteError, RemoteMutationClient, SwitchSignal};
use tally::storage::{MemoryQueueStore, MutationKind, NewMutation, QueueStore};
use tally::sync::{SyncOrchestrator, SyncWorker};

#[derive(Default)]
struct AcceptAll {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteMutationClient for AcceptAll {
    async fn submit(&self, _kind: &MutationKind, _payload: &Value) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Rig {
    store: Arc<MemoryQueueStore>,
    client: Arc<AcceptAll>,
    signal: Arc<SwitchSignal>,
    orchestrator: Arc<SyncOrchestrator>,
}

fn rig(online: bool) -> Rig {
    let store = Arc::new(MemoryQueueStore::new(3));
    let client = Arc::new(AcceptAll::default());
    let signal = Arc::new(SwitchSignal::new(online));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        client.clone(),
        signal.clone(),
    ));
    Rig {
        store,
        client,
        signal,
        orchestrator,
    }
}

async fn enqueue(store: &MemoryQueueStore) {
    store
        .append(NewMutation::new(
            MutationKind::CreateSession,
            json!({"warehouse": "WH1"}),
            0,
        ))
        .await
        .unwrap();
}

async fn wait_until_drained(store: &MemoryQueueStore) {
    for _ in 0..200 {
        if store.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue was not drained in time");
}

#[tokio::test]
async fn worker_syncs_once_on_start() {
    let rig = rig(true);
    enqueue(&rig.store).await;

    let handle = SyncWorker::new(Arc::clone(&rig.orchestrator)).spawn();
    wait_until_drained(&rig.store).await;
    assert_eq!(rig.client.calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_triggers_sync_after_debounce() {
    let rig = rig(false);
    let handle = SyncWorker::new(Arc::clone(&rig.orchestrator))
        .with_debounce(Duration::from_millis(200))
        .spawn();
    // Let the startup attempt run (and skip) while offline.
    tokio::time::sleep(Duration::from_millis(20)).await;

    enqueue(&rig.store).await;
    rig.signal.set(true);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.store.len().await, 1, "sync must wait for the debounce");

    wait_until_drained(&rig.store).await;
    assert_eq!(rig.client.calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn flapping_connection_cancels_pending_sync() {
    let rig = rig(false);
    let handle = SyncWorker::new(Arc::clone(&rig.orchestrator))
        .with_debounce(Duration::from_millis(100))
        .spawn();
    // Let the startup attempt run (and skip) while offline.
    tokio::time::sleep(Duration::from_millis(20)).await;

    enqueue(&rig.store).await;
    rig.signal.set(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    rig.signal.set(false);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(rig.client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.store.len().await, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn interval_keeps_syncing_new_work() {
    let rig = rig(true);
    let handle = SyncWorker::new(Arc::clone(&rig.orchestrator))
        .with_sync_on_start(false)
        .with_interval(Some(Duration::from_millis(50)))
        .spawn();

    enqueue(&rig.store).await;
    wait_until_drained(&rig.store).await;

    enqueue(&rig.store).await;
    wait_until_drained(&rig.store).await;
    assert_eq!(rig.client.calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await;
}
