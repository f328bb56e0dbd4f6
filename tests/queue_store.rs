use serde_json::json;
use tempfile::TempDir;

use tally::storage::{
    MemoryQueueStore, MutationId, MutationKind, MutationState, NewMutation, OverflowStrategy,
    QueueStore, SledQueueStore, StorageError,
};

fn unknown_item(barcode: &str) -> NewMutation {
    NewMutation::new(
        MutationKind::CreateUnknownItem,
        json!({
            "session_id": "sess_1",
            "barcode": barcode,
            "description": "Blue widget, 500ml",
            "counted_qty": 2,
            "photos": [{"name": "front.jpg", "size": 1024}],
        }),
        1_700_000_123_456,
    )
}

#[tokio::test]
async fn appended_mutation_lists_back_field_for_field() {
    let temp_dir = TempDir::new().unwrap();
    let db = sled::open(temp_dir.path()).unwrap();
    let store = SledQueueStore::new(&db, 3).unwrap();

    let input = unknown_item("8901234567890");
    let id = store.append(input.clone()).await.unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    let entry = &listed[0];
    assert_eq!(entry.id, id);
    assert_eq!(entry.kind, input.kind);
    assert_eq!(entry.payload, input.payload);
    assert_eq!(entry.created_at_ms, input.created_at_ms);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.state, MutationState::Pending);
    assert_eq!(entry.last_error, None);
}

#[tokio::test]
async fn states_and_retries_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();

    let (conflict, retried, kept) = {
        let db = sled::open(temp_dir.path()).unwrap();
        let store = SledQueueStore::new(&db, 3).unwrap();
        let conflict = store.append(unknown_item("A")).await.unwrap();
        let retried = store.append(unknown_item("B")).await.unwrap();
        let kept = store.append(unknown_item("C")).await.unwrap();

        store
            .update_state(conflict, MutationState::Conflict, Some("barcode exists".into()))
            .await
            .unwrap();
        store.update_retry(retried, Some("timed out".into())).await.unwrap();
        (conflict, retried, kept)
    };

    let db = sled::open(temp_dir.path()).unwrap();
    let store = SledQueueStore::new(&db, 3).unwrap();

    let ids: Vec<MutationId> = store.list().await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![conflict, retried, kept]);

    let entry = store.get(conflict).await.unwrap().unwrap();
    assert_eq!(entry.state, MutationState::Conflict);
    assert_eq!(entry.last_error.as_deref(), Some("barcode exists"));

    let entry = store.get(retried).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.state, MutationState::Pending);

    let pending: Vec<MutationId> = store.pending().await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(pending, vec![retried, kept]);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending_count, 2);
    assert_eq!(stats.conflict_count, 1);
    assert_eq!(stats.failed_count, 0);
}

#[tokio::test]
async fn missing_ids_are_reported_as_values() {
    let temp_dir = TempDir::new().unwrap();
    let db = sled::open(temp_dir.path()).unwrap();
    let store = SledQueueStore::new(&db, 3).unwrap();

    let ghost = MutationId(77);
    assert!(store.get(ghost).await.unwrap().is_none());
    assert!(!store
        .update_state(ghost, MutationState::Failed, None)
        .await
        .unwrap());
    assert!(store.update_retry(ghost, None).await.unwrap().is_none());
    assert!(!store.remove(ghost).await.unwrap());
    assert_eq!(store.remove_many(&[ghost]).await.unwrap(), 0);
}

#[tokio::test]
async fn memory_store_bounds_capacity() {
    let store = MemoryQueueStore::new(3).with_capacity(2, OverflowStrategy::RejectNew);
    store.append(unknown_item("A")).await.unwrap();
    store.append(unknown_item("B")).await.unwrap();

    let err = store.append(unknown_item("C")).await.unwrap_err();
    assert!(matches!(err, StorageError::QueueFull { capacity: 2 }));

    let store = MemoryQueueStore::new(3).with_capacity(2, OverflowStrategy::DropOldest);
    let first = store.append(unknown_item("A")).await.unwrap();
    store.append(unknown_item("B")).await.unwrap();
    let third = store.append(unknown_item("C")).await.unwrap();

    let ids: Vec<MutationId> = store.list().await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&first));
    assert_eq!(ids.last(), Some(&third));
}
