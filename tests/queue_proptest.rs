use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use tally::storage::{MutationId, MutationKind, NewMutation, QueueStore, SledQueueStore};

#[derive(Debug, Clone)]
enum QueueOp {
    Append { qty: u32 },
    /// Removes the n-th live entry (modulo the queue length).
    Remove { nth: usize },
    Reopen,
}

fn queue_op_strategy() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        4 => (0u32..1_000).prop_map(|qty| QueueOp::Append { qty }),
        2 => (0usize..64).prop_map(|nth| QueueOp::Remove { nth }),
        1 => Just(QueueOp::Reopen),
    ]
}

/// Replays `ops` against a sled store and returns the listed ids, the
/// shadow model's ids and every id ever handed out.
fn replay(ops: Vec<QueueOp>) -> (Vec<MutationId>, Vec<MutationId>, Vec<MutationId>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let tmp = TempDir::new().expect("tempdir");

    runtime.block_on(async {
        let mut db = sled::open(tmp.path()).expect("open db");
        let mut store = SledQueueStore::new(&db, 3).expect("open store");
        let mut shadow: Vec<MutationId> = Vec::new();
        let mut issued: Vec<MutationId> = Vec::new();

        for op in ops {
            match op {
                QueueOp::Append { qty } => {
                    let id = store
                        .append(NewMutation::new(
                            MutationKind::CreateCountLine,
                            json!({"item_code": "ITEM001", "counted_qty": qty}),
                            0,
                        ))
                        .await
                        .expect("append");
                    shadow.push(id);
                    issued.push(id);
                }
                QueueOp::Remove { nth } => {
                    if shadow.is_empty() {
                        continue;
                    }
                    let id = shadow.remove(nth % shadow.len());
                    assert!(store.remove(id).await.expect("remove"));
                }
                QueueOp::Reopen => {
                    drop(store);
                    drop(db);
                    db = sled::open(tmp.path()).expect("reopen db");
                    store = SledQueueStore::new(&db, 3).expect("reopen store");
                }
            }
        }

        let listed = store
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.id)
            .collect();
        (listed, shadow, issued)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn queue_keeps_fifo_order_and_unique_ids(ops in proptest::collection::vec(queue_op_strategy(), 1..40)) {
        let (listed, shadow, issued) = replay(ops);

        prop_assert_eq!(&listed, &shadow);

        let unique: BTreeSet<MutationId> = issued.iter().copied().collect();
        prop_assert_eq!(unique.len(), issued.len(), "an id was handed out twice");

        // Ids are issued in increasing order, even across reopen and removal.
        prop_assert!(issued.windows(2).all(|w| w[0] < w[1]));
    }
}
