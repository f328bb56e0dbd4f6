use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::storage::error::StorageError;
use crate::storage::mutation::{
    MutationId, MutationState, NewMutation, PendingMutation, QueueStats,
};
use crate::storage::queue::QueueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    RejectNew,
    DropOldest,
}

struct Inner {
    entries: VecDeque<PendingMutation>,
    next_id: u64,
}

/// Non-durable queue store. Same semantics as the Sled store, minus
/// survival across restarts. Optionally bounded.
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
    capacity: Option<(usize, OverflowStrategy)>,
    max_retries: u32,
}

impl MemoryQueueStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 0,
            }),
            capacity: None,
            max_retries,
        }
    }

    pub fn with_capacity(mut self, max_size: usize, strategy: OverflowStrategy) -> Self {
        self.capacity = Some((max_size, strategy));
        self
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

impl Inner {
    fn find_mut(&mut self, id: MutationId) -> Option<&mut PendingMutation> {
        self.entries.iter_mut().find(|m| m.id == id)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn append(&self, mutation: NewMutation) -> Result<MutationId, StorageError> {
        let mut inner = self.inner.lock().await;

        if let Some((max_size, strategy)) = self.capacity {
            if inner.entries.len() >= max_size {
                match strategy {
                    OverflowStrategy::RejectNew => {
                        return Err(StorageError::QueueFull { capacity: max_size });
                    }
                    OverflowStrategy::DropOldest => {
                        if let Some(dropped) = inner.entries.pop_front() {
                            log::warn!(
                                "Mutation queue full, dropping oldest {} ({})",
                                dropped.id,
                                dropped.kind
                            );
                        }
                    }
                }
            }
        }

        inner.next_id += 1;
        let id = MutationId(inner.next_id);
        inner.entries.push_back(mutation.into_pending(id));
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<PendingMutation>, StorageError> {
        Ok(self.inner.lock().await.entries.iter().cloned().collect())
    }

    async fn get(&self, id: MutationId) -> Result<Option<PendingMutation>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.iter().find(|m| m.id == id).cloned())
    }

    async fn update_state(
        &self,
        id: MutationId,
        state: MutationState,
        error: Option<String>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.find_mut(id) {
            Some(m) => {
                m.state = state;
                if error.is_some() {
                    m.last_error = error;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_retry(
        &self,
        id: MutationId,
        error: Option<String>,
    ) -> Result<Option<PendingMutation>, StorageError> {
        let max_retries = self.max_retries;
        let mut inner = self.inner.lock().await;
        Ok(inner.find_mut(id).map(|m| {
            m.record_transient_failure(error, max_retries);
            m.clone()
        }))
    }

    async fn remove(&self, id: MutationId) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|m| m.id != id);
        Ok(inner.entries.len() < before)
    }

    async fn remove_many(&self, ids: &[MutationId]) -> Result<usize, StorageError> {
        let ids: HashSet<MutationId> = ids.iter().copied().collect();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|m| !ids.contains(&m.id));
        Ok(before - inner.entries.len())
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let inner = self.inner.lock().await;
        Ok(QueueStats::from_mutations(inner.entries.iter()))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mutation::MutationKind;
    use serde_json::json;

    fn session(warehouse: &str) -> NewMutation {
        NewMutation::new(
            MutationKind::CreateSession,
            json!({ "warehouse": warehouse }),
            1,
        )
    }

    #[tokio::test]
    async fn append_respects_max_size_drop_oldest() {
        let queue = MemoryQueueStore::new(3).with_capacity(2, OverflowStrategy::DropOldest);

        queue.append(session("w1")).await.unwrap();
        let second = queue.append(session("w2")).await.unwrap();
        let third = queue.append(session("w3")).await.unwrap();

        assert_eq!(queue.len().await, 2);
        let ids: Vec<MutationId> = queue.list().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![second, third]);
    }

    #[tokio::test]
    async fn append_rejects_when_full_and_strategy_reject_new() {
        let queue = MemoryQueueStore::new(3).with_capacity(1, OverflowStrategy::RejectNew);

        queue.append(session("w1")).await.unwrap();
        let res = queue.append(session("w2")).await;
        assert!(matches!(res, Err(StorageError::QueueFull { capacity: 1 })));
    }

    #[tokio::test]
    async fn ids_keep_increasing_after_removal() {
        let queue = MemoryQueueStore::new(3);
        let a = queue.append(session("w1")).await.unwrap();
        assert!(queue.remove(a).await.unwrap());
        assert!(queue.is_empty().await);

        let b = queue.append(session("w2")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn retry_and_state_updates_feed_stats() {
        let queue = MemoryQueueStore::new(2);
        let a = queue.append(session("w1")).await.unwrap();
        let b = queue.append(session("w2")).await.unwrap();
        queue.append(session("w3")).await.unwrap();

        queue.update_retry(a, Some("timeout".into())).await.unwrap();
        let failed = queue.update_retry(a, Some("timeout".into())).await.unwrap().unwrap();
        assert_eq!(failed.state, MutationState::Failed);

        queue
            .update_state(b, MutationState::Conflict, Some("session exists".into()))
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending_count: 1,
                conflict_count: 1,
                failed_count: 1,
            }
        );
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }
}
