use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::error::StorageError;
use crate::storage::mutation::{
    MutationId, MutationState, NewMutation, PendingMutation, QueueStats,
};

/// Durable, ordered store of mutations waiting for delivery.
///
/// `list` returns entries oldest first. A successful delivery is signalled
/// only by `remove`; the store never holds an accepted mutation.
///
/// Lookups by id that miss (for example because an operator discarded the
/// entry mid-cycle) are reported as values, not errors. Errors from a store
/// mean the underlying storage is unusable and are fatal to a sync cycle.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn append(&self, mutation: NewMutation) -> Result<MutationId, StorageError>;

    async fn list(&self) -> Result<Vec<PendingMutation>, StorageError>;

    async fn get(&self, id: MutationId) -> Result<Option<PendingMutation>, StorageError>;

    /// Sets the state and, when given, `last_error`. Returns false if the id
    /// is unknown.
    async fn update_state(
        &self,
        id: MutationId,
        state: MutationState,
        error: Option<String>,
    ) -> Result<bool, StorageError>;

    /// Records one transient failure. Moves the entry to `Failed` once its
    /// retry count reaches `max_retries()`. Returns the updated entry, or
    /// `None` if the id is unknown.
    async fn update_retry(
        &self,
        id: MutationId,
        error: Option<String>,
    ) -> Result<Option<PendingMutation>, StorageError>;

    async fn remove(&self, id: MutationId) -> Result<bool, StorageError>;

    /// Removes every listed id that exists. Returns how many were removed.
    async fn remove_many(&self, ids: &[MutationId]) -> Result<usize, StorageError>;

    async fn stats(&self) -> Result<QueueStats, StorageError>;

    fn max_retries(&self) -> u32;

    /// Entries still eligible for automatic delivery, oldest first.
    async fn pending(&self) -> Result<Vec<PendingMutation>, StorageError> {
        let mut entries = self.list().await?;
        entries.retain(|m| m.state == MutationState::Pending);
        Ok(entries)
    }
}

pub type SharedQueueStore = Arc<dyn QueueStore>;
