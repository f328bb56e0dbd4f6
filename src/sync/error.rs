use thiserror::Error;

use crate::storage::StorageError;

/// Failure that stops a sync cycle. Remote failures never do; they are
/// classified per mutation instead.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue store error: {0}")]
    StoreError(#[from] StorageError),

    /// The cycle task panicked or was torn down with the runtime.
    #[error("Sync cycle aborted: {0}")]
    Aborted(String),
}
