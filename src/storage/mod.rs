pub mod error;
pub mod memory_queue;
pub mod mutation;
pub mod offline_queue;
pub mod queue;
pub mod read_cache;

pub use self::error::StorageError;
pub use self::memory_queue::{MemoryQueueStore, OverflowStrategy};
pub use self::mutation::{
    MutationId, MutationKind, MutationState, NewMutation, PendingMutation, QueueStats,
    DEFAULT_MAX_RETRIES,
};
pub use self::offline_queue::SledQueueStore;
pub use self::queue::{QueueStore, SharedQueueStore};
pub use self::read_cache::{CachedRead, ReadCache};
