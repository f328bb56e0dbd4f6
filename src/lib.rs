pub mod common;
pub mod config;
pub mod network;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use storage::{
    MutationId, MutationKind, MutationState, NewMutation, PendingMutation, QueueStore,
    SledQueueStore,
};
pub use sync::{CycleOutcome, SyncOrchestrator, SyncReport, SyncSnapshot};
