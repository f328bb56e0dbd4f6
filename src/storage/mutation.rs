use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::clock;

/// Number of transient failures after which a mutation is parked as `Failed`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Identifier assigned by the queue store on append. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a queued mutation does on the remote side. Selects the payload shape
/// and the request the remote client issues.
///
/// Persisted as a snake_case tag so that entries written by a newer build
/// still decode; tags this build does not know become `Unrecognized`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MutationKind {
    CreateSession,
    CreateCountLine,
    CreateUnknownItem,
    /// Bulk count-record shape uploaded through the batch endpoint.
    SyncRecord,
    Unrecognized(String),
}

impl MutationKind {
    pub fn as_str(&self) -> &str {
        match self {
            MutationKind::CreateSession => "create_session",
            MutationKind::CreateCountLine => "create_count_line",
            MutationKind::CreateUnknownItem => "create_unknown_item",
            MutationKind::SyncRecord => "sync_record",
            MutationKind::Unrecognized(tag) => tag,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, MutationKind::Unrecognized(_))
    }

    /// Every kind this build knows how to dispatch.
    pub fn recognized() -> [MutationKind; 4] {
        [
            MutationKind::CreateSession,
            MutationKind::CreateCountLine,
            MutationKind::CreateUnknownItem,
            MutationKind::SyncRecord,
        ]
    }
}

impl From<&str> for MutationKind {
    fn from(tag: &str) -> Self {
        match tag {
            "create_session" => MutationKind::CreateSession,
            "create_count_line" => MutationKind::CreateCountLine,
            "create_unknown_item" => MutationKind::CreateUnknownItem,
            "sync_record" => MutationKind::SyncRecord,
            other => MutationKind::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for MutationKind {
    fn from(tag: String) -> Self {
        MutationKind::from(tag.as_str())
    }
}

impl From<MutationKind> for String {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Unrecognized(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored lifecycle state. Success is not a state: accepted mutations are
/// removed from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    /// Rejected by the server as invalid against its current state. Needs
    /// external resolution; never retried automatically.
    Conflict,
    /// Retry budget exhausted by transient failures.
    Failed,
}

impl MutationState {
    /// Terminal states are excluded from automatic batches.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MutationState::Pending)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationState::Pending => "pending",
            MutationState::Conflict => "conflict",
            MutationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A local write waiting to be delivered to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub kind: MutationKind,
    pub payload: Value,
    pub created_at_ms: u64,
    pub retry_count: u32,
    pub state: MutationState,
    pub last_error: Option<String>,
}

impl PendingMutation {
    /// Records one transient failure. Increments `retry_count` and parks the
    /// mutation as `Failed` once the count reaches `max_retries`.
    ///
    /// Returns true when this call performed the Pending -> Failed transition.
    /// Non-pending mutations are left untouched.
    pub(crate) fn record_transient_failure(
        &mut self,
        error: Option<String>,
        max_retries: u32,
    ) -> bool {
        if self.state != MutationState::Pending {
            return false;
        }

        self.retry_count = self.retry_count.saturating_add(1);
        if error.is_some() {
            self.last_error = error;
        }

        if self.retry_count >= max_retries {
            self.state = MutationState::Failed;
            return true;
        }
        false
    }
}

/// A mutation as handed over by a producer, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub kind: MutationKind,
    pub payload: Value,
    pub created_at_ms: u64,
}

impl NewMutation {
    pub fn new(kind: MutationKind, payload: Value, created_at_ms: u64) -> Self {
        Self {
            kind,
            payload,
            created_at_ms,
        }
    }

    /// Stamps the mutation with the current system time.
    pub fn now(kind: MutationKind, payload: Value) -> Self {
        Self::new(kind, payload, clock::now_ms())
    }

    pub(crate) fn into_pending(self, id: MutationId) -> PendingMutation {
        PendingMutation {
            id,
            kind: self.kind,
            payload: self.payload,
            created_at_ms: self.created_at_ms,
            retry_count: 0,
            state: MutationState::Pending,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub conflict_count: usize,
    pub failed_count: usize,
}

impl QueueStats {
    pub fn from_mutations<'a>(mutations: impl IntoIterator<Item = &'a PendingMutation>) -> Self {
        let mut stats = QueueStats::default();
        for mutation in mutations {
            stats.count(mutation.state);
        }
        stats
    }

    pub(crate) fn count(&mut self, state: MutationState) {
        match state {
            MutationState::Pending => self.pending_count += 1,
            MutationState::Conflict => self.conflict_count += 1,
            MutationState::Failed => self.failed_count += 1,
        }
    }

    /// Accounts for one pending entry that was removed (`None`) or moved to
    /// a terminal state.
    pub(crate) fn leave_pending(&mut self, to: Option<MutationState>) {
        self.pending_count = self.pending_count.saturating_sub(1);
        if let Some(state) = to {
            self.count(state);
        }
    }

    pub fn total(&self) -> usize {
        self.pending_count + self.conflict_count + self.failed_count
    }
}
