use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::network::metrics::{self, Outcome};
use crate::network::{FailureClass, RemoteError};
use crate::storage::{MutationState, PendingMutation, QueueStats};

use super::{Engine, SyncError, SyncReport};

const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

/// What happened to one mutation of a batch.
enum Dispatch {
    /// Retry budget already spent before this cycle; never sent.
    Exhausted,
    /// Kind this build cannot route; never sent.
    Unrecognized,
    Settled(Result<(), RemoteError>),
}

impl Engine {
    /// Delivers every pending mutation, oldest first, in sequential batches.
    ///
    /// Mutations of a batch are dispatched concurrently and the next batch
    /// starts only after all of them settled. Outcomes are written to the
    /// store one at a time after the batch settled. Progress snapshots carry
    /// counts adjusted in memory; the store is read once up front.
    pub(super) async fn upload(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let pending = self.store.pending().await?;
        report.total = pending.len();
        if pending.is_empty() {
            log::debug!("No pending mutations to upload");
            return Ok(());
        }

        log::info!(
            "Uploading {} pending mutations in batches of {}",
            pending.len(),
            self.batch_size
        );

        let total = pending.len();
        let mut counts = self.current_stats().await;
        let mut processed = 0;
        for batch in pending.chunks(self.batch_size) {
            report.batches += 1;
            let settled = self.dispatch_batch(batch).await;

            for (mutation, dispatch) in settled {
                self.apply(mutation, dispatch, report, &mut counts).await?;
                processed += 1;
                self.set_progress(processed, total);
                self.publish_counts(counts, true);
            }
        }
        Ok(())
    }

    async fn dispatch_batch(&self, batch: &[PendingMutation]) -> Vec<(PendingMutation, Dispatch)> {
        let max_retries = self.store.max_retries();

        let mut inflight: Vec<(PendingMutation, Option<JoinHandle<Result<(), RemoteError>>>)> =
            Vec::with_capacity(batch.len());
        let mut settled = Vec::with_capacity(batch.len());

        for mutation in batch {
            if mutation.retry_count >= max_retries || !mutation.kind.is_recognized() {
                inflight.push((mutation.clone(), None));
                continue;
            }
            let client = Arc::clone(&self.client);
            let kind = mutation.kind.clone();
            let payload = mutation.payload.clone();
            let handle = tokio::spawn(async move { client.submit(&kind, &payload).await });
            inflight.push((mutation.clone(), Some(handle)));
        }

        for (mutation, handle) in inflight {
            let dispatch = match handle {
                Some(handle) => match handle.await {
                    Ok(result) => Dispatch::Settled(result),
                    Err(e) => {
                        log::error!("Dispatch task for mutation {} failed: {e}", mutation.id);
                        Dispatch::Settled(Err(RemoteError::transient(e.to_string())))
                    }
                },
                None if !mutation.kind.is_recognized() => Dispatch::Unrecognized,
                None => Dispatch::Exhausted,
            };
            settled.push((mutation, dispatch));
        }
        settled
    }

    async fn apply(
        &self,
        mutation: PendingMutation,
        dispatch: Dispatch,
        report: &mut SyncReport,
        counts: &mut QueueStats,
    ) -> Result<(), SyncError> {
        let id = mutation.id;
        let kind = &mutation.kind;

        match dispatch {
            Dispatch::Unrecognized => {
                log::warn!("Discarding mutation {id} of unrecognized kind '{kind}'");
                self.store.remove(id).await?;
                counts.leave_pending(None);
                metrics::record_outcome(Outcome::Discarded);
                report.discarded += 1;
            }
            Dispatch::Exhausted => {
                let parked = self
                    .store
                    .update_state(id, MutationState::Failed, Some(MAX_RETRIES_EXCEEDED.into()))
                    .await?;
                if !parked {
                    self.left_queue(&mutation, counts);
                    return Ok(());
                }
                log::warn!("Mutation {id} ({kind}) exhausted its retries, marking failed");
                counts.leave_pending(Some(MutationState::Failed));
                metrics::record_outcome(Outcome::Exhausted);
                report.failed += 1;
                self.note_failure(report, &mutation, MAX_RETRIES_EXCEEDED);
            }
            Dispatch::Settled(Ok(())) => {
                self.store.remove(id).await?;
                counts.leave_pending(None);
                metrics::record_outcome(Outcome::Accepted);
                report.succeeded += 1;
                log::debug!("Mutation {id} ({kind}) accepted");
            }
            Dispatch::Settled(Err(e)) => match e.classification() {
                FailureClass::Conflict => {
                    let message = e.to_string();
                    let parked = self
                        .store
                        .update_state(id, MutationState::Conflict, Some(message.clone()))
                        .await?;
                    if !parked {
                        self.left_queue(&mutation, counts);
                        return Ok(());
                    }
                    log::warn!("Mutation {id} ({kind}) rejected as conflict: {message}");
                    counts.leave_pending(Some(MutationState::Conflict));
                    metrics::record_outcome(Outcome::Conflict);
                    report.conflicts += 1;
                    self.note_failure(report, &mutation, &message);
                }
                FailureClass::Transient => {
                    let message = e.to_string();
                    metrics::record_outcome(Outcome::Transient);
                    match self.store.update_retry(id, Some(message.clone())).await? {
                        Some(updated) if updated.state == MutationState::Failed => {
                            log::warn!(
                                "Mutation {id} ({kind}) failed after {} attempts: {message}",
                                updated.retry_count
                            );
                            counts.leave_pending(Some(MutationState::Failed));
                            metrics::record_outcome(Outcome::Exhausted);
                            report.failed += 1;
                        }
                        Some(updated) => {
                            log::info!(
                                "Mutation {id} ({kind}) will be retried ({}/{}): {message}",
                                updated.retry_count,
                                self.store.max_retries()
                            );
                            report.retried += 1;
                        }
                        None => {
                            self.left_queue(&mutation, counts);
                            return Ok(());
                        }
                    }
                    self.note_failure(report, &mutation, &message);
                }
            },
        }
        Ok(())
    }

    /// The entry was discarded while its dispatch was in flight; its outcome
    /// is dropped.
    fn left_queue(&self, mutation: &PendingMutation, counts: &mut QueueStats) {
        log::debug!("Mutation {} left the queue during the cycle", mutation.id);
        counts.leave_pending(None);
    }

    fn note_failure(&self, report: &mut SyncReport, mutation: &PendingMutation, message: &str) {
        report.errors.push((mutation.id, message.to_string()));
        self.record_error(format!("{} {}: {message}", mutation.kind, mutation.id));
    }
}
