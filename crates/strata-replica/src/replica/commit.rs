//! The commit pipeline: role-conditioned execution of committed decrees,
//! checkpoint interaction and private-log catch-up.

use bytes::Bytes;
use strata_types::{Decree, PartitionStatus};
use tracing::{debug, info};

use crate::metrics;
use crate::mutation::{Mutation, RequestRef};
use crate::request::ClientResponse;
use crate::role::RoleState;
use crate::ReplicaError;

use super::write::PrepareMsg;
use super::ReplicaCore;

// ============================================================================
// Commit Output
// ============================================================================

/// Reply owed to a client whose write just committed.
///
/// The request ref routes the response back to the requester; the
/// response carries the partition status at commit time.
#[derive(Debug)]
pub struct CommittedReply {
    pub request: RequestRef,
    pub response: ClientResponse,
}

/// Output of a commit step.
///
/// The caller (runtime) is responsible for:
/// 1. Sending the replies to their clients
/// 2. Transmitting the follow-on prepares to the secondaries
#[derive(Debug, Default)]
pub struct CommitOutput {
    /// Replies for writes whose decree committed in this step.
    pub responses: Vec<CommittedReply>,

    /// Prepares drained from the write queue as the window opened, plus
    /// any broadcast staged by the step itself.
    pub prepares: Vec<PrepareMsg>,
}

impl CommitOutput {
    /// Creates output carrying only prepares.
    pub fn with_prepares(prepares: Vec<PrepareMsg>) -> Self {
        Self {
            responses: Vec::new(),
            prepares,
        }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty() && self.prepares.is_empty()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: CommitOutput) {
        self.responses.extend(other.responses);
        self.prepares.extend(other.prepares);
    }
}

impl ReplicaCore {
    /// Advances the committed prefix to `target`, executing each newly
    /// committed mutation through the pipeline in decree order.
    pub fn advance_committed_to(&mut self, target: Decree, now_ms: u64) -> CommitOutput {
        let mut output = CommitOutput::default();
        let committed = self.prepare_list_mut().commit_to(target);
        for mutation in committed {
            output.merge(self.execute_mutation(&mutation, now_ms));
        }
        output
    }

    /// Executes one committed mutation against the engine.
    ///
    /// Invoked exactly once per `(pid, decree)` in strictly increasing
    /// decree order. Whether the engine actually applies depends on the
    /// role; skipped applies are recovered later from the private log.
    /// Re-execution below the engine's committed prefix is a no-op.
    ///
    /// On the primary, the committed write's pending client requests are
    /// answered through the returned output.
    pub fn execute_mutation(&mut self, mutation: &Mutation, now_ms: u64) -> CommitOutput {
        let mut output = CommitOutput::default();
        let d = mutation.decree;
        debug!(
            replica = %self.name(),
            mutation = %mutation.name(),
            request_count = mutation.updates.len(),
            "execute mutation"
        );

        // Idempotent re-entry from recovery.
        if self.engine().last_committed_decree() >= d {
            return output;
        }

        let app_committed = self.engine().last_committed_decree();
        let mut apply_result = Ok(());
        match self.role() {
            RoleState::Inactive { .. } => {
                if app_committed.next() == d {
                    apply_result = self.engine_mut().apply_mutation(mutation);
                } else {
                    debug!(
                        replica = %self.name(),
                        mutation = %mutation.name(),
                        app_committed = %app_committed,
                        "commit on inactive skipped; learner replays it later"
                    );
                }
            }
            RoleState::Primary(_) => {
                self.check_state_completeness();
                assert!(
                    app_committed.next() == d,
                    "{}: app commit {} vs mutation decree {}",
                    self.name(),
                    app_committed,
                    d
                );
                apply_result = self.engine_mut().apply_mutation(mutation);
            }
            RoleState::Secondary(ctx) => {
                if ctx.checkpoint_is_running {
                    // The private log keeps the record; catch-up runs
                    // after the checkpoint completes.
                    assert!(
                        self.has_private_log(),
                        "{}: checkpoint skip without private log",
                        self.name()
                    );
                    debug!(
                        replica = %self.name(),
                        mutation = %mutation.name(),
                        "commit skipped during checkpoint"
                    );
                } else {
                    self.check_state_completeness();
                    assert!(
                        app_committed.next() == d,
                        "{}: app commit {} vs mutation decree {}",
                        self.name(),
                        app_committed,
                        d
                    );
                    apply_result = self.engine_mut().apply_mutation(mutation);
                }
            }
            RoleState::PotentialSecondary(ctx) => {
                if ctx.can_apply() {
                    assert!(
                        app_committed.next() == d,
                        "{}: app commit {} vs mutation decree {}",
                        self.name(),
                        app_committed,
                        d
                    );
                    apply_result = self.engine_mut().apply_mutation(mutation);
                } else {
                    assert!(
                        self.has_private_log(),
                        "{}: learner skip without private log",
                        self.name()
                    );
                    debug!(
                        replica = %self.name(),
                        mutation = %mutation.name(),
                        "commit skipped while learning"
                    );
                }
            }
            RoleState::Split(ctx) => {
                if ctx.is_caught_up {
                    assert!(
                        app_committed.next() == d,
                        "{}: app commit {} vs mutation decree {}",
                        self.name(),
                        app_committed,
                        d
                    );
                    apply_result = self.engine_mut().apply_mutation(mutation);
                }
            }
            RoleState::Error => return output,
        }

        if let Err(err) = apply_result {
            self.handle_local_failure(&err);
            return output;
        }

        metrics::record_commit(self.pid());

        if self.status() != PartitionStatus::Primary {
            return output;
        }

        // Primary: answer the committed write's clients, record
        // per-update end-to-end latency, and feed the next queued write
        // if the window has room.
        let status = self.status();
        for request_ref in &mutation.client_requests {
            output.responses.push(CommittedReply {
                request: request_ref.clone(),
                response: ClientResponse::ok(status, Bytes::new()),
            });
        }

        let now_ns = now_ms.saturating_mul(1_000_000);
        for update in &mutation.updates {
            if let Some(histogram) = self.latency_histogram(update.code) {
                #[allow(clippy::cast_precision_loss)]
                histogram.observe(now_ns.saturating_sub(update.start_time_ns) as f64);
            }
        }

        output.merge(self.check_possible_work(now_ms));
        output
    }

    /// Drains one queued write into a prepare if the window allows.
    fn check_possible_work(&mut self, now_ms: u64) -> CommitOutput {
        if self.prepare_list().pending_count() >= self.prepare_list().capacity() {
            return CommitOutput::default();
        }
        let Some(ctx) = self.role_mut().as_primary_mut() else {
            return CommitOutput::default();
        };
        let Some(queued) = ctx.write_queue.pop_front() else {
            return CommitOutput::default();
        };
        match self.init_prepare(&queued.request, now_ms) {
            Ok((_, output)) => output,
            Err(err) => {
                self.handle_local_failure(&err);
                CommitOutput::default()
            }
        }
    }

    pub(crate) fn has_private_log(&self) -> bool {
        self.log_is_open()
    }

    // ========================================================================
    // Checkpoint interaction
    // ========================================================================

    /// Fires the periodic checkpoint if its jittered trigger is due.
    ///
    /// Returns true if a checkpoint was generated.
    pub fn on_checkpoint_timer(&mut self, now_ms: u64) -> bool {
        if !self.background.checkpoint.due(now_ms) {
            return false;
        }
        match self.generate_checkpoint(now_ms) {
            Ok(()) => true,
            Err(err) => {
                self.handle_local_failure(&err);
                false
            }
        }
    }

    /// Generates a checkpoint now, advancing the durable watermark and
    /// garbage-collecting the private log below it.
    pub fn generate_checkpoint(&mut self, now_ms: u64) -> Result<(), ReplicaError> {
        self.on_checkpoint_started();
        let result = self.engine_mut().generate_checkpoint();
        self.background.checkpoint.update_last_generate_time(now_ms);
        match result {
            Ok(durable) => {
                info!(replica = %self.name(), durable = %durable, "checkpoint generated");
                if let Some(log) = self.log_mut() {
                    log.garbage_collect(durable);
                }
                self.update_log_size_metric();
                self.on_checkpoint_completed();
                Ok(())
            }
            Err(err) => {
                self.on_checkpoint_completed();
                Err(ReplicaError::CheckpointFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Marks a checkpoint as running; on a secondary this suspends
    /// applies (the commit pipeline skips them).
    pub fn on_checkpoint_started(&mut self) {
        if let RoleState::Secondary(ctx) = self.role_mut() {
            ctx.checkpoint_is_running = true;
        }
        self.background.tracker.register("checkpoint");
    }

    /// Marks the checkpoint finished and catches up any commits that
    /// were skipped while it ran.
    pub fn on_checkpoint_completed(&mut self) {
        self.background.tracker.complete("checkpoint");
        if let RoleState::Secondary(ctx) = self.role_mut() {
            ctx.checkpoint_is_running = false;
        }
        self.catch_up_with_private_log();
    }

    /// Replays committed-but-unapplied decrees from the private log.
    ///
    /// The committed prefix never moves here; only the engine's applied
    /// prefix catches up to it.
    pub fn catch_up_with_private_log(&mut self) {
        let app_committed = self.engine().last_committed_decree();
        let replica_committed = self.last_committed_decree();
        if app_committed >= replica_committed {
            return;
        }

        let to_replay: Vec<Mutation> = {
            let Some(log) = self.log_ref() else {
                return;
            };
            log.read_from(app_committed)
                .into_iter()
                .filter(|mu| mu.decree <= replica_committed)
                .collect()
        };

        info!(
            replica = %self.name(),
            from = %app_committed,
            to = %replica_committed,
            count = to_replay.len(),
            "catching up applied prefix from private log"
        );

        for mutation in to_replay {
            if self.engine().last_committed_decree() >= mutation.decree {
                continue;
            }
            if let Err(err) = self.engine_mut().apply_mutation(&mutation) {
                self.handle_local_failure(&err);
                return;
            }
        }
    }
}
