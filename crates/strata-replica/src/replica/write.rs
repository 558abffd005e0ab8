//! The client write path and the prepare/ack protocol edges.
//!
//! A write admitted on the primary becomes a mutation at the next
//! decree, is inserted into the prepare list, appended to the private
//! log, and broadcast to the secondaries as prepare messages. It commits
//! once it is logged locally and acknowledged by a majority of the
//! replica group under the current ballot; the commit pipeline then
//! applies it in decree order.

use strata_types::{Ballot, Decree, NodeId, PartitionStatus};
use tracing::{debug, warn};

use crate::metrics;
use crate::mutation::Mutation;
use crate::request::{ClientRequest, ClientResponse};
use crate::role::{QueuedWrite, RoleState};
use crate::throttle::ThrottleDecision;
use crate::ReplicaError;

use super::commit::CommitOutput;
use super::ReplicaCore;

// ============================================================================
// Protocol messages
// ============================================================================

/// Prepare sent from the primary to one group member.
#[derive(Debug, Clone)]
pub struct PrepareMsg {
    pub target: NodeId,
    pub ballot: Ballot,
    pub mutation: Mutation,
    /// Primary's committed prefix, piggybacked so receivers advance.
    pub last_committed: Decree,
}

/// Acknowledgement of a prepare, sent back to the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareAck {
    pub node: NodeId,
    pub ballot: Ballot,
    pub decree: Decree,
    pub err: Option<ReplicaError>,
}

/// What the write path hands back to the runtime.
#[derive(Debug)]
pub enum WriteReply {
    /// The write occupies `decree`; transmit the output's prepares. The
    /// client reply itself arrives through a later commit step's output
    /// (immediately, for a single-member group).
    Prepared {
        decree: Decree,
        output: CommitOutput,
    },

    /// The two-phase-commit window is full; the write is queued and will
    /// be prepared as commits free slots.
    Queued,

    /// The throttler owns the response; re-submit at `retry_at_ms`.
    Delayed { retry_at_ms: u64 },

    /// Reply to the client now (admission failure).
    Response(ClientResponse),
}

impl ReplicaCore {
    /// Admits a client write on the primary.
    pub fn on_client_write(&mut self, request: ClientRequest, now_ms: u64) -> WriteReply {
        if self.is_closed() {
            return self.write_reject(ReplicaError::Closed);
        }

        if !self.access().allowed(&request) {
            return self.write_reject(ReplicaError::AclDeny);
        }

        if request.partition_version != self.partition_version() {
            return self.write_reject(ReplicaError::Splitting);
        }

        match self.throttler_mut().admit_write(now_ms) {
            ThrottleDecision::Allow => {}
            ThrottleDecision::Delay { until_ms } => {
                metrics::record_throttling_event(self.pid(), "write", "delay");
                return WriteReply::Delayed {
                    retry_at_ms: until_ms,
                };
            }
            ThrottleDecision::Reject => {
                metrics::record_throttling_event(self.pid(), "write", "reject");
                return self.write_reject(ReplicaError::Busy);
            }
        }

        if self.status() != PartitionStatus::Primary {
            return self.write_reject(ReplicaError::InvalidState {
                status: self.status(),
            });
        }

        // Duplication ships the private log to a remote cluster; a write
        // that cannot be retried safely must not enter it.
        if !request.idempotent
            && self
                .background
                .duplication
                .as_ref()
                .is_some_and(|d| d.duplicating)
        {
            metrics::record_dup_disabled_non_idempotent_write(&self.app_info().app_name);
            return self.write_reject(ReplicaError::InvalidState {
                status: self.status(),
            });
        }

        // Window full: queue, to be drained by the commit pipeline.
        if self.prepare_list().pending_count() >= self.prepare_list().capacity() {
            let ctx = self.role_mut().as_primary_mut().expect("primary");
            ctx.write_queue.push_back(QueuedWrite { request });
            let queued = ctx.write_queue.len();
            debug!(replica = %self.name(), queued, "write queued");
            return WriteReply::Queued;
        }

        match self.init_prepare(&request, now_ms) {
            Ok((decree, output)) => WriteReply::Prepared { decree, output },
            Err(err) => {
                self.handle_local_failure(&err);
                self.write_reject(err)
            }
        }
    }

    /// Builds and stages the mutation for an admitted write.
    ///
    /// On return the mutation is resident in the prepare list, logged
    /// (offset assigned), self-acknowledged, and its broadcast prepares
    /// are in the output. The request itself rides the mutation and is
    /// answered when the decree commits.
    pub(crate) fn init_prepare(
        &mut self,
        request: &ClientRequest,
        now_ms: u64,
    ) -> Result<(Decree, CommitOutput), ReplicaError> {
        let decree = self.max_prepared_decree().next();
        let mut mutation = self.new_mutation(decree);
        mutation.add_update(request.code, request.payload.clone(), request.start_time_ns);
        mutation.add_client_request(request.clone());

        self.prepare_list_mut().prepare(mutation.clone())?;

        let offset = {
            let log = self.log_mut().ok_or(ReplicaError::Closed)?;
            log.append(&mutation)?
        };
        self.prepare_list_mut().mark_logged(decree, offset);
        mutation.log_offset = Some(offset);
        self.update_log_size_metric();

        // Prepares carry the wire form; request handles stay local.
        let wire = mutation.wire_clone();

        let node = self.node_id();
        let ballot = self.ballot();
        let last_committed = self.last_committed_decree();
        let ctx = self.role_mut().as_primary_mut().expect("primary");
        ctx.prepare_acks.entry(decree).or_default().insert(node);

        let prepares: Vec<PrepareMsg> = ctx
            .membership
            .secondaries
            .iter()
            .map(|&target| PrepareMsg {
                target,
                ballot,
                mutation: wire.clone(),
                last_committed,
            })
            .collect();

        debug!(replica = %self.name(), mutation = %mutation.name(), "prepare initiated");

        let mut output = CommitOutput::with_prepares(prepares);
        // A group of one commits immediately on the self-ack.
        output.merge(self.try_commit_acked(now_ms));

        Ok((decree, output))
    }

    /// Receives a prepare on a secondary, learner or split child.
    ///
    /// Returns the ack to transmit to the primary; follow-on prepares
    /// (none today) would accompany it.
    pub fn on_prepare(&mut self, msg: &PrepareMsg, now_ms: u64) -> PrepareAck {
        let decree = msg.mutation.decree;
        let node = self.node_id();
        let nack = |err: ReplicaError| PrepareAck {
            node,
            ballot: msg.ballot,
            decree,
            err: Some(err),
        };

        if self.is_closed() {
            return nack(ReplicaError::Closed);
        }

        match self.role() {
            RoleState::Secondary(_) | RoleState::Split(_) => {}
            RoleState::PotentialSecondary(ctx) => {
                if matches!(ctx.learning_status, strata_types::LearningStatus::NotStarted) {
                    // Prepares start flowing once learning has engaged.
                    return nack(ReplicaError::InvalidState {
                        status: self.status(),
                    });
                }
            }
            _ => {
                return nack(ReplicaError::InvalidState {
                    status: self.status(),
                });
            }
        }

        if msg.ballot < self.ballot() {
            warn!(
                replica = %self.name(),
                prepare_ballot = %msg.ballot,
                current_ballot = %self.ballot(),
                "stale-ballot prepare refused"
            );
            return nack(ReplicaError::InvalidState {
                status: self.status(),
            });
        }

        if let Err(err) = self.prepare_list_mut().prepare(msg.mutation.clone()) {
            self.handle_local_failure(&err);
            return nack(err);
        }

        let append = {
            let log = self.log_mut().expect("private log open");
            log.append(&msg.mutation)
        };
        match append {
            Ok(offset) => {
                self.prepare_list_mut().mark_logged(decree, offset);
                self.update_log_size_metric();
            }
            Err(err) => {
                self.handle_local_failure(&err);
                return nack(err);
            }
        }

        // Advance to the primary's committed prefix. Non-primary commits
        // answer no clients and stage no prepares.
        let output = self.advance_committed_to(msg.last_committed, now_ms);
        debug_assert!(output.is_empty(), "non-primary commit produced output");

        PrepareAck {
            node: self.node_id(),
            ballot: msg.ballot,
            decree,
            err: None,
        }
    }

    /// Receives a prepare acknowledgement on the primary.
    ///
    /// Commits every contiguous decree that has reached quorum; the
    /// output carries the committed writes' client replies and any
    /// follow-on prepares drained from the write queue.
    pub fn on_prepare_ack(&mut self, ack: &PrepareAck, now_ms: u64) -> CommitOutput {
        if self.is_closed() || self.status() != PartitionStatus::Primary {
            return CommitOutput::default();
        }
        if ack.ballot != self.ballot() {
            debug!(
                replica = %self.name(),
                ack_ballot = %ack.ballot,
                "ack under stale ballot ignored"
            );
            return CommitOutput::default();
        }
        if ack.err.is_some() {
            // A refused prepare is retried by the runtime; nothing to
            // record here.
            return CommitOutput::default();
        }

        let ctx = self.role_mut().as_primary_mut().expect("primary");
        ctx.prepare_acks.entry(ack.decree).or_default().insert(ack.node);

        self.try_commit_acked(now_ms)
    }

    /// Commits every contiguous quorum-acked, logged decree.
    fn try_commit_acked(&mut self, now_ms: u64) -> CommitOutput {
        let mut output = CommitOutput::default();
        loop {
            let next = self.last_committed_decree().next();
            let Some(ctx) = self.role().as_primary() else {
                break;
            };
            let quorum = ctx.membership.quorum_size();
            let acked = ctx.prepare_acks.get(&next).map_or(0, std::collections::HashSet::len);
            if acked < quorum {
                break;
            }
            let logged = self
                .prepare_list()
                .get(next)
                .is_some_and(Mutation::is_logged);
            if !logged {
                break;
            }

            if let Some(ctx) = self.role_mut().as_primary_mut() {
                ctx.prepare_acks.remove(&next);
            }
            output.merge(self.advance_committed_to(next, now_ms));
        }
        output
    }

    fn write_reject(&self, err: ReplicaError) -> WriteReply {
        WriteReply::Response(ClientResponse::err(self.status(), err))
    }
}
