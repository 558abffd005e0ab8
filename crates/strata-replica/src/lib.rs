//! # strata-replica: replica execution core
//!
//! This crate implements a single replica's in-memory state machine and
//! mutation-commit pipeline for a partition of a strata table. It decides,
//! under the partition's current role and ballot, whether an incoming
//! read or write is admissible, how a write becomes a durably-committed
//! decree, and how role transitions interleave with background activities
//! (checkpointing, learning, cold backup, bulk load, split, disk
//! migration).
//!
//! ## Overview
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌──────────────┐   deny    ┌─────────────┐
//! │  AccessGate  ├──────────►│  ACL_DENY   │
//! └──────┬───────┘           └─────────────┘
//!        ▼
//! ┌──────────────┐  delay/reject
//! │  Throttler   ├──────────► BUSY / retry later
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐  writes   ┌─────────────┐   ┌─────────────┐
//! │ ReplicaCore  ├──────────►│ PrepareList │──►│ MutationLog │
//! │ (role gate)  │           └──────┬──────┘   └─────────────┘
//! └──────┬───────┘                  │ quorum-acked, in decree order
//!        │ reads                    ▼
//!        ▼                   ┌──────────────┐
//! ┌──────────────┐           │CommitPipeline│──► StorageEngine.apply
//! │ StorageEngine│           └──────────────┘
//! └──────────────┘
//! ```
//!
//! ## Key invariants
//!
//! - `last_durable ≤ last_flushed ≤ last_committed ≤ max_prepared`
//! - mutations apply to the engine in strictly increasing decree order,
//!   at most once per `(pid, decree)`
//! - the ballot never decreases; a configuration with a lower ballot is
//!   rejected
//! - a role transition is totally ordered with commits: no commit
//!   straddles it
//!
//! ## Concurrency model
//!
//! The core is single-threaded per replica: all commit-path operations,
//! role transitions and `close` run on one logical executor per
//! partition. The methods here therefore take `&mut self` and never
//! block; time and randomness enter through arguments and a per-replica
//! seeded RNG so behavior is reproducible under test.

pub mod access;
pub mod app;
pub mod background;
pub mod metrics;
pub mod mutation;
pub mod options;
pub mod prepare_list;
pub mod replica;
pub mod request;
pub mod role;
pub mod throttle;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod scenarios;

pub use access::{create_replica_access_controller, AccessController};
pub use app::{HotkeyResponse, ManualCompactionStatus, StorageEngine};
pub use mutation::{LogOffset, Mutation, RequestRef, WriteUpdate};
pub use options::ReplicaOptions;
pub use prepare_list::PrepareList;
pub use replica::{
    CommitOutput, CommittedReply, PrepareAck, PrepareMsg, ReadReply, ReplicaCore, WriteReply,
};
pub use request::{
    register_rpc_code, register_storage_rpc_code, ClientRequest, ClientResponse, RpcCode,
};
pub use role::{PrimaryContext, RoleState, SecondaryContext};
pub use throttle::{ThrottleDecision, ThrottleLimit, Throttler};
pub use wal::{MemoryLog, MutationLog};

use strata_types::{Ballot, Decree, PartitionStatus};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the replica execution core.
///
/// Admission errors reply to the client and leave state unchanged.
/// Protocol, durability and app errors are fatal: the replica transitions
/// to [`PartitionStatus::Error`] and relies on meta-driven recovery. No
/// retry happens inside the commit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    /// The access controller denied the request.
    #[error("access denied")]
    AclDeny,

    /// The throttler rejected the request outright.
    #[error("throttled")]
    Busy,

    /// The replica's role does not admit this request.
    #[error("invalid state: {status}")]
    InvalidState { status: PartitionStatus },

    /// A pre-split request was observed after the partition split.
    #[error("partition is splitting")]
    Splitting,

    /// Ballot regression or decree non-contiguity. Fatal.
    #[error("inconsistent state: {reason}")]
    InconsistentState { reason: String },

    /// Private log I/O failure. Fatal on the write path.
    #[error("log io error: {reason}")]
    LogIo { reason: String },

    /// The disk hosting the replica is full. Fatal on the write path.
    #[error("disk full")]
    DiskFull,

    /// Checkpoint generation failed. Fatal.
    #[error("checkpoint failed: {reason}")]
    CheckpointFailed { reason: String },

    /// The storage engine returned a non-OK result from apply. Fatal.
    #[error("engine error: {reason}")]
    Engine { reason: String },

    /// The replica has been closed.
    #[error("replica closed")]
    Closed,

    /// No replica serves the addressed partition.
    #[error("partition not found")]
    ObjectNotFound,
}

impl ReplicaError {
    /// True for errors that convert the replica to [`PartitionStatus::Error`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicaError::InconsistentState { .. }
                | ReplicaError::LogIo { .. }
                | ReplicaError::DiskFull
                | ReplicaError::CheckpointFailed { .. }
                | ReplicaError::Engine { .. }
        )
    }

    /// True for errors that reply to the client without touching state.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ReplicaError::AclDeny
                | ReplicaError::Busy
                | ReplicaError::InvalidState { .. }
                | ReplicaError::Splitting
        )
    }

    pub(crate) fn ballot_regression(current: Ballot, proposed: Ballot) -> Self {
        ReplicaError::InconsistentState {
            reason: format!("ballot regression: current {current}, proposed {proposed}"),
        }
    }

    pub(crate) fn decree_gap(expected: Decree, actual: Decree) -> Self {
        ReplicaError::InconsistentState {
            reason: format!("decree non-contiguity: expected {expected}, got {actual}"),
        }
    }
}

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;
