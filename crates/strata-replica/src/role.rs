//! Role state: tagged per-role contexts and the transition matrix.
//!
//! The partition status is the only authoritative role label; state that
//! exists for exactly one role lives inside that role's variant and is
//! unreachable from any other arm. Transitions are driven solely by
//! configuration updates from meta and by local fatal errors.

use std::collections::{HashMap, HashSet, VecDeque};

use strata_types::{Decree, LearningStatus, NodeId, PartitionConfig, PartitionStatus};
use tracing::{info, warn};

use crate::request::ClientRequest;

// ============================================================================
// Per-role contexts
// ============================================================================

/// A client write admitted while the two-phase-commit window was full,
/// waiting for a slot.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    pub request: ClientRequest,
}

/// State that exists only while this replica is the primary.
#[derive(Debug, Clone)]
pub struct PrimaryContext {
    /// Group membership under the current ballot.
    pub membership: PartitionConfig,

    /// Highest decree prepared by the previous primary; reads are denied
    /// until the committed prefix catches up to it.
    pub last_prepare_decree_on_new_primary: Decree,

    /// Writes waiting for the prepare window to open.
    pub write_queue: VecDeque<QueuedWrite>,

    /// Prepare acknowledgements per pending decree (self-ack included).
    pub prepare_acks: HashMap<Decree, HashSet<NodeId>>,
}

impl PrimaryContext {
    pub fn new(membership: PartitionConfig, last_prepare_decree_on_new_primary: Decree) -> Self {
        Self {
            membership,
            last_prepare_decree_on_new_primary,
            write_queue: VecDeque::new(),
            prepare_acks: HashMap::new(),
        }
    }

    /// Empties the write queue without committing untransmitted writes.
    pub fn cleanup(&mut self) {
        if !self.write_queue.is_empty() {
            warn!(
                dropped = self.write_queue.len(),
                "dropping queued writes on primary exit"
            );
        }
        self.write_queue.clear();
        self.prepare_acks.clear();
    }

    pub fn is_cleaned(&self) -> bool {
        self.write_queue.is_empty() && self.prepare_acks.is_empty()
    }
}

/// State that exists only while this replica is a secondary.
#[derive(Debug, Clone, Default)]
pub struct SecondaryContext {
    /// While true the commit pipeline skips applies; the private log
    /// retains the records and catch-up runs after the checkpoint.
    pub checkpoint_is_running: bool,
}

impl SecondaryContext {
    pub fn cleanup(&mut self) {
        self.checkpoint_is_running = false;
    }

    pub fn is_cleaned(&self) -> bool {
        !self.checkpoint_is_running
    }
}

/// State that exists only while this replica is a potential secondary.
#[derive(Debug, Clone, Default)]
pub struct LearnerContext {
    pub learning_status: LearningStatus,
}

impl LearnerContext {
    /// True when prepares may be applied directly to the engine.
    pub fn can_apply(&self) -> bool {
        matches!(
            self.learning_status,
            LearningStatus::Succeeded | LearningStatus::WithPrepareTransient
        )
    }

    pub fn cleanup(&mut self) {
        if !matches!(
            self.learning_status,
            LearningStatus::NotStarted | LearningStatus::Succeeded
        ) {
            info!(status = ?self.learning_status, "cancelling learning");
        }
        self.learning_status = LearningStatus::NotStarted;
    }

    pub fn is_cleaned(&self) -> bool {
        matches!(self.learning_status, LearningStatus::NotStarted)
    }
}

/// State of the child side of a partition split.
#[derive(Debug, Clone, Default)]
pub struct SplitContext {
    /// The child applies mutations only once it has caught up with the
    /// parent's committed prefix.
    pub is_caught_up: bool,
}

impl SplitContext {
    pub fn cleanup(&mut self) {
        self.is_caught_up = false;
    }

    pub fn is_cleaned(&self) -> bool {
        !self.is_caught_up
    }
}

// ============================================================================
// Role state
// ============================================================================

/// Tagged role state; the variant is the partition status.
#[derive(Debug, Clone)]
pub enum RoleState {
    Inactive {
        /// True when the inactivity is a transient step inside a
        /// reconfiguration rather than a terminal unassignment.
        transient: bool,
    },
    Primary(PrimaryContext),
    Secondary(SecondaryContext),
    PotentialSecondary(LearnerContext),
    Split(SplitContext),
    Error,
}

impl RoleState {
    pub fn status(&self) -> PartitionStatus {
        match self {
            RoleState::Inactive { .. } => PartitionStatus::Inactive,
            RoleState::Primary(_) => PartitionStatus::Primary,
            RoleState::Secondary(_) => PartitionStatus::Secondary,
            RoleState::PotentialSecondary(_) => PartitionStatus::PotentialSecondary,
            RoleState::Split(_) => PartitionStatus::PartitionSplit,
            RoleState::Error => PartitionStatus::Error,
        }
    }

    /// Whether meta may move this role to `target`.
    ///
    /// Local failures (any role to Error) and split-child creation (any
    /// role to PartitionSplit) are always allowed; the remaining matrix
    /// is the configuration-driven one.
    pub fn can_transition_to(&self, target: PartitionStatus) -> bool {
        use PartitionStatus as S;
        if matches!(target, S::Error | S::PartitionSplit) {
            return true;
        }
        match self.status() {
            S::Inactive => matches!(target, S::Primary | S::Secondary | S::PotentialSecondary),
            S::Primary => matches!(target, S::Inactive | S::Secondary),
            S::Secondary => matches!(target, S::Inactive | S::Primary | S::PotentialSecondary),
            S::PotentialSecondary => matches!(target, S::Secondary | S::Inactive),
            S::PartitionSplit => matches!(target, S::Inactive | S::Secondary),
            S::Error => false,
        }
    }

    /// Runs the exit action for the current role, leaving it clean.
    pub fn cleanup_for_exit(&mut self) {
        match self {
            RoleState::Primary(ctx) => ctx.cleanup(),
            RoleState::Secondary(ctx) => ctx.cleanup(),
            RoleState::PotentialSecondary(ctx) => ctx.cleanup(),
            RoleState::Split(ctx) => ctx.cleanup(),
            RoleState::Inactive { .. } | RoleState::Error => {}
        }
    }

    /// True when no role-specific transient state remains.
    pub fn is_cleaned(&self) -> bool {
        match self {
            RoleState::Primary(ctx) => ctx.is_cleaned(),
            RoleState::Secondary(ctx) => ctx.is_cleaned(),
            RoleState::PotentialSecondary(ctx) => ctx.is_cleaned(),
            RoleState::Split(ctx) => ctx.is_cleaned(),
            RoleState::Inactive { .. } | RoleState::Error => true,
        }
    }

    pub fn as_primary(&self) -> Option<&PrimaryContext> {
        match self {
            RoleState::Primary(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn as_primary_mut(&mut self) -> Option<&mut PrimaryContext> {
        match self {
            RoleState::Primary(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Builds the target role state for an accepted configuration.
pub(crate) fn role_for_config(config: &PartitionConfig, max_prepared: Decree) -> RoleState {
    match config.status {
        PartitionStatus::Inactive => RoleState::Inactive { transient: false },
        PartitionStatus::Primary => {
            RoleState::Primary(PrimaryContext::new(config.clone(), max_prepared))
        }
        PartitionStatus::Secondary => RoleState::Secondary(SecondaryContext::default()),
        PartitionStatus::PotentialSecondary => {
            RoleState::PotentialSecondary(LearnerContext::default())
        }
        PartitionStatus::PartitionSplit => RoleState::Split(SplitContext::default()),
        PartitionStatus::Error => RoleState::Error,
    }
}
