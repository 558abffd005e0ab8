//! Core types shared across the strata replication stack.
//!
//! This crate defines the identity and status vocabulary used by the
//! replica execution core and the meta server:
//! - [`Pid`] - Partition identity (app id + partition index)
//! - [`Ballot`] - Monotone per-partition configuration epoch
//! - [`Decree`] - Monotone per-partition mutation sequence number
//! - [`PartitionStatus`] - Authoritative role label of a replica
//! - [`PartitionConfig`] - Atomic configuration unit delivered by meta
//! - [`AppInfo`] - Table metadata including the environment map

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Partition Identity
// ============================================================================

/// Identifier of a table (an "app" in meta-server terms).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AppId(u32);

impl AppId {
    /// The invalid app id (no table).
    pub const INVALID: AppId = AppId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AppId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Partition identity: `(app_id, partition_index)`.
///
/// Immutable for the lifetime of a replica. Displayed as `app.partition`,
/// which is also the label used for per-partition metrics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Pid {
    pub app_id: AppId,
    pub partition_index: u32,
}

impl Pid {
    pub fn new(app_id: AppId, partition_index: u32) -> Self {
        Self {
            app_id,
            partition_index,
        }
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Address surrogate for a member of a replica group.
///
/// The transport layer maps this to a real endpoint; the core only needs
/// identity and equality.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Ballot
// ============================================================================

/// Monotone per-partition configuration epoch, assigned by the meta server.
///
/// Every accepted mutation carries the ballot under which it was prepared.
///
/// # Invariants
///
/// - A replica's current ballot only increases over time
/// - Prepares from a lower ballot are rejected
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Ballot(u64);

impl Ballot {
    /// The initial ballot (before any configuration is installed).
    pub const ZERO: Ballot = Ballot(0);

    pub fn new(ballot: u64) -> Self {
        Self(ballot)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next ballot (incremented by 1).
    pub fn next(self) -> Self {
        Ballot(self.0.saturating_add(1))
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl From<u64> for Ballot {
    fn from(ballot: u64) -> Self {
        Self(ballot)
    }
}

// ============================================================================
// Decree
// ============================================================================

/// Monotone per-partition mutation sequence number.
///
/// Decrees are contiguous and strictly increasing in the committed prefix.
/// Decree 0 is the empty prefix; the first mutation is decree 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Decree(u64);

impl Decree {
    /// The empty committed prefix.
    pub const ZERO: Decree = Decree(0);

    pub fn new(decree: u64) -> Self {
        Self(decree)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next decree (incremented by 1).
    pub fn next(self) -> Self {
        Decree(self.0.saturating_add(1))
    }

    /// Returns the previous decree, saturating at zero.
    pub fn prev(self) -> Self {
        Decree(self.0.saturating_sub(1))
    }

    /// Number of decrees from `self` up to `other` (0 if `other <= self`).
    pub fn distance_to(self, other: Decree) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for Decree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl From<u64> for Decree {
    fn from(decree: u64) -> Self {
        Self(decree)
    }
}

// ============================================================================
// Partition Status
// ============================================================================

/// Authoritative role label of a replica within its partition group.
///
/// The status determines which requests a replica admits and how the
/// commit pipeline treats each mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PartitionStatus {
    /// Not serving; awaiting a configuration from meta.
    #[default]
    Inactive,

    /// Serving reads and writes; drives the two-phase commit.
    Primary,

    /// Accepting prepares from the primary; serves backup reads.
    Secondary,

    /// Catching up via learning; not yet part of the write quorum.
    PotentialSecondary,

    /// Child side of a partition split, replaying the parent's mutations.
    PartitionSplit,

    /// Frozen after a local fatal failure; recovered only by the stub.
    Error,
}

impl PartitionStatus {
    /// Returns true if the replica may make commit progress in this status.
    pub fn can_commit(self) -> bool {
        !matches!(self, PartitionStatus::Error)
    }
}

impl Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionStatus::Inactive => "inactive",
            PartitionStatus::Primary => "primary",
            PartitionStatus::Secondary => "secondary",
            PartitionStatus::PotentialSecondary => "potential-secondary",
            PartitionStatus::PartitionSplit => "partition-split",
            PartitionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Catch-up progress of a potential secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LearningStatus {
    #[default]
    NotStarted,
    /// Learning while also receiving prepares from the primary.
    WithPrepare,
    /// Learned state is being finalized; prepares already apply.
    WithPrepareTransient,
    Succeeded,
    Failed,
}

/// Progress of a replica-directory move to another disk.
///
/// Ordered: `close()` is admissible once the status is at least [`Moved`].
///
/// [`Moved`]: DiskMigrationStatus::Moved
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum DiskMigrationStatus {
    #[default]
    Idle,
    Moving,
    Moved,
    Closed,
}

// ============================================================================
// Partition Configuration
// ============================================================================

/// A partition's configuration, delivered atomically by the meta server.
///
/// No field may be mutated independently; the replica installs a whole
/// configuration or none of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub pid: Pid,
    pub ballot: Ballot,
    pub status: PartitionStatus,
    pub primary: Option<NodeId>,
    pub secondaries: Vec<NodeId>,
}

impl PartitionConfig {
    /// An empty configuration for a partition that has never been assigned.
    pub fn initial(pid: Pid) -> Self {
        Self {
            pid,
            ballot: Ballot::ZERO,
            status: PartitionStatus::Inactive,
            primary: None,
            secondaries: Vec::new(),
        }
    }

    /// Total member count: the primary (if any) plus all secondaries.
    pub fn replica_count(&self) -> usize {
        usize::from(self.primary.is_some()) + self.secondaries.len()
    }

    /// Majority quorum over the full replica group.
    pub fn quorum_size(&self) -> usize {
        self.replica_count() / 2 + 1
    }
}

// ============================================================================
// App Info
// ============================================================================

/// Meta-side lifecycle status of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppStatus {
    Creating,
    Available,
    Dropping,
    Dropped,
}

impl Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppStatus::Creating => "creating",
            AppStatus::Available => "available",
            AppStatus::Dropping => "dropping",
            AppStatus::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// Table metadata attached to every replica of the table.
///
/// The environment map is created at construction (possibly seeded from a
/// restore), read-only to the commit path, and written only through
/// configuration updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: AppId,
    pub app_name: String,
    pub app_type: String,
    pub partition_count: u32,
    pub envs: BTreeMap<String, String>,
    /// Whether cross-cluster duplication is configured for this table.
    pub duplicating: bool,
}

impl AppInfo {
    pub fn new(app_id: AppId, app_name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            app_id,
            app_name: app_name.into(),
            app_type: "strata".to_string(),
            partition_count,
            envs: BTreeMap::new(),
            duplicating: false,
        }
    }
}

// ============================================================================
// Environment Keys
// ============================================================================

/// Keys of the partition environment map used by backup and restore.
pub mod env_keys {
    /// Set to `"true"` when the engine must bootstrap from backup media.
    pub const FORCE_RESTORE: &str = "restore.force_restore";
    pub const BLOCK_SERVICE_PROVIDER: &str = "restore.block_service_provider";
    pub const CLUSTER_NAME: &str = "restore.cluster_name";
    pub const APP_NAME: &str = "restore.app_name";
    pub const APP_ID: &str = "restore.app_id";
    pub const BACKUP_ID: &str = "restore.backup_id";
    pub const RESTORE_PATH: &str = "restore.restore_path";
}
