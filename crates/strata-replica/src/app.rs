//! The storage-engine seam.
//!
//! [`StorageEngine`] is the narrow contract between the replica core and
//! the embedded engine that serves reads, applies mutations and produces
//! checkpoints. The engine owns the three durability watermarks; the core
//! only ever observes them and asserts the prefix chain
//! `last_durable <= last_flushed <= last_committed`.

use bytes::Bytes;
use strata_types::Decree;

use crate::mutation::Mutation;
use crate::request::ClientRequest;
use crate::ReplicaResult;

// ============================================================================
// Manual compaction status
// ============================================================================

/// Parsed state of a manual compaction, derived from the engine's
/// free-form compact-state string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManualCompactionStatus {
    Idle,
    Queuing,
    Running,
    Finished,
}

impl ManualCompactionStatus {
    /// Total and injective over the enum; the inverse of parsing the
    /// engine's state string.
    pub fn as_str(self) -> &'static str {
        match self {
            ManualCompactionStatus::Idle => "idle",
            ManualCompactionStatus::Queuing => "queuing",
            ManualCompactionStatus::Running => "running",
            ManualCompactionStatus::Finished => "finished",
        }
    }

    /// Classifies an engine compact-state string.
    ///
    /// The engine reports one of:
    /// - `last finish at [-]` - never compacted
    /// - `last finish at [ts], last used {n} ms` - finished
    /// - `last finish at [-], recent enqueue at [ts]` - queued
    /// - `last finish at [-], recent enqueue at [ts], recent start at [ts]`
    ///   - running
    pub fn from_compact_state(state: &str) -> Self {
        if state.contains("recent start at") {
            ManualCompactionStatus::Running
        } else if state.contains("recent enqueue at") {
            ManualCompactionStatus::Queuing
        } else if state.contains("last used") {
            ManualCompactionStatus::Finished
        } else {
            ManualCompactionStatus::Idle
        }
    }
}

impl std::fmt::Display for ManualCompactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Hotkey detection
// ============================================================================

/// Engine-side answer to a hotkey detection request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HotkeyResponse {
    pub err: Option<String>,
    pub hotkey: Option<Bytes>,
}

// ============================================================================
// Storage engine contract
// ============================================================================

/// Contract to the embedded storage engine backing one partition.
///
/// All methods are invoked from the replica's single-threaded executor.
/// `apply_mutation` advancing the engine's `last_committed_decree` is the
/// only way that watermark moves.
pub trait StorageEngine {
    /// Serves a client read.
    fn on_request(&mut self, request: &ClientRequest) -> ReplicaResult<Bytes>;

    /// Applies a committed mutation; advances `last_committed_decree` on
    /// success. A non-OK result is fatal to the replica.
    fn apply_mutation(&mut self, mutation: &Mutation) -> ReplicaResult<()>;

    fn last_committed_decree(&self) -> Decree;

    /// Highest decree flushed from the memtable to disk.
    fn last_flushed_decree(&self) -> Decree;

    /// Highest decree covered by a durable checkpoint.
    fn last_durable_decree(&self) -> Decree;

    /// Produces a durable checkpoint of the applied prefix, returning
    /// the new `last_durable_decree`.
    fn generate_checkpoint(&mut self) -> ReplicaResult<Decree>;

    fn query_data_version(&self) -> u32;

    /// Free-form manual-compaction state string; see
    /// [`ManualCompactionStatus::from_compact_state`].
    fn query_compact_state(&self) -> String;

    fn on_detect_hotkey(&mut self, request: &ClientRequest) -> HotkeyResponse;

    /// Cancels engine-side background work (compaction, flush). With
    /// `wait` the call returns only after the work has stopped.
    fn cancel_background_work(&mut self, wait: bool);

    /// Closes the engine, optionally clearing on-disk state.
    fn close(&mut self, clear_state: bool) -> ReplicaResult<()>;
}
