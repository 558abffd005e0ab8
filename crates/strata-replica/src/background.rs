//! Background activity coordination.
//!
//! The coordinator owns every long-running activity a replica can host:
//! the periodic checkpoint timer, cold backup, bulk load, partition
//! split, disk migration and duplication. Activities observe commit
//! state but never violate it; `close()` gates on all of them being
//! drained. Cancellation is cooperative: each activity checks its flag
//! at safe points (checkpoint between segments, backup between files,
//! learning between batches).

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strata_types::{Decree, DiskMigrationStatus, Pid};
use tracing::{debug, info};

use crate::metrics;

// ============================================================================
// Checkpoint timer
// ============================================================================

/// Periodic checkpoint scheduling with per-replica jitter.
///
/// The next trigger is drawn uniformly from `[max/2, max]` after the
/// previous checkpoint; keeping the lower bound at half the interval
/// preserves the anti-thundering-herd property across partitions.
#[derive(Debug)]
pub struct CheckpointTimer {
    max_interval_ms: u64,
    last_generate_ms: u64,
    next_trigger_ms: u64,
    rng: SmallRng,
    cancelled: bool,
}

impl CheckpointTimer {
    pub fn new(max_interval_ms: u64, seed: u64) -> Self {
        let mut timer = Self {
            max_interval_ms,
            last_generate_ms: 0,
            next_trigger_ms: 0,
            rng: SmallRng::seed_from_u64(seed),
            cancelled: false,
        };
        timer.update_last_generate_time(0);
        timer
    }

    /// Records a checkpoint generation and schedules the next trigger at
    /// `now + rand_uniform(max/2, max]`.
    pub fn update_last_generate_time(&mut self, now_ms: u64) {
        self.last_generate_ms = now_ms;
        let max = self.max_interval_ms.max(2);
        self.next_trigger_ms = now_ms + self.rng.gen_range(max / 2..=max);
    }

    pub fn due(&self, now_ms: u64) -> bool {
        !self.cancelled && now_ms >= self.next_trigger_ms
    }

    pub fn next_trigger_ms(&self) -> u64 {
        self.next_trigger_ms
    }

    pub fn last_generate_ms(&self) -> u64 {
        self.last_generate_ms
    }

    /// Cancels the timer; joined by construction since triggers only
    /// fire from the replica's own executor.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

// ============================================================================
// Cold backup
// ============================================================================

/// Cold backup accounting for one replica.
#[derive(Debug)]
pub struct ColdBackupState {
    pid: Pid,
    running_count: u32,
    max_duration_ms: u64,
    max_upload_file_size: u64,
    /// Total checkpoint bytes accounted toward uploads.
    chkpt_total_size: u64,
}

impl ColdBackupState {
    pub fn new(pid: Pid, max_duration_ms: u64, max_upload_file_size: u64) -> Self {
        Self {
            pid,
            running_count: 0,
            max_duration_ms,
            max_upload_file_size,
            chkpt_total_size: 0,
        }
    }

    pub fn running_count(&self) -> u32 {
        self.running_count
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_ms
    }

    pub fn max_upload_file_size(&self) -> u64 {
        self.max_upload_file_size
    }

    pub fn chkpt_total_size(&self) -> u64 {
        self.chkpt_total_size
    }

    pub fn on_backup_started(&mut self) {
        self.running_count += 1;
    }

    /// Accounts uploaded checkpoint bytes and releases the running slot.
    pub fn on_backup_finished(&mut self, uploaded_bytes: u64) {
        assert!(self.running_count > 0, "backup finished without start");
        self.running_count -= 1;
        self.chkpt_total_size += uploaded_bytes;
        metrics::set_cold_backup_bytes(self.pid, self.chkpt_total_size as i64);
    }

    pub fn is_idle(&self) -> bool {
        self.running_count == 0
    }
}

// ============================================================================
// Bulk load / duplication / split handles
// ============================================================================

/// Bulk load progress of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkLoadStatus {
    #[default]
    Idle,
    Downloading,
    Ingesting,
    Succeeded,
    Failed,
}

#[derive(Debug, Default)]
pub struct BulkLoadState {
    pub status: BulkLoadStatus,
}

impl BulkLoadState {
    pub fn is_idle(&self) -> bool {
        matches!(
            self.status,
            BulkLoadStatus::Idle | BulkLoadStatus::Succeeded | BulkLoadStatus::Failed
        )
    }
}

/// Duplication bookkeeping: the decree confirmed shipped to the remote
/// cluster, and whether duplication currently accepts writes.
#[derive(Debug, Default)]
pub struct DuplicationState {
    pub duplicating: bool,
    pub confirmed_decree: Decree,
}

/// Parent-side split coordination handle. The child-side gate
/// (`is_caught_up`) lives in the role state.
#[derive(Debug, Default)]
pub struct SplitState {
    pub in_progress: bool,
}

// ============================================================================
// Task tracker
// ============================================================================

/// Names of background tasks owned by the replica, cancelled together
/// during `close`.
#[derive(Debug, Default)]
pub struct TaskTracker {
    outstanding: Vec<&'static str>,
    cancelled: bool,
}

impl TaskTracker {
    pub fn register(&mut self, name: &'static str) {
        assert!(!self.cancelled, "task registered after cancellation");
        self.outstanding.push(name);
    }

    pub fn complete(&mut self, name: &'static str) {
        if let Some(pos) = self.outstanding.iter().position(|n| *n == name) {
            self.outstanding.swap_remove(pos);
        }
    }

    /// Cancels and drains every outstanding task. Tasks honor
    /// cancellation at their next safe point; from the single-threaded
    /// executor's view that is immediate.
    pub fn cancel_outstanding_tasks(&mut self) {
        if !self.outstanding.is_empty() {
            debug!(count = self.outstanding.len(), "cancelling tracked tasks");
        }
        self.outstanding.clear();
        self.cancelled = true;
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Owns and gates every background activity of one replica.
///
/// Manager handles are droppable `Option`s so `close()` can release them
/// in its fixed order: duplication, backup, bulk load, split.
#[derive(Debug)]
pub struct BackgroundCoordinator {
    pub checkpoint: CheckpointTimer,
    pub disk_migration: DiskMigrationStatus,
    pub tracker: TaskTracker,

    pub duplication: Option<DuplicationState>,
    pub backup: Option<ColdBackupState>,
    pub bulk_load: Option<BulkLoadState>,
    pub split: Option<SplitState>,
}

impl BackgroundCoordinator {
    pub fn new(
        pid: Pid,
        checkpoint_max_interval_ms: u64,
        jitter_seed: u64,
        cold_backup_max_duration_ms: u64,
        cold_backup_max_upload_file_size: u64,
        duplicating: bool,
    ) -> Self {
        Self {
            checkpoint: CheckpointTimer::new(checkpoint_max_interval_ms, jitter_seed),
            disk_migration: DiskMigrationStatus::Idle,
            tracker: TaskTracker::default(),
            duplication: Some(DuplicationState {
                duplicating,
                confirmed_decree: Decree::ZERO,
            }),
            backup: Some(ColdBackupState::new(
                pid,
                cold_backup_max_duration_ms,
                cold_backup_max_upload_file_size,
            )),
            bulk_load: Some(BulkLoadState::default()),
            split: Some(SplitState::default()),
        }
    }

    /// True when every transient background activity is drained and the
    /// manager handles may be released.
    pub fn is_drained(&self) -> bool {
        self.tracker.outstanding_count() == 0
            && self.backup.as_ref().is_none_or(ColdBackupState::is_idle)
            && self.bulk_load.as_ref().is_none_or(BulkLoadState::is_idle)
            && self.split.as_ref().is_none_or(|s| !s.in_progress)
    }

    /// Releases manager handles in close order: duplication, backup,
    /// bulk load, split.
    pub fn release_managers(&mut self) {
        self.duplication.take();
        self.backup.take();
        self.bulk_load.take();
        self.split.take();
        info!("background managers released");
    }
}
