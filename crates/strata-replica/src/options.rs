//! Replica tuning options.
//!
//! Installed by the stub at construction; immutable afterwards.

use crate::throttle::ThrottleLimit;

/// Tuning knobs for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    /// Capacity of the prepare list, and therefore the maximum number of
    /// in-flight decrees beyond the committed prefix.
    pub max_mutation_count_in_prepare_list: usize,

    /// Upper bound on the periodic checkpoint interval. The actual
    /// trigger is jittered into `[max/2, max]` to avoid checkpoint
    /// storms across partitions of one process.
    pub checkpoint_max_interval_ms: u64,

    /// Cold backup duration cap.
    pub cold_backup_max_duration_ms: u64,

    /// Cold backup per-file upload size cap.
    pub cold_backup_max_upload_file_size: u64,

    /// Read admission limits; `None` disables read throttling.
    pub read_throttle: Option<ThrottleLimit>,

    /// Write admission limits; `None` disables write throttling.
    pub write_throttle: Option<ThrottleLimit>,

    /// Seed for the per-replica jitter RNG; fixed seeds make checkpoint
    /// scheduling reproducible under test.
    pub jitter_seed: u64,
}

impl ReplicaOptions {
    /// Options suitable for tests: tiny windows, no throttling.
    pub fn testing() -> Self {
        Self {
            max_mutation_count_in_prepare_list: 16,
            checkpoint_max_interval_ms: 10_000,
            cold_backup_max_duration_ms: 60_000,
            cold_backup_max_upload_file_size: 16 * 1024 * 1024,
            read_throttle: None,
            write_throttle: None,
            jitter_seed: 42,
        }
    }
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            max_mutation_count_in_prepare_list: 500,
            checkpoint_max_interval_ms: 2 * 3600 * 1000,
            cold_backup_max_duration_ms: 4 * 3600 * 1000,
            cold_backup_max_upload_file_size: 4 * 1024 * 1024 * 1024,
            read_throttle: None,
            write_throttle: None,
            jitter_seed: 0,
        }
    }
}
