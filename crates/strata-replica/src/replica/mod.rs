//! The replica core: lifecycle, role dispatch and request entry points.
//!
//! One `ReplicaCore` serves one partition. All methods run on the
//! replica's single-threaded executor; nothing here blocks, and every
//! suspension point (log append, quorum ack, engine apply) surfaces as a
//! return value the runtime acts on.
//!
//! # Module map
//!
//! - [`mod@self`] - construction, accessors, durability watermarks,
//!   failure handling, `close`
//! - [`read`] - `on_client_read`
//! - [`write`] - `on_client_write`, prepare/ack protocol edges
//! - [`commit`] - the role-conditioned commit pipeline and checkpoint
//!   interaction
//! - [`config_update`] - meta-driven configuration installation

mod commit;
mod config_update;
mod read;
mod write;

pub use commit::{CommitOutput, CommittedReply};
pub use read::ReadReply;
pub use write::{PrepareAck, PrepareMsg, WriteReply};

use std::collections::BTreeMap;

use prometheus::Histogram;
use strata_types::{
    AppInfo, Ballot, Decree, DiskMigrationStatus, NodeId, PartitionConfig, PartitionStatus, Pid,
    env_keys,
};
use tracing::{debug, error, info, warn};

use crate::access::{create_replica_access_controller, AccessController};
use crate::app::{HotkeyResponse, ManualCompactionStatus, StorageEngine};
use crate::background::BackgroundCoordinator;
use crate::metrics;
use crate::mutation::Mutation;
use crate::options::ReplicaOptions;
use crate::prepare_list::PrepareList;
use crate::request::{is_storage_rpc_code, max_rpc_code, rpc_code_name, RpcCode};
use crate::role::RoleState;
use crate::throttle::Throttler;
use crate::wal::MutationLog;
use crate::{ReplicaError, ReplicaResult};

/// A single replica's in-memory state machine.
pub struct ReplicaCore {
    pid: Pid,
    name: String,
    node_id: NodeId,
    app_info: AppInfo,
    #[allow(dead_code)] // replica directory, used by disk migration tooling
    dir: String,

    /// Extra envs beyond the table's, e.g. `FORCE_RESTORE` when the
    /// replica bootstraps from backup media.
    extra_envs: BTreeMap<String, String>,

    options: ReplicaOptions,
    config: PartitionConfig,
    role: RoleState,
    prepare_list: PrepareList,

    engine: Box<dyn StorageEngine>,
    log: Option<Box<dyn MutationLog>>,

    throttler: Throttler,
    access: Box<dyn AccessController>,
    pub(crate) background: BackgroundCoordinator,

    /// Bumped when the partition splits; requests routed with an older
    /// version predate the split.
    partition_version: u32,

    /// Table-level latency histograms, dense by RPC code; populated only
    /// for codes registered as storage requests.
    latency_histograms: Vec<Option<Histogram>>,

    closed: bool,
    create_time_ms: u64,
    last_config_change_ms: u64,
}

impl ReplicaCore {
    /// Constructs a replica for `pid`, initially [`PartitionStatus::Inactive`].
    ///
    /// `need_restore` seeds the env map with `FORCE_RESTORE=true`,
    /// instructing the engine to bootstrap from backup media instead of
    /// the private log.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        pid: Pid,
        app_info: AppInfo,
        dir: impl Into<String>,
        need_restore: bool,
        options: ReplicaOptions,
        engine: Box<dyn StorageEngine>,
        log: Box<dyn MutationLog>,
        now_ms: u64,
    ) -> Self {
        assert!(!app_info.app_type.is_empty(), "app type must be set");

        let name = format!("{pid}@{node_id}");
        let mut extra_envs = BTreeMap::new();
        if need_restore {
            extra_envs.insert(env_keys::FORCE_RESTORE.to_string(), "true".to_string());
        }

        let mut throttler = Throttler::unlimited();
        if let Some(limit) = options.read_throttle {
            throttler = throttler.with_read_limit(limit);
        }
        if let Some(limit) = options.write_throttle {
            throttler = throttler.with_write_limit(limit);
        }

        let latency_histograms = init_table_level_latency_counters(&app_info.app_name);

        let mut background = BackgroundCoordinator::new(
            pid,
            options.checkpoint_max_interval_ms,
            options.jitter_seed,
            options.cold_backup_max_duration_ms,
            options.cold_backup_max_upload_file_size,
            app_info.duplicating,
        );
        background.checkpoint.update_last_generate_time(now_ms);

        let access = create_replica_access_controller(&name);
        let init_decree = engine.last_committed_decree();

        info!(replica = %name, init_decree = %init_decree, need_restore, "replica created");

        Self {
            pid,
            name,
            node_id,
            app_info,
            dir: dir.into(),
            extra_envs,
            config: PartitionConfig::initial(pid),
            role: RoleState::Inactive { transient: false },
            prepare_list: PrepareList::new(init_decree, options.max_mutation_count_in_prepare_list),
            engine,
            log: Some(log),
            throttler,
            access,
            background,
            partition_version: 0,
            latency_histograms,
            closed: false,
            create_time_ms: now_ms,
            last_config_change_ms: now_ms,
            options,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn status(&self) -> PartitionStatus {
        self.role.status()
    }

    pub fn ballot(&self) -> Ballot {
        self.config.ballot
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn partition_version(&self) -> u32 {
        self.partition_version
    }

    pub fn create_time_ms(&self) -> u64 {
        self.create_time_ms
    }

    pub fn last_config_change_ms(&self) -> u64 {
        self.last_config_change_ms
    }

    pub(crate) fn role(&self) -> &RoleState {
        &self.role
    }

    pub(crate) fn role_mut(&mut self) -> &mut RoleState {
        &mut self.role
    }

    pub(crate) fn set_role(&mut self, role: RoleState) {
        self.role = role;
    }

    pub(crate) fn set_config_internal(&mut self, config: PartitionConfig) {
        self.config = config;
    }

    pub(crate) fn touch_config_change(&mut self, now_ms: u64) {
        self.last_config_change_ms = now_ms;
    }

    pub fn prepare_list(&self) -> &PrepareList {
        &self.prepare_list
    }

    pub(crate) fn prepare_list_mut(&mut self) -> &mut PrepareList {
        &mut self.prepare_list
    }

    pub(crate) fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    pub(crate) fn engine_mut(&mut self) -> &mut dyn StorageEngine {
        self.engine.as_mut()
    }

    pub(crate) fn log_mut(&mut self) -> Option<&mut Box<dyn MutationLog>> {
        self.log.as_mut()
    }

    pub(crate) fn log_ref(&self) -> Option<&dyn MutationLog> {
        self.log.as_deref()
    }

    pub(crate) fn log_is_open(&self) -> bool {
        self.log.is_some()
    }

    pub(crate) fn access(&self) -> &dyn AccessController {
        self.access.as_ref()
    }

    /// Replaces the access controller, e.g. when the stub reloads ACLs.
    pub fn set_access_controller(&mut self, access: Box<dyn AccessController>) {
        self.access = access;
    }

    pub(crate) fn throttler_mut(&mut self) -> &mut Throttler {
        &mut self.throttler
    }

    /// Looks up the env value for `key`, replica-local envs first.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.extra_envs
            .get(key)
            .or_else(|| self.app_info.envs.get(key))
            .map(String::as_str)
    }

    /// Environment value lookup used by the restore bootstrap.
    pub fn need_restore(&self) -> bool {
        self.env(env_keys::FORCE_RESTORE) == Some("true")
    }

    // ========================================================================
    // Decree watermarks
    // ========================================================================

    pub fn last_committed_decree(&self) -> Decree {
        self.prepare_list.last_committed()
    }

    pub fn max_prepared_decree(&self) -> Decree {
        self.prepare_list.max_decree()
    }

    pub fn last_durable_decree(&self) -> Decree {
        self.engine.last_durable_decree()
    }

    pub fn last_flushed_decree(&self) -> Decree {
        self.engine.last_flushed_decree()
    }

    /// Safe replay/catch-up horizon: the highest decree reachable from
    /// `last_committed` through populated, logged slots with
    /// non-decreasing ballots.
    pub fn last_prepared_decree(&self) -> Decree {
        let mut last_ballot = Ballot::ZERO;
        let mut start = self.last_committed_decree();
        loop {
            match self.prepare_list.get(start.next()) {
                Some(mu) if mu.ballot >= last_ballot && mu.is_logged() => {
                    start = start.next();
                    last_ballot = mu.ballot;
                }
                _ => break,
            }
        }
        start
    }

    /// Asserts the durability prefix chain. Violations are bugs, not
    /// recoverable conditions.
    pub fn check_state_completeness(&self) {
        assert!(
            self.max_prepared_decree() >= self.last_committed_decree(),
            "{}: max_prepared {} < last_committed {}",
            self.name,
            self.max_prepared_decree(),
            self.last_committed_decree()
        );
        assert!(
            self.last_committed_decree() >= self.last_flushed_decree(),
            "{}: last_committed {} < last_flushed {}",
            self.name,
            self.last_committed_decree(),
            self.last_flushed_decree()
        );
        assert!(
            self.last_flushed_decree() >= self.last_durable_decree(),
            "{}: last_flushed {} < last_durable {}",
            self.name,
            self.last_flushed_decree(),
            self.last_durable_decree()
        );
    }

    /// Structural invariant check used by tests after every public
    /// operation.
    pub fn verify_invariants(&self) -> ReplicaResult<()> {
        self.prepare_list.validate()?;
        let (durable, flushed, committed, prepared) = (
            self.last_durable_decree(),
            self.last_flushed_decree(),
            self.last_committed_decree(),
            self.max_prepared_decree(),
        );
        if durable > flushed || flushed > committed || committed > prepared {
            return Err(ReplicaError::InconsistentState {
                reason: format!(
                    "durability prefix violated: {durable} / {flushed} / {committed} / {prepared}"
                ),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Allocates a mutation for `decree` under the current ballot.
    pub fn new_mutation(&self, decree: Decree) -> Mutation {
        Mutation::new(self.pid, self.config.ballot, decree)
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// Converts the replica to [`PartitionStatus::Error`] after a local
    /// fatal failure. Commit is frozen; recovery is meta-driven.
    pub fn handle_local_failure(&mut self, err: &ReplicaError) {
        error!(replica = %self.name, error = %err, "local failure, replica enters error state");
        if !matches!(self.role, RoleState::Error) {
            self.role.cleanup_for_exit();
            self.role = RoleState::Error;
        }
    }

    // ========================================================================
    // Engine queries
    // ========================================================================

    pub fn query_data_version(&self) -> u32 {
        self.engine.query_data_version()
    }

    pub fn query_manual_compact_state(&self) -> String {
        self.engine.query_compact_state()
    }

    /// Classifies the engine's compact-state string.
    pub fn get_manual_compact_status(&self) -> ManualCompactionStatus {
        ManualCompactionStatus::from_compact_state(&self.query_manual_compact_state())
    }

    pub fn on_detect_hotkey(&mut self, request: &crate::request::ClientRequest) -> HotkeyResponse {
        self.engine.on_detect_hotkey(request)
    }

    // ========================================================================
    // Learning / split progression
    // ========================================================================

    /// Updates learning progress on a potential secondary. Once the
    /// learner may apply, the skipped committed prefix is replayed from
    /// the private log.
    pub fn update_learning_status(
        &mut self,
        learning_status: strata_types::LearningStatus,
    ) -> ReplicaResult<()> {
        let can_apply = match &mut self.role {
            RoleState::PotentialSecondary(ctx) => {
                ctx.learning_status = learning_status;
                ctx.can_apply()
            }
            _ => {
                return Err(ReplicaError::InvalidState {
                    status: self.status(),
                })
            }
        };
        if can_apply {
            self.catch_up_with_private_log();
        }
        Ok(())
    }

    /// Marks the split child caught up with the parent's committed
    /// prefix; pending commits replay from the private log.
    pub fn notify_split_caught_up(&mut self) -> ReplicaResult<()> {
        match &mut self.role {
            RoleState::Split(ctx) => ctx.is_caught_up = true,
            _ => {
                return Err(ReplicaError::InvalidState {
                    status: self.status(),
                })
            }
        }
        self.catch_up_with_private_log();
        Ok(())
    }

    // ========================================================================
    // Split / migration bookkeeping
    // ========================================================================

    /// Bumps the partition version; requests routed with the previous
    /// version now predate the split.
    pub fn bump_partition_version(&mut self) {
        self.partition_version += 1;
    }

    pub fn disk_migration_status(&self) -> DiskMigrationStatus {
        self.background.disk_migration
    }

    pub fn set_disk_migration_status(&mut self, status: DiskMigrationStatus) {
        assert!(
            status >= self.background.disk_migration,
            "disk migration status may not regress"
        );
        self.background.disk_migration = status;
    }

    /// Refreshes the private-log size gauge.
    pub fn update_log_size_metric(&self) {
        if let Some(log) = &self.log {
            metrics::set_private_log_size(self.pid, log.size_bytes());
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Tears the replica down. Idempotent; never called concurrently
    /// with itself (single-threaded executor).
    ///
    /// # Panics
    ///
    /// Panics unless the role is Inactive or Error, or disk migration
    /// has reached at least `Moved`. A close in any other state is a
    /// stub bug.
    pub fn close(&mut self, now_ms: u64) {
        if self.closed {
            return;
        }
        assert!(
            matches!(
                self.status(),
                PartitionStatus::Inactive | PartitionStatus::Error
            ) || self.background.disk_migration >= DiskMigrationStatus::Moved,
            "{}: invalid state for close (status={}, migration={:?})",
            self.name,
            self.status(),
            self.background.disk_migration
        );

        let start_ms = now_ms;

        self.background.checkpoint.cancel();
        self.engine.cancel_background_work(true);
        self.background.tracker.cancel_outstanding_tasks();

        // Clear preparing mutations; no further commit progress happens.
        self.prepare_list.clear_pending();
        if let Some(ctx) = self.role.as_primary_mut() {
            ctx.cleanup();
        }

        // Error-state contexts may still hold transients; clean them here
        // so the assertion below is uniform.
        if matches!(self.status(), PartitionStatus::Error) {
            self.role.cleanup_for_exit();
        }
        assert!(
            self.role.is_cleaned(),
            "{}: role context not cleaned at close",
            self.name
        );

        if let Some(mut log) = self.log.take() {
            log.close();
        }

        if let Err(err) = self.engine.close(false) {
            warn!(replica = %self.name, error = %err, "close app failed");
        }

        if self.background.disk_migration == DiskMigrationStatus::Moved {
            self.background.disk_migration = DiskMigrationStatus::Closed;
            debug!(replica = %self.name, "disk migration marked closed");
        }

        // Managers may have ongoing tasks; release them after everything
        // above has drained, in a fixed order.
        self.background.release_managers();

        self.closed = true;
        info!(
            replica = %self.name,
            time_used_ms = now_ms.saturating_sub(start_ms),
            "replica closed"
        );
    }
}

/// Builds the dense code-indexed latency histogram table for a replica.
///
/// Replicas serving the same table share the underlying series; only
/// codes registered as storage requests get one.
fn init_table_level_latency_counters(app_name: &str) -> Vec<Option<Histogram>> {
    let Some(max_code) = max_rpc_code() else {
        return Vec::new();
    };
    let mut histograms = Vec::with_capacity(max_code.as_index() + 1);
    for code in 0..=max_code.as_u32() {
        let code = RpcCode::from_u32(code);
        if is_storage_rpc_code(code) {
            let histogram = metrics::ReplicaMetrics::global()
                .table_level_latency_ns
                .with_label_values(&[app_name, rpc_code_name(code)]);
            histograms.push(Some(histogram));
        } else {
            histograms.push(None);
        }
    }
    histograms
}

impl ReplicaCore {
    /// The latency histogram for `code`, if one was initialized.
    pub(crate) fn latency_histogram(&self, code: RpcCode) -> Option<&Histogram> {
        self.latency_histograms
            .get(code.as_index())
            .and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{storage_codes, test_replica, TestReplicaBuilder};
    use strata_types::LearningStatus;

    #[test]
    fn new_replica_starts_inactive() {
        let replica = test_replica();
        assert_eq!(replica.status(), PartitionStatus::Inactive);
        assert_eq!(replica.ballot(), Ballot::ZERO);
        assert_eq!(replica.last_committed_decree(), Decree::ZERO);
        assert_eq!(replica.max_prepared_decree(), Decree::ZERO);
        replica.verify_invariants().unwrap();
    }

    #[test]
    fn restore_seeds_force_restore_env() {
        let replica = TestReplicaBuilder::new().need_restore(true).build();
        assert!(replica.need_restore());
        assert_eq!(replica.env(env_keys::FORCE_RESTORE), Some("true"));

        let plain = test_replica();
        assert!(!plain.need_restore());
    }

    #[test]
    fn latency_histograms_cover_storage_codes_only() {
        let codes = storage_codes();
        let replica = test_replica();
        assert!(replica.latency_histogram(codes.read).is_some());
        assert!(replica.latency_histogram(codes.write).is_some());
        assert!(replica.latency_histogram(codes.admin).is_none());
    }

    #[test]
    fn last_prepared_decree_walks_logged_prefix() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        // Prepare three writes; all logged by the write path.
        for _ in 0..3 {
            replica.test_write(b"k=v");
        }
        assert_eq!(replica.last_prepared_decree(), Decree::new(3));

        // An unlogged mutation ends the walk.
        let mu = replica.new_mutation(Decree::new(4));
        replica.prepare_list_mut().prepare(mu).unwrap();
        assert_eq!(replica.last_prepared_decree(), Decree::new(3));
    }

    #[test]
    fn close_is_idempotent_on_inactive() {
        let mut replica = test_replica();
        replica.close(10);
        assert!(replica.is_closed());
        replica.close(20); // no-op
        assert!(replica.is_closed());
    }

    #[test]
    #[should_panic(expected = "invalid state for close")]
    fn close_from_serving_role_is_fatal() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        replica.close(0);
    }

    #[test]
    fn close_allowed_after_disk_migration_moved() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        replica.set_disk_migration_status(DiskMigrationStatus::Moving);
        replica.set_disk_migration_status(DiskMigrationStatus::Moved);
        replica.close(5);
        assert!(replica.is_closed());
        assert_eq!(
            replica.disk_migration_status(),
            DiskMigrationStatus::Closed
        );
    }

    #[test]
    #[should_panic(expected = "may not regress")]
    fn disk_migration_status_cannot_regress() {
        let mut replica = test_replica();
        replica.set_disk_migration_status(DiskMigrationStatus::Moved);
        replica.set_disk_migration_status(DiskMigrationStatus::Moving);
    }

    #[test]
    fn close_reports_engine_error_without_propagating() {
        let mut replica = test_replica();
        replica.test_engine().fail_close();
        replica.close(0);
        assert!(replica.is_closed());
        assert!(replica.test_engine().is_closed());
        assert!(replica.test_engine().cancel_background_calls() >= 1);
    }

    #[test]
    fn close_releases_managers_and_log() {
        let mut replica = test_replica();
        replica.close(0);
        assert!(replica.background.duplication.is_none());
        assert!(replica.background.backup.is_none());
        assert!(replica.background.bulk_load.is_none());
        assert!(replica.background.split.is_none());
        assert!(replica.log.is_none());
    }

    #[test]
    fn leaving_learner_cancels_learning() {
        let mut replica = TestReplicaBuilder::new().build_learner(LearningStatus::WithPrepare);
        assert_eq!(replica.status(), PartitionStatus::PotentialSecondary);
        let config = replica.next_config(PartitionStatus::Inactive);
        replica.update_configuration(config, 0).unwrap();
        assert_eq!(replica.status(), PartitionStatus::Inactive);
        assert!(replica.role().is_cleaned());
    }
}
