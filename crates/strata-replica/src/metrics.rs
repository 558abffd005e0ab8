//! Prometheus metrics for replica-core events.
//!
//! One process-wide registry serves every replica. Per-partition series
//! are labeled with the partition id (`app.partition`); table-level
//! series are labeled with the table name so all replicas of a table
//! share them. Registration happens once behind a `OnceLock`;
//! `with_label_values` makes per-key acquisition thread-safe and
//! idempotent.

use std::sync::OnceLock;

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use strata_types::Pid;

/// Global metrics registry.
static METRICS: OnceLock<ReplicaMetrics> = OnceLock::new();

/// Replica metrics collection.
pub struct ReplicaMetrics {
    registry: Registry,

    /// Private log size per partition, in MB.
    pub private_log_size_mb: GaugeVec,

    /// Recent throttling outcomes per partition, by op (read/write) and
    /// action (delay/reject).
    pub throttling_events: IntCounterVec,

    /// Mutations committed per partition.
    pub commits_total: IntCounterVec,

    /// Per-table, per-RPC-code request latency in nanoseconds. Shared by
    /// every replica of the table.
    pub table_level_latency_ns: HistogramVec,

    /// Backup (stale-allowed) read requests per table.
    pub backup_requests_total: IntCounterVec,

    /// Non-idempotent writes refused while duplication is enabled.
    pub dup_disabled_non_idempotent_writes: IntCounterVec,

    /// Checkpoint bytes uploaded by cold backup, per partition.
    pub cold_backup_bytes: IntGaugeVec,
}

impl ReplicaMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let private_log_size_mb = GaugeVec::new(
            Opts::new("strata_private_log_size_mb", "Private log size in MB"),
            &["partition"],
        )
        .expect("valid metric");

        let throttling_events = IntCounterVec::new(
            Opts::new(
                "strata_throttling_events_total",
                "Read/write throttling delays and rejects",
            ),
            &["partition", "op", "action"],
        )
        .expect("valid metric");

        let commits_total = IntCounterVec::new(
            Opts::new("strata_commits_total", "Mutations committed"),
            &["partition"],
        )
        .expect("valid metric");

        let table_level_latency_ns = HistogramVec::new(
            HistogramOpts::new(
                "strata_table_level_latency_ns",
                "Per-RPC-code request latency in nanoseconds",
            )
            .buckets(vec![
                1e3, 1e4, 1e5, 5e5, 1e6, 5e6, 1e7, 5e7, 1e8, 5e8, 1e9, 5e9,
            ]),
            &["table", "code"],
        )
        .expect("valid metric");

        let backup_requests_total = IntCounterVec::new(
            Opts::new("strata_backup_requests_total", "Backup read requests"),
            &["table"],
        )
        .expect("valid metric");

        let dup_disabled_non_idempotent_writes = IntCounterVec::new(
            Opts::new(
                "strata_dup_disabled_non_idempotent_writes_total",
                "Non-idempotent writes refused under duplication",
            ),
            &["table"],
        )
        .expect("valid metric");

        let cold_backup_bytes = IntGaugeVec::new(
            Opts::new(
                "strata_cold_backup_bytes",
                "Checkpoint bytes accounted by cold backup",
            ),
            &["partition"],
        )
        .expect("valid metric");

        registry
            .register(Box::new(private_log_size_mb.clone()))
            .expect("register metric");
        registry
            .register(Box::new(throttling_events.clone()))
            .expect("register metric");
        registry
            .register(Box::new(commits_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(table_level_latency_ns.clone()))
            .expect("register metric");
        registry
            .register(Box::new(backup_requests_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(dup_disabled_non_idempotent_writes.clone()))
            .expect("register metric");
        registry
            .register(Box::new(cold_backup_bytes.clone()))
            .expect("register metric");

        Self {
            registry,
            private_log_size_mb,
            throttling_events,
            commits_total,
            table_level_latency_ns,
            backup_requests_total,
            dup_disabled_non_idempotent_writes,
            cold_backup_bytes,
        }
    }

    /// Returns the global metrics instance.
    pub fn global() -> &'static ReplicaMetrics {
        METRICS.get_or_init(ReplicaMetrics::new)
    }

    /// Renders metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| format!("# Error encoding metrics: {e}\n"))
    }
}

/// Records a throttling delay or reject for a partition.
pub fn record_throttling_event(pid: Pid, op: &str, action: &str) {
    ReplicaMetrics::global()
        .throttling_events
        .with_label_values(&[&pid.to_string(), op, action])
        .inc();
}

/// Records a committed mutation.
pub fn record_commit(pid: Pid) {
    ReplicaMetrics::global()
        .commits_total
        .with_label_values(&[&pid.to_string()])
        .inc();
}

/// Records a backup read request against a table.
pub fn record_backup_request(table: &str) {
    ReplicaMetrics::global()
        .backup_requests_total
        .with_label_values(&[table])
        .inc();
}

/// Records a non-idempotent write refused under duplication.
pub fn record_dup_disabled_non_idempotent_write(table: &str) {
    ReplicaMetrics::global()
        .dup_disabled_non_idempotent_writes
        .with_label_values(&[table])
        .inc();
}

/// Updates the private-log size gauge for a partition.
pub fn set_private_log_size(pid: Pid, bytes: u64) {
    #[allow(clippy::cast_precision_loss)]
    ReplicaMetrics::global()
        .private_log_size_mb
        .with_label_values(&[&pid.to_string()])
        .set(bytes as f64 / (1024.0 * 1024.0));
}

/// Accounts checkpoint bytes uploaded by cold backup.
pub fn set_cold_backup_bytes(pid: Pid, bytes: i64) {
    ReplicaMetrics::global()
        .cold_backup_bytes
        .with_label_values(&[&pid.to_string()])
        .set(bytes);
}
