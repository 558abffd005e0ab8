//! The private write-ahead log seam.
//!
//! [`MutationLog`] is the contract to the per-partition private log. The
//! physical format and I/O live behind it; the core only needs append
//! (which assigns the offset that marks a mutation as logged), replay for
//! catch-up, and garbage collection below the durable watermark.

use strata_types::Decree;
use tracing::debug;

use crate::mutation::{LogOffset, Mutation};
use crate::{ReplicaError, ReplicaResult};

/// Contract to the private write-ahead log of one partition.
pub trait MutationLog {
    /// Appends a mutation, returning its assigned offset.
    fn append(&mut self, mutation: &Mutation) -> ReplicaResult<LogOffset>;

    /// Returns retained mutations with decree `> from`, in decree order.
    /// Used for catch-up after a checkpoint-skipped commit window.
    fn read_from(&self, from: Decree) -> Vec<Mutation>;

    /// Drops records at or below `last_durable`; they are covered by a
    /// checkpoint and will never be replayed.
    fn garbage_collect(&mut self, last_durable: Decree);

    /// Current log size in bytes (for the per-partition size gauge).
    fn size_bytes(&self) -> u64;

    fn close(&mut self);
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory mutation log.
///
/// Offsets grow monotonically with an encoded-record estimate so that
/// size accounting behaves like a file-backed log. Each record keeps the
/// mutation checksum and verifies it on replay.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Vec<(Mutation, u32)>,
    next_offset: u64,
    closed: bool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl MutationLog for MemoryLog {
    fn append(&mut self, mutation: &Mutation) -> ReplicaResult<LogOffset> {
        if self.closed {
            return Err(ReplicaError::Closed);
        }
        let offset = LogOffset::new(self.next_offset);
        // The log retains data, not client request handles.
        let mut logged = mutation.wire_clone();
        logged.log_offset = Some(offset);
        let checksum = logged.checksum();
        // Header + payload estimate, stands in for the on-disk record size.
        self.next_offset += 64 + logged.payload_size() as u64;
        self.records.push((logged, checksum));
        Ok(offset)
    }

    fn read_from(&self, from: Decree) -> Vec<Mutation> {
        let mut out: Vec<Mutation> = self
            .records
            .iter()
            .filter(|(mu, crc)| {
                assert_eq!(mu.checksum(), *crc, "corrupt log record {}", mu.name());
                mu.decree > from
            })
            .map(|(mu, _)| mu.clone())
            .collect();
        out.sort_by_key(|mu| (mu.decree, mu.ballot));
        // A decree re-prepared under a higher ballot supersedes the
        // earlier record; keep the last per decree.
        out.dedup_by(|next, prev| {
            if prev.decree == next.decree {
                *prev = next.clone();
                true
            } else {
                false
            }
        });
        out
    }

    fn garbage_collect(&mut self, last_durable: Decree) {
        let before = self.records.len();
        self.records.retain(|(mu, _)| mu.decree > last_durable);
        if self.records.len() != before {
            debug!(
                collected = before - self.records.len(),
                through = %last_durable,
                "log records garbage-collected"
            );
        }
    }

    fn size_bytes(&self) -> u64 {
        self.records
            .iter()
            .map(|(mu, _)| 64 + mu.payload_size() as u64)
            .sum()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
