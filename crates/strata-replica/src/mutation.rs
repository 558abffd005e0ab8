//! Mutations: the unit of replicated change.
//!
//! A mutation batches one or more client write updates under a single
//! `(ballot, decree)` header. It is created by the primary (or rebuilt
//! from a prepare on a secondary), appended to the private log, and
//! eventually applied to the storage engine by the commit pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_types::{Ballot, Decree, Pid};

use crate::request::{ClientRequest, RpcCode};

// ============================================================================
// Log Offset
// ============================================================================

/// Byte offset of a logged mutation within the private log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogOffset(u64);

impl LogOffset {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Write Update
// ============================================================================

/// One client write folded into a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteUpdate {
    /// Storage RPC code of the originating write.
    pub code: RpcCode,

    /// Opaque payload interpreted by the engine.
    pub payload: Bytes,

    /// Client-observed start time; the primary records
    /// `now - start_time_ns` into the table-level latency counter after
    /// the update commits.
    pub start_time_ns: u64,
}

// ============================================================================
// Request Ref
// ============================================================================

/// Handle to an originating client request, carried by a mutation until
/// its decree commits and the write can be acknowledged.
///
/// Request refs live only on the primary that admitted the write; they
/// are never transmitted in prepares nor retained by the private log.
#[derive(Debug, Clone)]
pub struct RequestRef {
    pub request: ClientRequest,
}

// ============================================================================
// Mutation
// ============================================================================

/// A pending or committed decree with its payload.
///
/// `log_offset` is `None` until the private log assigns one; only logged
/// mutations count toward [`last_prepared_decree`].
///
/// [`last_prepared_decree`]: crate::replica::ReplicaCore::last_prepared_decree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub pid: Pid,
    pub ballot: Ballot,
    pub decree: Decree,
    pub log_offset: Option<LogOffset>,
    pub updates: Vec<WriteUpdate>,

    /// Client requests answered when this decree commits. Runtime-local:
    /// excluded from the wire form and the log.
    #[serde(skip)]
    pub client_requests: Vec<RequestRef>,
}

/// Mutation identity is the logged content; runtime request refs are
/// excluded.
impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
            && self.ballot == other.ballot
            && self.decree == other.decree
            && self.log_offset == other.log_offset
            && self.updates == other.updates
    }
}

impl Eq for Mutation {}

impl Mutation {
    pub fn new(pid: Pid, ballot: Ballot, decree: Decree) -> Self {
        Self {
            pid,
            ballot,
            decree,
            log_offset: None,
            updates: Vec::new(),
            client_requests: Vec::new(),
        }
    }

    /// Folds a client write into this mutation.
    pub fn add_update(&mut self, code: RpcCode, payload: Bytes, start_time_ns: u64) {
        self.updates.push(WriteUpdate {
            code,
            payload,
            start_time_ns,
        });
    }

    /// Attaches the originating request, to be answered at commit.
    pub fn add_client_request(&mut self, request: ClientRequest) {
        self.client_requests.push(RequestRef { request });
    }

    /// Wire form of this mutation: same logged content, no runtime
    /// request handles.
    pub fn wire_clone(&self) -> Self {
        let mut wire = self.clone();
        wire.client_requests.clear();
        wire
    }

    /// True once the private log has assigned an offset.
    pub fn is_logged(&self) -> bool {
        self.log_offset.is_some()
    }

    /// Short human-readable identity, e.g. `2.7 b3 d15`.
    pub fn name(&self) -> String {
        format!("{} {} {}", self.pid, self.ballot, self.decree)
    }

    /// CRC32 over the header and update payloads, verified by the log.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.pid.app_id.as_u32().to_le_bytes());
        hasher.update(&self.pid.partition_index.to_le_bytes());
        hasher.update(&self.ballot.as_u64().to_le_bytes());
        hasher.update(&self.decree.as_u64().to_le_bytes());
        for update in &self.updates {
            hasher.update(&update.code.as_u32().to_le_bytes());
            hasher.update(&update.payload);
        }
        hasher.finalize()
    }

    /// Total payload bytes across all updates.
    pub fn payload_size(&self) -> usize {
        self.updates.iter().map(|u| u.payload.len()).sum()
    }
}
