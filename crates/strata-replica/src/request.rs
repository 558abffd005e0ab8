//! Client request model and the process-wide RPC code registry.
//!
//! RPC codes are small stable integers allocated once per process, in
//! registration order, from the range `[0, max_rpc_code()]`. Codes for
//! storage requests (reads/writes served by the engine) are additionally
//! recorded in a storage-code set; only those codes get table-level
//! latency counters.

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::sync::{OnceLock, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_types::PartitionStatus;

use crate::ReplicaError;

// ============================================================================
// RPC Code Registry
// ============================================================================

/// Handle to a registered RPC code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RpcCode(u32);

impl RpcCode {
    /// Rebuilds a handle from its stable integer value.
    pub fn from_u32(code: u32) -> Self {
        Self(code)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", rpc_code_name(*self))
    }
}

struct CodeRegistry {
    /// Code -> name, dense; a code's index is its stable integer value.
    names: Vec<&'static str>,
    /// Codes registered as storage requests.
    storage: HashSet<RpcCode>,
}

fn registry() -> &'static RwLock<CodeRegistry> {
    static REGISTRY: OnceLock<RwLock<CodeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        RwLock::new(CodeRegistry {
            names: Vec::new(),
            storage: HashSet::new(),
        })
    })
}

/// Registers (or looks up) an RPC code by name.
///
/// Registration is idempotent by name and thread-safe; the same name
/// always yields the same code for the life of the process.
pub fn register_rpc_code(name: &'static str) -> RpcCode {
    let reg = registry();
    {
        let guard = reg.read().expect("rpc code registry poisoned");
        if let Some(pos) = guard.names.iter().position(|n| *n == name) {
            return RpcCode(pos as u32);
        }
    }
    let mut guard = reg.write().expect("rpc code registry poisoned");
    // Re-check under the write lock; another thread may have won the race.
    if let Some(pos) = guard.names.iter().position(|n| *n == name) {
        return RpcCode(pos as u32);
    }
    guard.names.push(name);
    RpcCode((guard.names.len() - 1) as u32)
}

/// Registers an RPC code and marks it as a storage request.
pub fn register_storage_rpc_code(name: &'static str) -> RpcCode {
    let code = register_rpc_code(name);
    registry()
        .write()
        .expect("rpc code registry poisoned")
        .storage
        .insert(code);
    code
}

/// Returns the registered name of a code, or `"unknown"`.
pub fn rpc_code_name(code: RpcCode) -> &'static str {
    registry()
        .read()
        .expect("rpc code registry poisoned")
        .names
        .get(code.as_index())
        .copied()
        .unwrap_or("unknown")
}

/// The largest code allocated so far (codes occupy `[0, max]`).
pub fn max_rpc_code() -> Option<RpcCode> {
    let len = registry()
        .read()
        .expect("rpc code registry poisoned")
        .names
        .len();
    len.checked_sub(1).map(|i| RpcCode(i as u32))
}

/// True if the code was registered as a storage request.
pub fn is_storage_rpc_code(code: RpcCode) -> bool {
    registry()
        .read()
        .expect("rpc code registry poisoned")
        .storage
        .contains(&code)
}

/// Snapshot of all codes registered as storage requests.
pub fn storage_rpc_codes() -> HashSet<RpcCode> {
    registry()
        .read()
        .expect("rpc code registry poisoned")
        .storage
        .clone()
}

// ============================================================================
// Client Request / Response
// ============================================================================

/// A client read or write as seen by the replica core.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// RPC code; must be registered as a storage request.
    pub code: RpcCode,

    /// Opaque operation payload, interpreted by the storage engine.
    pub payload: Bytes,

    /// Backup requests may be served from a non-primary replica.
    pub is_backup_request: bool,

    /// Authenticated principal, consulted by the access controller.
    pub principal: String,

    /// Partition version the request was routed with; a mismatch after a
    /// split means the request predates the split.
    pub partition_version: u32,

    /// Client-observed start time, for end-to-end latency accounting.
    pub start_time_ns: u64,

    /// Whether the write can be retried safely. Non-idempotent writes
    /// are refused while duplication is enabled.
    pub idempotent: bool,
}

impl ClientRequest {
    pub fn new(code: RpcCode, payload: Bytes) -> Self {
        Self {
            code,
            payload,
            is_backup_request: false,
            principal: String::new(),
            partition_version: 0,
            start_time_ns: 0,
            idempotent: true,
        }
    }

    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    #[must_use]
    pub fn backup(mut self) -> Self {
        self.is_backup_request = true;
        self
    }

    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    #[must_use]
    pub fn with_partition_version(mut self, version: u32) -> Self {
        self.partition_version = version;
        self
    }

    #[must_use]
    pub fn with_start_time_ns(mut self, start_time_ns: u64) -> Self {
        self.start_time_ns = start_time_ns;
        self
    }
}

/// Reply to a client, carrying the partition status at the time of reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub status: PartitionStatus,
    pub result: Result<Bytes, ReplicaError>,
}

impl ClientResponse {
    pub fn ok(status: PartitionStatus, payload: Bytes) -> Self {
        Self {
            status,
            result: Ok(payload),
        }
    }

    pub fn err(status: PartitionStatus, err: ReplicaError) -> Self {
        Self {
            status,
            result: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
