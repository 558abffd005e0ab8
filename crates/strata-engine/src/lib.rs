//! # strata-engine: in-memory storage engine
//!
//! A reference implementation of the replica core's [`StorageEngine`]
//! seam. It keeps a sorted key-value map, tracks the three durability
//! watermarks (`committed`, `flushed`, `durable`), and reports manual
//! compaction state in the same free-form strings the production engine
//! emits.
//!
//! Payload format, shared with the test tooling:
//! - writes: `key=value` upserts, a bare `key` deletes
//! - reads: the payload is the key; the reply is the value (empty if
//!   absent)
//!
//! [`StorageEngine`]: strata_replica::StorageEngine

mod memory;

pub use memory::MemoryEngine;
