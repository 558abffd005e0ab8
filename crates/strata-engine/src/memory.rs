//! The in-memory engine.

use std::collections::BTreeMap;

use bytes::Bytes;
use strata_replica::{
    ClientRequest, HotkeyResponse, Mutation, ReplicaError, ReplicaResult, StorageEngine,
};
use strata_types::Decree;
use tracing::debug;

/// Lifecycle of a manual compaction inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CompactionPhase {
    #[default]
    Never,
    Enqueued {
        enqueue_ms: u64,
    },
    Started {
        enqueue_ms: u64,
        start_ms: u64,
    },
    Finished {
        finish_ms: u64,
        used_ms: u64,
    },
}

/// Sorted-map storage engine with watermark bookkeeping.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    data: BTreeMap<Vec<u8>, Bytes>,
    last_committed: Decree,
    last_flushed: Decree,
    last_durable: Decree,
    compaction: CompactionPhase,
    background_cancelled: bool,
    closed: bool,
    /// Test hook: the next apply fails with this reason.
    fail_next_apply: Option<String>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts from a checkpointed state, e.g. after a restore: every
    /// watermark begins at the checkpoint decree.
    pub fn from_checkpoint(decree: Decree, data: BTreeMap<Vec<u8>, Bytes>) -> Self {
        Self {
            data,
            last_committed: decree,
            last_flushed: decree,
            last_durable: decree,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Moves the flushed watermark up to the committed one, as a memtable
    /// flush would.
    pub fn flush(&mut self) {
        self.last_flushed = self.last_committed;
    }

    /// Queues a manual compaction.
    pub fn enqueue_manual_compaction(&mut self, now_ms: u64) {
        self.compaction = CompactionPhase::Enqueued { enqueue_ms: now_ms };
    }

    /// Starts the queued manual compaction.
    pub fn start_manual_compaction(&mut self, now_ms: u64) {
        if let CompactionPhase::Enqueued { enqueue_ms } = self.compaction {
            self.compaction = CompactionPhase::Started {
                enqueue_ms,
                start_ms: now_ms,
            };
        }
    }

    /// Completes the running manual compaction.
    pub fn finish_manual_compaction(&mut self, now_ms: u64) {
        if let CompactionPhase::Started { start_ms, .. } = self.compaction {
            self.compaction = CompactionPhase::Finished {
                finish_ms: now_ms,
                used_ms: now_ms.saturating_sub(start_ms),
            };
        }
    }

    /// Test hook: the next `apply_mutation` fails.
    pub fn fail_next_apply(&mut self, reason: impl Into<String>) {
        self.fail_next_apply = Some(reason.into());
    }

    fn apply_update(&mut self, payload: &[u8]) {
        match payload.iter().position(|&b| b == b'=') {
            Some(split) => {
                let key = payload[..split].to_vec();
                let value = Bytes::copy_from_slice(&payload[split + 1..]);
                self.data.insert(key, value);
            }
            None => {
                self.data.remove(payload);
            }
        }
    }
}

impl StorageEngine for MemoryEngine {
    fn on_request(&mut self, request: &ClientRequest) -> ReplicaResult<Bytes> {
        if self.closed {
            return Err(ReplicaError::Closed);
        }
        Ok(self
            .data
            .get(request.payload.as_ref())
            .cloned()
            .unwrap_or_default())
    }

    fn apply_mutation(&mut self, mutation: &Mutation) -> ReplicaResult<()> {
        if self.closed {
            return Err(ReplicaError::Closed);
        }
        if let Some(reason) = self.fail_next_apply.take() {
            return Err(ReplicaError::Engine { reason });
        }
        if mutation.decree != self.last_committed.next() {
            return Err(ReplicaError::InconsistentState {
                reason: format!(
                    "apply out of order: engine at {}, mutation {}",
                    self.last_committed, mutation.decree
                ),
            });
        }
        for update in &mutation.updates {
            self.apply_update(&update.payload);
        }
        self.last_committed = mutation.decree;
        Ok(())
    }

    fn last_committed_decree(&self) -> Decree {
        self.last_committed
    }

    fn last_flushed_decree(&self) -> Decree {
        self.last_flushed
    }

    fn last_durable_decree(&self) -> Decree {
        self.last_durable
    }

    fn generate_checkpoint(&mut self) -> ReplicaResult<Decree> {
        if self.closed {
            return Err(ReplicaError::Closed);
        }
        // A checkpoint implies a flush of everything applied so far.
        self.last_flushed = self.last_committed;
        self.last_durable = self.last_committed;
        debug!(durable = %self.last_durable, "memory engine checkpoint");
        Ok(self.last_durable)
    }

    fn query_data_version(&self) -> u32 {
        1
    }

    fn query_compact_state(&self) -> String {
        match self.compaction {
            CompactionPhase::Never => "last finish at [-]".to_string(),
            CompactionPhase::Enqueued { enqueue_ms } => {
                format!("last finish at [-], recent enqueue at [{enqueue_ms}]")
            }
            CompactionPhase::Started {
                enqueue_ms,
                start_ms,
            } => format!(
                "last finish at [-], recent enqueue at [{enqueue_ms}], recent start at [{start_ms}]"
            ),
            CompactionPhase::Finished { finish_ms, used_ms } => {
                format!("last finish at [{finish_ms}], last used {used_ms} ms")
            }
        }
    }

    fn on_detect_hotkey(&mut self, _request: &ClientRequest) -> HotkeyResponse {
        // The in-memory engine keeps no access statistics.
        HotkeyResponse {
            err: Some("hotkey detection unsupported".to_string()),
            hotkey: None,
        }
    }

    fn cancel_background_work(&mut self, _wait: bool) {
        self.background_cancelled = true;
    }

    fn close(&mut self, clear_state: bool) -> ReplicaResult<()> {
        if clear_state {
            self.data.clear();
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_replica::ManualCompactionStatus;
    use strata_types::{AppId, Ballot, Pid};

    fn mutation(decree: u64, payload: &'static [u8]) -> Mutation {
        let mut mu = Mutation::new(
            Pid::new(AppId::new(1), 0),
            Ballot::new(1),
            Decree::new(decree),
        );
        mu.add_update(
            strata_replica::RpcCode::default(),
            Bytes::from_static(payload),
            0,
        );
        mu
    }

    #[test]
    fn put_and_delete_updates() {
        let mut engine = MemoryEngine::new();
        engine.apply_mutation(&mutation(1, b"alpha=1")).unwrap();
        engine.apply_mutation(&mutation(2, b"beta=2")).unwrap();
        assert_eq!(engine.get(b"alpha"), Some(&Bytes::from_static(b"1")));
        assert_eq!(engine.len(), 2);

        engine.apply_mutation(&mutation(3, b"alpha")).unwrap();
        assert_eq!(engine.get(b"alpha"), None);
        assert_eq!(engine.last_committed_decree(), Decree::new(3));
    }

    #[test]
    fn out_of_order_apply_is_inconsistent_state() {
        let mut engine = MemoryEngine::new();
        engine.apply_mutation(&mutation(1, b"a=1")).unwrap();
        let err = engine.apply_mutation(&mutation(3, b"c=3")).unwrap_err();
        assert!(matches!(err, ReplicaError::InconsistentState { .. }));
    }

    #[test]
    fn checkpoint_lifts_watermarks() {
        let mut engine = MemoryEngine::new();
        engine.apply_mutation(&mutation(1, b"a=1")).unwrap();
        engine.apply_mutation(&mutation(2, b"b=2")).unwrap();
        assert_eq!(engine.last_durable_decree(), Decree::ZERO);

        let durable = engine.generate_checkpoint().unwrap();
        assert_eq!(durable, Decree::new(2));
        assert_eq!(engine.last_flushed_decree(), Decree::new(2));
        assert_eq!(engine.last_durable_decree(), Decree::new(2));
    }

    #[test]
    fn from_checkpoint_seeds_watermarks() {
        let mut data = BTreeMap::new();
        data.insert(b"k".to_vec(), Bytes::from_static(b"v"));
        let engine = MemoryEngine::from_checkpoint(Decree::new(7), data);
        assert_eq!(engine.last_committed_decree(), Decree::new(7));
        assert_eq!(engine.last_durable_decree(), Decree::new(7));
        assert_eq!(engine.get(b"k"), Some(&Bytes::from_static(b"v")));
    }

    #[test]
    fn compact_state_strings_match_the_classifier() {
        let mut engine = MemoryEngine::new();
        assert_eq!(
            ManualCompactionStatus::from_compact_state(&engine.query_compact_state()),
            ManualCompactionStatus::Idle
        );

        engine.enqueue_manual_compaction(171);
        assert_eq!(
            ManualCompactionStatus::from_compact_state(&engine.query_compact_state()),
            ManualCompactionStatus::Queuing
        );

        engine.start_manual_compaction(180);
        assert_eq!(
            ManualCompactionStatus::from_compact_state(&engine.query_compact_state()),
            ManualCompactionStatus::Running
        );

        engine.finish_manual_compaction(200);
        assert_eq!(
            ManualCompactionStatus::from_compact_state(&engine.query_compact_state()),
            ManualCompactionStatus::Finished
        );
    }

    #[test]
    fn injected_apply_failure_surfaces_once() {
        let mut engine = MemoryEngine::new();
        engine.fail_next_apply("disk full");
        assert!(engine.apply_mutation(&mutation(1, b"a=1")).is_err());
        engine.apply_mutation(&mutation(1, b"a=1")).unwrap();
    }

    #[test]
    fn reads_serve_stored_values() {
        let mut engine = MemoryEngine::new();
        engine.apply_mutation(&mutation(1, b"k=v")).unwrap();
        let request = ClientRequest::new(strata_replica::RpcCode::default(), Bytes::from_static(b"k"));
        assert_eq!(engine.on_request(&request).unwrap(), Bytes::from_static(b"v"));

        let missing = ClientRequest::new(strata_replica::RpcCode::default(), Bytes::from_static(b"x"));
        assert_eq!(engine.on_request(&missing).unwrap(), Bytes::new());
    }
}
