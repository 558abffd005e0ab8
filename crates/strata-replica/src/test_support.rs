//! Shared fixtures for replica-core tests: a mock storage engine with
//! fault-injection hooks, and a builder that drives a fresh replica into
//! any role through real configuration updates.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::OnceLock;

use bytes::Bytes;
use strata_types::{
    AppId, AppInfo, Decree, LearningStatus, NodeId, PartitionConfig, PartitionStatus, Pid,
};

use crate::access::AccessController;
use crate::app::{HotkeyResponse, StorageEngine};
use crate::mutation::Mutation;
use crate::options::ReplicaOptions;
use crate::replica::{PrepareAck, ReplicaCore, WriteReply};
use crate::request::{register_rpc_code, register_storage_rpc_code, ClientRequest, RpcCode};
use crate::role::RoleState;
use crate::throttle::ThrottleLimit;
use crate::wal::MemoryLog;
use crate::{ReplicaError, ReplicaResult};

// ============================================================================
// RPC codes used by tests
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct StorageCodes {
    pub read: RpcCode,
    pub write: RpcCode,
    pub admin: RpcCode,
}

/// Registers (once) and returns the codes the tests speak.
pub(crate) fn storage_codes() -> StorageCodes {
    static CODES: OnceLock<StorageCodes> = OnceLock::new();
    *CODES.get_or_init(|| StorageCodes {
        read: register_storage_rpc_code("RPC_STRATA_GET"),
        write: register_storage_rpc_code("RPC_STRATA_PUT"),
        admin: register_rpc_code("RPC_STRATA_ADMIN"),
    })
}

// ============================================================================
// Mock storage engine
// ============================================================================

#[derive(Debug, Default)]
struct MockEngineState {
    last_committed: Decree,
    last_flushed: Decree,
    last_durable: Decree,
    applied: Vec<Decree>,
    request_count: usize,
    read_payload: Bytes,
    compact_state: String,
    fail_next_apply: Option<ReplicaError>,
    fail_next_request: Option<ReplicaError>,
    fail_close: bool,
    cancel_background_calls: usize,
    closed: bool,
}

/// Observer handle onto the mock engine, usable while the replica owns
/// the engine itself.
#[derive(Clone, Default)]
pub(crate) struct EngineProbe(Rc<RefCell<MockEngineState>>);

impl EngineProbe {
    pub fn request_count(&self) -> usize {
        self.0.borrow().request_count
    }

    pub fn applied_decrees(&self) -> Vec<Decree> {
        self.0.borrow().applied.clone()
    }

    pub fn last_committed(&self) -> Decree {
        self.0.borrow().last_committed
    }

    pub fn last_durable(&self) -> Decree {
        self.0.borrow().last_durable
    }

    pub fn cancel_background_calls(&self) -> usize {
        self.0.borrow().cancel_background_calls
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub fn fail_next_apply(&self, err: ReplicaError) {
        self.0.borrow_mut().fail_next_apply = Some(err);
    }

    pub fn fail_next_request(&self, err: ReplicaError) {
        self.0.borrow_mut().fail_next_request = Some(err);
    }

    pub fn fail_close(&self) {
        self.0.borrow_mut().fail_close = true;
    }

    pub fn set_compact_state(&self, state: &str) {
        self.0.borrow_mut().compact_state = state.to_string();
    }
}

struct MockEngine(Rc<RefCell<MockEngineState>>);

impl StorageEngine for MockEngine {
    fn on_request(&mut self, _request: &ClientRequest) -> ReplicaResult<Bytes> {
        let mut state = self.0.borrow_mut();
        state.request_count += 1;
        if let Some(err) = state.fail_next_request.take() {
            return Err(err);
        }
        Ok(state.read_payload.clone())
    }

    fn apply_mutation(&mut self, mutation: &Mutation) -> ReplicaResult<()> {
        let mut state = self.0.borrow_mut();
        if let Some(err) = state.fail_next_apply.take() {
            return Err(err);
        }
        assert_eq!(
            state.last_committed.next(),
            mutation.decree,
            "mock engine asked to apply out of order"
        );
        state.last_committed = mutation.decree;
        state.applied.push(mutation.decree);
        Ok(())
    }

    fn last_committed_decree(&self) -> Decree {
        self.0.borrow().last_committed
    }

    fn last_flushed_decree(&self) -> Decree {
        self.0.borrow().last_flushed
    }

    fn last_durable_decree(&self) -> Decree {
        self.0.borrow().last_durable
    }

    fn generate_checkpoint(&mut self) -> ReplicaResult<Decree> {
        let mut state = self.0.borrow_mut();
        state.last_flushed = state.last_committed;
        state.last_durable = state.last_committed;
        Ok(state.last_durable)
    }

    fn query_data_version(&self) -> u32 {
        1
    }

    fn query_compact_state(&self) -> String {
        self.0.borrow().compact_state.clone()
    }

    fn on_detect_hotkey(&mut self, _request: &ClientRequest) -> HotkeyResponse {
        HotkeyResponse {
            err: None,
            hotkey: Some(Bytes::from_static(b"hot")),
        }
    }

    fn cancel_background_work(&mut self, _wait: bool) {
        self.0.borrow_mut().cancel_background_calls += 1;
    }

    fn close(&mut self, _clear_state: bool) -> ReplicaResult<()> {
        let mut state = self.0.borrow_mut();
        state.closed = true;
        if state.fail_close {
            return Err(ReplicaError::Engine {
                reason: "injected close failure".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Deny-all access controller
// ============================================================================

struct DenyAllController;

impl AccessController for DenyAllController {
    fn allowed(&self, _request: &ClientRequest) -> bool {
        false
    }
}

// ============================================================================
// Test replica
// ============================================================================

/// A replica plus its engine probe; derefs to [`ReplicaCore`].
pub(crate) struct TestReplica {
    core: ReplicaCore,
    engine: EngineProbe,
}

impl Deref for TestReplica {
    type Target = ReplicaCore;
    fn deref(&self) -> &ReplicaCore {
        &self.core
    }
}

impl DerefMut for TestReplica {
    fn deref_mut(&mut self) -> &mut ReplicaCore {
        &mut self.core
    }
}

impl TestReplica {
    pub fn test_engine(&self) -> &EngineProbe {
        &self.engine
    }

    /// The next configuration for this partition: ballot bumped, the
    /// usual three-member group, and the requested role for this node.
    pub fn next_config(&self, status: PartitionStatus) -> PartitionConfig {
        let node = self.core.node_id();
        PartitionConfig {
            pid: self.core.pid(),
            ballot: self.core.ballot().next(),
            status,
            primary: Some(node),
            secondaries: vec![
                NodeId::new(node.as_u64() + 100),
                NodeId::new(node.as_u64() + 101),
            ],
        }
    }

    /// Drives a full write through prepare and quorum ack; returns the
    /// committed decree.
    pub fn test_write(&mut self, payload: &[u8]) -> Decree {
        let (decree, prepares) = self.prepared_write(payload);
        let ballot = self.core.ballot();
        for prepare in prepares {
            self.core.on_prepare_ack(
                &PrepareAck {
                    node: prepare.target,
                    ballot,
                    decree,
                    err: None,
                },
                0,
            );
        }
        assert!(self.core.last_committed_decree() >= decree);
        decree
    }

    /// Prepares a write without acknowledging it.
    pub fn test_write_no_ack(&mut self, payload: &[u8]) -> Decree {
        self.prepared_write(payload).0
    }

    fn prepared_write(&mut self, payload: &[u8]) -> (Decree, Vec<crate::replica::PrepareMsg>) {
        let request = ClientRequest::new(storage_codes().write, Bytes::copy_from_slice(payload))
            .with_partition_version(self.core.partition_version());
        match self.core.on_client_write(request, 0) {
            WriteReply::Prepared { decree, output } => (decree, output.prepares),
            other => panic!("write not prepared: {other:?}"),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub(crate) struct TestReplicaBuilder {
    node: u64,
    app_name: &'static str,
    need_restore: bool,
    duplicating: bool,
    deny_all: bool,
    options: ReplicaOptions,
}

impl TestReplicaBuilder {
    pub fn new() -> Self {
        Self {
            node: 1,
            app_name: "test_table",
            need_restore: false,
            duplicating: false,
            deny_all: false,
            options: ReplicaOptions::testing(),
        }
    }

    pub fn app_name(mut self, app_name: &'static str) -> Self {
        self.app_name = app_name;
        self
    }

    pub fn node(mut self, node: u64) -> Self {
        self.node = node;
        self
    }

    pub fn need_restore(mut self, need_restore: bool) -> Self {
        self.need_restore = need_restore;
        self
    }

    pub fn duplicating(mut self, duplicating: bool) -> Self {
        self.duplicating = duplicating;
        self
    }

    pub fn deny_all_access(mut self) -> Self {
        self.deny_all = true;
        self
    }

    pub fn window_capacity(mut self, capacity: usize) -> Self {
        self.options.max_mutation_count_in_prepare_list = capacity;
        self
    }

    pub fn read_throttle(mut self, limit: ThrottleLimit) -> Self {
        self.options.read_throttle = Some(limit);
        self
    }

    pub fn write_throttle(mut self, limit: ThrottleLimit) -> Self {
        self.options.write_throttle = Some(limit);
        self
    }

    pub fn checkpoint_interval_ms(mut self, interval: u64) -> Self {
        self.options.checkpoint_max_interval_ms = interval;
        self
    }

    pub fn build(self) -> TestReplica {
        // Codes must exist before the replica sizes its histogram table.
        let _ = storage_codes();

        let probe = EngineProbe::default();
        probe
            .0
            .borrow_mut()
            .read_payload = Bytes::from_static(b"value");
        probe.0.borrow_mut().compact_state = "last finish at [-]".to_string();

        let mut app_info = AppInfo::new(AppId::new(1), self.app_name, 8);
        app_info.duplicating = self.duplicating;

        let mut core = ReplicaCore::new(
            NodeId::new(self.node),
            Pid::new(AppId::new(1), 0),
            app_info,
            "/data/replica/1.0",
            self.need_restore,
            self.options,
            Box::new(MockEngine(Rc::clone(&probe.0))),
            Box::new(MemoryLog::new()),
            0,
        );
        if self.deny_all {
            core.set_access_controller(Box::new(DenyAllController));
        }
        TestReplica {
            core,
            engine: probe,
        }
    }

    pub fn build_primary(self) -> TestReplica {
        let mut replica = self.build();
        let config = replica.next_config(PartitionStatus::Primary);
        replica.update_configuration(config, 0).unwrap();
        replica
    }

    pub fn build_secondary(self) -> TestReplica {
        let mut replica = self.build();
        let mut config = replica.next_config(PartitionStatus::Secondary);
        config.primary = Some(NodeId::new(1000));
        replica.update_configuration(config, 0).unwrap();
        replica
    }

    pub fn build_learner(self, learning_status: LearningStatus) -> TestReplica {
        let mut replica = self.build();
        let mut config = replica.next_config(PartitionStatus::PotentialSecondary);
        config.primary = Some(NodeId::new(1000));
        replica.update_configuration(config, 0).unwrap();
        if let RoleState::PotentialSecondary(ctx) = replica.role_mut() {
            ctx.learning_status = learning_status;
        }
        replica
    }
}

/// A fresh inactive replica with default options.
pub(crate) fn test_replica() -> TestReplica {
    TestReplicaBuilder::new().build()
}
