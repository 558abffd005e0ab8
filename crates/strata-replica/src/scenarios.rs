//! End-to-end scenarios driving a replica through real role and commit
//! flows with the mock engine's fault hooks.

use bytes::Bytes;
use strata_types::{Decree, PartitionStatus};

use crate::replica::{PrepareMsg, WriteReply};
use crate::request::ClientRequest;
use crate::test_support::{storage_codes, TestReplicaBuilder};
use crate::ReplicaError;

fn prepare_msg(replica: &crate::test_support::TestReplica, decree: u64, payload: &[u8]) -> PrepareMsg {
    let mut mutation = replica.new_mutation(Decree::new(decree));
    mutation.add_update(storage_codes().write, Bytes::copy_from_slice(payload), 0);
    PrepareMsg {
        target: replica.node_id(),
        ballot: replica.ballot(),
        mutation,
        last_committed: Decree::new(decree.saturating_sub(1)),
    }
}

#[test]
fn secondary_skips_apply_during_checkpoint_and_catches_up() {
    let mut replica = TestReplicaBuilder::new().node(2).build_secondary();

    // One mutation applies normally.
    let msg = prepare_msg(&replica, 1, b"a=1");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    // Committed hint of the next prepare advances it.
    let msg = prepare_msg(&replica, 2, b"b=2");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);

    // Checkpoint starts; the commit for decree 2 is skipped.
    replica.on_checkpoint_started();
    let msg = prepare_msg(&replica, 3, b"c=3");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    assert_eq!(replica.last_committed_decree(), Decree::new(2));
    // The engine did not see decree 2, the prepare list retains it, and
    // the log kept every record.
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);
    assert!(replica.prepare_list().get(Decree::new(2)).is_some());
    replica.verify_invariants().unwrap();

    // Post-checkpoint catch-up replays the skipped suffix from the log.
    replica.on_checkpoint_completed();
    assert_eq!(
        replica.test_engine().applied_decrees(),
        vec![Decree::new(1), Decree::new(2)]
    );
    assert_eq!(replica.test_engine().last_committed(), Decree::new(2));
    replica.verify_invariants().unwrap();
}

#[test]
fn fatal_apply_error_freezes_replica_and_unblocks_close() {
    let mut replica = TestReplicaBuilder::new().build_primary();
    replica.test_write(b"a=1");

    replica.test_engine().fail_next_apply(ReplicaError::Engine {
        reason: "io error".to_string(),
    });
    let decree = replica.test_write_no_ack(b"b=2");
    let prepares_target = replica.config().secondaries[0];
    let ballot = replica.ballot();
    replica.on_prepare_ack(
        &crate::replica::PrepareAck {
            node: prepares_target,
            ballot,
            decree,
            err: None,
        },
        0,
    );

    // The failed apply converted the replica to error.
    assert_eq!(replica.status(), PartitionStatus::Error);

    // Subsequent commits are dropped.
    let applied_before = replica.test_engine().applied_decrees().len();
    let mu = {
        let mut mutation = replica.new_mutation(Decree::new(3));
        mutation.add_update(storage_codes().write, Bytes::from_static(b"c=3"), 0);
        mutation
    };
    replica.execute_mutation(&mu, 0);
    assert_eq!(replica.test_engine().applied_decrees().len(), applied_before);

    // Close precondition is now satisfied.
    replica.close(0);
    assert!(replica.is_closed());
    assert!(replica.test_engine().is_closed());
}

#[test]
fn applies_are_in_order_and_at_most_once() {
    let mut replica = TestReplicaBuilder::new().build_primary();
    for i in 0..5u64 {
        replica.test_write(format!("k{i}=v").as_bytes());
    }
    let applied = replica.test_engine().applied_decrees();
    let expected: Vec<Decree> = (1..=5).map(Decree::new).collect();
    assert_eq!(applied, expected);
}

#[test]
fn reexecuting_a_committed_decree_is_a_noop() {
    let mut replica = TestReplicaBuilder::new().build_primary();
    let decree = replica.test_write(b"a=1");

    let mut mutation = replica.new_mutation(decree);
    mutation.add_update(storage_codes().write, Bytes::from_static(b"a=1"), 0);
    replica.execute_mutation(&mutation, 0);

    assert_eq!(replica.test_engine().applied_decrees(), vec![decree]);
    replica.verify_invariants().unwrap();
}

#[test]
fn learner_applies_only_after_learning_succeeds() {
    let mut replica = TestReplicaBuilder::new()
        .node(2)
        .build_learner(strata_types::LearningStatus::WithPrepare);

    let msg = prepare_msg(&replica, 1, b"a=1");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    let msg = prepare_msg(&replica, 2, b"b=2");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    // Learning still in progress: commits skipped, nothing applied.
    assert!(replica.test_engine().applied_decrees().is_empty());

    replica
        .update_learning_status(strata_types::LearningStatus::Succeeded)
        .unwrap();
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);
    replica.verify_invariants().unwrap();
}

#[test]
fn split_child_applies_only_when_caught_up() {
    let mut replica = TestReplicaBuilder::new().node(2).build_secondary();
    let config = replica.next_config(PartitionStatus::PartitionSplit);
    replica.update_configuration(config, 0).unwrap();
    assert_eq!(replica.status(), PartitionStatus::PartitionSplit);

    let msg = prepare_msg(&replica, 1, b"a=1");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    let msg = prepare_msg(&replica, 2, b"b=2");
    let ack = replica.on_prepare(&msg, 0);
    assert!(ack.err.is_none());
    assert!(replica.test_engine().applied_decrees().is_empty());

    replica.notify_split_caught_up().unwrap();
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);
}

#[test]
fn checkpoint_timer_drives_checkpoint_and_log_gc() {
    let mut replica = TestReplicaBuilder::new()
        .checkpoint_interval_ms(1_000)
        .build_primary();
    for i in 0..3u64 {
        replica.test_write(format!("k{i}=v").as_bytes());
    }
    assert_eq!(replica.last_durable_decree(), Decree::ZERO);

    // Before the jittered trigger nothing happens.
    assert!(!replica.on_checkpoint_timer(0));

    // At or past the full interval the trigger has certainly fired.
    assert!(replica.on_checkpoint_timer(1_000));
    assert_eq!(replica.last_durable_decree(), Decree::new(3));
    assert_eq!(replica.test_engine().last_durable(), Decree::new(3));
    replica.verify_invariants().unwrap();

    // The timer rearms into [now + max/2, now + max].
    let next = replica.background.checkpoint.next_trigger_ms();
    assert!(next >= 1_500 && next <= 2_000);
}

#[test]
fn queued_write_drains_after_commit_frees_window() {
    let mut replica = TestReplicaBuilder::new().window_capacity(1).build_primary();
    let d1 = replica.test_write_no_ack(b"a=1");
    let WriteReply::Queued = replica.on_client_write(
        ClientRequest::new(storage_codes().write, Bytes::from_static(b"b=2")),
        0,
    ) else {
        panic!("expected queued");
    };

    // Quorum ack for the first write commits it (answering its client)
    // and drains the queue into a fresh prepare.
    let target = replica.config().secondaries[0];
    let ballot = replica.ballot();
    let commit = replica.on_prepare_ack(
        &crate::replica::PrepareAck {
            node: target,
            ballot,
            decree: d1,
            err: None,
        },
        0,
    );
    assert_eq!(replica.last_committed_decree(), d1);
    assert_eq!(commit.responses.len(), 1, "committed write answered");
    assert!(commit.responses[0].response.is_ok());
    assert_eq!(commit.prepares.len(), 2, "queued write re-prepared to group");
    assert_eq!(commit.prepares[0].mutation.decree, d1.next());
    assert!(replica.role().as_primary().unwrap().write_queue.is_empty());
    replica.verify_invariants().unwrap();
}

#[test]
fn fatal_read_error_converts_replica() {
    let mut replica = TestReplicaBuilder::new().build_primary();
    replica.test_engine().fail_next_request(ReplicaError::Engine {
        reason: "corrupt sst".to_string(),
    });
    let request = ClientRequest::new(storage_codes().read, Bytes::from_static(b"k"));
    let reply = replica.on_client_read(&request, false, 0);
    let crate::replica::ReadReply::Response(resp) = reply else {
        panic!("expected response");
    };
    assert!(matches!(resp.result, Err(ReplicaError::Engine { .. })));
    assert_eq!(replica.status(), PartitionStatus::Error);
}

#[test]
fn compaction_status_tracks_engine_state_string() {
    use crate::app::ManualCompactionStatus;

    let replica = TestReplicaBuilder::new().build();
    assert_eq!(
        replica.get_manual_compact_status(),
        ManualCompactionStatus::Idle
    );

    replica
        .test_engine()
        .set_compact_state("last finish at [-], recent enqueue at [171]");
    assert_eq!(
        replica.get_manual_compact_status(),
        ManualCompactionStatus::Queuing
    );

    replica
        .test_engine()
        .set_compact_state("last finish at [-], recent enqueue at [171], recent start at [180]");
    assert_eq!(
        replica.get_manual_compact_status(),
        ManualCompactionStatus::Running
    );

    replica
        .test_engine()
        .set_compact_state("last finish at [200], last used 2100 ms");
    assert_eq!(
        replica.get_manual_compact_status(),
        ManualCompactionStatus::Finished
    );
}

#[test]
fn inactive_commit_applies_only_contiguous_decrees() {
    let mut replica = TestReplicaBuilder::new().build();
    assert_eq!(replica.status(), PartitionStatus::Inactive);

    // Contiguous decree applies even while inactive.
    let mut mu1 = replica.new_mutation(Decree::new(1));
    mu1.add_update(storage_codes().write, Bytes::from_static(b"a=1"), 0);
    replica.prepare_list_mut().prepare(mu1.clone()).unwrap();
    replica.advance_committed_to(Decree::new(1), 0);
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);

    // A gap is skipped silently; the learner replays it later.
    let mut mu3 = replica.new_mutation(Decree::new(3));
    mu3.add_update(storage_codes().write, Bytes::from_static(b"c=3"), 0);
    replica.execute_mutation(&mu3, 0);
    assert_eq!(replica.test_engine().applied_decrees(), vec![Decree::new(1)]);
    assert_eq!(replica.status(), PartitionStatus::Inactive);
}
