//! Meta-driven configuration installation and role transitions.

use strata_types::PartitionConfig;
use tracing::{info, warn};

use crate::role::{role_for_config, RoleState};
use crate::{ReplicaError, ReplicaResult};

use super::ReplicaCore;

impl ReplicaCore {
    /// Atomically installs a configuration delivered by meta.
    ///
    /// The ballot may never decrease; a same-ballot update refreshes
    /// membership without a role transition. A role change runs the
    /// outgoing role's exit action (emptying the primary write queue,
    /// cancelling learning) before the new role's state is built.
    pub fn update_configuration(
        &mut self,
        new_config: PartitionConfig,
        now_ms: u64,
    ) -> ReplicaResult<()> {
        if new_config.pid != self.pid() {
            return Err(ReplicaError::ObjectNotFound);
        }
        if self.is_closed() {
            return Err(ReplicaError::Closed);
        }
        if new_config.ballot < self.ballot() {
            warn!(
                replica = %self.name(),
                current = %self.ballot(),
                proposed = %new_config.ballot,
                "configuration with stale ballot rejected"
            );
            return Err(ReplicaError::ballot_regression(
                self.ballot(),
                new_config.ballot,
            ));
        }

        let old_status = self.status();
        let new_status = new_config.status;

        if old_status == new_status {
            // Membership or ballot refresh within the same role.
            if let Some(ctx) = self.role_mut().as_primary_mut() {
                ctx.membership = new_config.clone();
            }
            self.install_config(new_config, now_ms);
            return Ok(());
        }

        if !self.role().can_transition_to(new_status) {
            return Err(ReplicaError::InvalidState { status: old_status });
        }

        self.role_mut().cleanup_for_exit();
        let max_prepared = self.max_prepared_decree();
        let new_role = role_for_config(&new_config, max_prepared);

        if matches!(new_role, RoleState::Error) {
            // Entering the error state freezes commit and unblocks the
            // close preconditions.
            info!(replica = %self.name(), "configured into error state");
        }

        info!(
            replica = %self.name(),
            from = %old_status,
            to = %new_status,
            ballot = %new_config.ballot,
            "role transition"
        );

        self.set_role(new_role);
        self.install_config(new_config, now_ms);
        Ok(())
    }

    fn install_config(&mut self, new_config: PartitionConfig, now_ms: u64) {
        debug_assert!(new_config.ballot >= self.ballot());
        self.set_config_internal(new_config);
        self.touch_config_change(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_replica, TestReplicaBuilder};
    use strata_types::{Ballot, Decree, NodeId, PartitionStatus};

    #[test]
    fn install_primary_from_inactive() {
        let mut replica = test_replica();
        let config = replica.next_config(PartitionStatus::Primary);
        replica.update_configuration(config.clone(), 5).unwrap();

        assert_eq!(replica.status(), PartitionStatus::Primary);
        assert_eq!(replica.ballot(), config.ballot);
        assert_eq!(replica.last_config_change_ms(), 5);
        replica.verify_invariants().unwrap();
    }

    #[test]
    fn stale_ballot_config_rejected() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        let mut stale = replica.config().clone();
        stale.ballot = Ballot::ZERO;
        stale.status = PartitionStatus::Secondary;
        let err = replica.update_configuration(stale, 0).unwrap_err();
        assert!(matches!(err, ReplicaError::InconsistentState { .. }));
        // Unchanged.
        assert_eq!(replica.status(), PartitionStatus::Primary);
    }

    #[test]
    fn ballot_never_decreases_across_updates() {
        let mut replica = test_replica();
        let config = replica.next_config(PartitionStatus::Secondary);
        let installed = config.ballot;
        replica.update_configuration(config, 0).unwrap();

        let mut same = replica.config().clone();
        same.ballot = installed; // same ballot refresh is fine
        replica.update_configuration(same, 0).unwrap();
        assert_eq!(replica.ballot(), installed);
    }

    #[test]
    fn wrong_pid_is_object_not_found() {
        let mut replica = test_replica();
        let mut config = replica.next_config(PartitionStatus::Primary);
        config.pid = strata_types::Pid::new(strata_types::AppId::new(99), 9);
        assert_eq!(
            replica.update_configuration(config, 0).unwrap_err(),
            ReplicaError::ObjectNotFound
        );
    }

    #[test]
    fn disallowed_transition_rejected() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        // Primary -> PotentialSecondary is not in the matrix.
        let config = replica.next_config(PartitionStatus::PotentialSecondary);
        let err = replica.update_configuration(config, 0).unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidState { .. }));
    }

    #[test]
    fn demoted_primary_empties_write_queue() {
        let mut replica = TestReplicaBuilder::new().window_capacity(1).build_primary();
        replica.test_write_no_ack(b"a=1");
        // Window of one is full; this write queues.
        let crate::replica::WriteReply::Queued = replica.on_client_write(
            crate::request::ClientRequest::new(
                crate::test_support::storage_codes().write,
                bytes::Bytes::from_static(b"b=2"),
            ),
            0,
        ) else {
            panic!("expected queued");
        };

        let config = replica.next_config(PartitionStatus::Secondary);
        replica.update_configuration(config, 0).unwrap();
        assert_eq!(replica.status(), PartitionStatus::Secondary);
        assert!(replica.role().is_cleaned());
    }

    #[test]
    fn same_role_refresh_updates_membership() {
        let mut replica = TestReplicaBuilder::new().build_primary();
        let mut config = replica.next_config(PartitionStatus::Primary);
        config.secondaries = vec![NodeId::new(4)];
        replica.update_configuration(config, 0).unwrap();
        let ctx = replica.role().as_primary().unwrap();
        assert_eq!(ctx.membership.secondaries, vec![NodeId::new(4)]);
    }

    #[test]
    fn new_primary_records_prepare_horizon() {
        // A secondary with prepared-but-uncommitted decrees that becomes
        // primary must fence reads until it commits through them.
        let mut replica = TestReplicaBuilder::new().node(2).build_secondary();
        let mut primary = TestReplicaBuilder::new().build_primary();
        let crate::replica::WriteReply::Prepared { output, .. } = primary.on_client_write(
            crate::request::ClientRequest::new(
                crate::test_support::storage_codes().write,
                bytes::Bytes::from_static(b"a=1"),
            ),
            0,
        ) else {
            panic!("expected prepared");
        };
        replica.on_prepare(&output.prepares[0], 0);
        assert_eq!(replica.max_prepared_decree(), Decree::new(1));

        let config = replica.next_config(PartitionStatus::Primary);
        replica.update_configuration(config, 0).unwrap();
        let ctx = replica.role().as_primary().unwrap();
        assert_eq!(ctx.last_prepare_decree_on_new_primary, Decree::new(1));
    }
}
