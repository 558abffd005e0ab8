//! The client read path.

use strata_types::PartitionStatus;
use tracing::error;

use crate::metrics;
use crate::request::{ClientRequest, ClientResponse};
use crate::role::RoleState;
use crate::throttle::ThrottleDecision;
use crate::ReplicaError;

use super::ReplicaCore;

/// What the read path hands back to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply {
    /// Reply to the client now.
    Response(ClientResponse),

    /// The throttler owns the response; re-submit the read at
    /// `retry_at_ms` with `ignore_throttling = true`. The retry
    /// re-checks ACL, split version and role from the top, so a role
    /// change during the delay is observed.
    Delayed { retry_at_ms: u64 },
}

impl ReplicaCore {
    /// Serves a client read.
    ///
    /// Order of checks: access control, split version, role, throttle,
    /// primary-staleness window (backup reads exempt), then the engine.
    pub fn on_client_read(
        &mut self,
        request: &ClientRequest,
        ignore_throttling: bool,
        now_ms: u64,
    ) -> ReadReply {
        if self.is_closed() {
            return self.read_reject(ReplicaError::Closed);
        }

        if !self.access().allowed(request) {
            return self.read_reject(ReplicaError::AclDeny);
        }

        if request.partition_version != self.partition_version() {
            // The request was routed before the split completed.
            return self.read_reject(ReplicaError::InvalidState {
                status: self.status(),
            });
        }

        if matches!(
            self.status(),
            PartitionStatus::Inactive | PartitionStatus::PotentialSecondary
        ) {
            return self.read_reject(ReplicaError::InvalidState {
                status: self.status(),
            });
        }

        if !ignore_throttling {
            match self.throttler_mut().admit_read(now_ms) {
                ThrottleDecision::Allow => {}
                ThrottleDecision::Delay { until_ms } => {
                    metrics::record_throttling_event(self.pid(), "read", "delay");
                    return ReadReply::Delayed {
                        retry_at_ms: until_ms,
                    };
                }
                ThrottleDecision::Reject => {
                    metrics::record_throttling_event(self.pid(), "read", "reject");
                    return self.read_reject(ReplicaError::Busy);
                }
            }
        }

        if request.is_backup_request {
            // Only backup requests may read from a stale replica.
            metrics::record_backup_request(&self.app_info().app_name);
        } else {
            if self.status() != PartitionStatus::Primary {
                return self.read_reject(ReplicaError::InvalidState {
                    status: self.status(),
                });
            }

            // A new primary serves reads only after its committed prefix
            // covers everything the previous primary may have prepared.
            if let RoleState::Primary(ctx) = self.role() {
                if self.last_committed_decree() < ctx.last_prepare_decree_on_new_primary {
                    error!(
                        replica = %self.name(),
                        last_committed = %self.last_committed_decree(),
                        last_prepare_on_new_primary = %ctx.last_prepare_decree_on_new_primary,
                        "read denied in post-election window"
                    );
                    return self.read_reject(ReplicaError::InvalidState {
                        status: self.status(),
                    });
                }
            }
        }

        let start = std::time::Instant::now();
        let result = self.engine_mut().on_request(request);
        if let Some(histogram) = self.latency_histogram(request.code) {
            #[allow(clippy::cast_precision_loss)]
            histogram.observe(start.elapsed().as_nanos() as f64);
        }

        match result {
            Ok(payload) => ReadReply::Response(ClientResponse::ok(self.status(), payload)),
            Err(err) => {
                if err.is_fatal() {
                    self.handle_local_failure(&err);
                }
                self.read_reject(err)
            }
        }
    }

    fn read_reject(&self, err: ReplicaError) -> ReadReply {
        ReadReply::Response(ClientResponse::err(self.status(), err))
    }
}
