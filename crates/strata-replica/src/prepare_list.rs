//! The prepare list: a bounded, contiguous window of pending decrees.
//!
//! The list holds every mutation above the durably-evicted prefix, both
//! pending and recently committed. Entries are dense in
//! `[min_decree, max_decree]`; the pending region is bounded by
//! `max_decree <= last_committed + capacity`. Eviction pops strictly from
//! the front and only entries that have already committed, so a
//! committed-but-not-yet-applied mutation (e.g. skipped while a
//! checkpoint runs) stays resident for later catch-up.

use std::collections::VecDeque;

use strata_types::{Ballot, Decree};
use tracing::debug;

use crate::mutation::Mutation;
use crate::{ReplicaError, ReplicaResult};

/// Bounded in-memory window of pending decrees and their mutations.
#[derive(Debug, Clone)]
pub struct PrepareList {
    /// Dense run of mutations; `entries[i]` has decree `start + i`.
    entries: VecDeque<Mutation>,

    /// Decree of the front entry (meaningful only when non-empty).
    start_decree: Decree,

    /// Highest committed decree.
    last_committed: Decree,

    /// Maximum pending decrees beyond `last_committed`.
    capacity: usize,
}

impl PrepareList {
    /// Creates an empty list whose committed prefix ends at `init_decree`.
    pub fn new(init_decree: Decree, capacity: usize) -> Self {
        assert!(capacity > 0, "prepare list capacity must be positive");
        Self {
            entries: VecDeque::with_capacity(capacity),
            start_decree: init_decree.next(),
            last_committed: init_decree,
            capacity,
        }
    }

    pub fn last_committed(&self) -> Decree {
        self.last_committed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decree of the newest resident entry, or `last_committed` if empty.
    pub fn max_decree(&self) -> Decree {
        if self.entries.is_empty() {
            self.last_committed
        } else {
            Decree::new(self.start_decree.as_u64() + self.entries.len() as u64 - 1)
        }
    }

    /// Decree of the oldest resident entry, if any.
    pub fn min_decree(&self) -> Option<Decree> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.start_decree)
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, decree: Decree) -> Option<&Mutation> {
        let index = decree.as_u64().checked_sub(self.start_decree.as_u64())?;
        self.entries.get(index as usize)
    }

    fn get_mut(&mut self, decree: Decree) -> Option<&mut Mutation> {
        let index = decree.as_u64().checked_sub(self.start_decree.as_u64())?;
        self.entries.get_mut(index as usize)
    }

    /// Records the log offset for a resident mutation.
    pub fn mark_logged(&mut self, decree: Decree, offset: crate::mutation::LogOffset) {
        if let Some(mu) = self.get_mut(decree) {
            mu.log_offset = Some(offset);
        }
    }

    /// Inserts a prepared mutation into the window.
    ///
    /// - at `max_decree + 1`: appended, evicting a committed front entry
    ///   when the window is physically full;
    /// - at a resident decree: a ballot `>=` the resident entry's
    ///   supersedes it (entries above with a lower ballot are dropped, to
    ///   be re-prepared under the new ballot); a lower ballot is an error;
    /// - at or below `last_committed`: ignored (stale retransmission);
    /// - beyond `max_decree + 1`: decree-gap error.
    pub fn prepare(&mut self, mu: Mutation) -> ReplicaResult<()> {
        let d = mu.decree;
        if d <= self.last_committed {
            debug!(decree = %d, "stale prepare ignored, already committed");
            return Ok(());
        }

        let next = self.max_decree().next();
        if d == next {
            if self.pending_count() >= self.capacity {
                return Err(ReplicaError::InconsistentState {
                    reason: format!(
                        "prepare window full: last_committed {}, max {}, capacity {}",
                        self.last_committed,
                        self.max_decree(),
                        self.capacity
                    ),
                });
            }
            if self.entries.len() == self.physical_capacity() {
                let front = self.entries.front().expect("non-empty at capacity");
                assert!(
                    front.decree <= self.last_committed,
                    "evicting uncommitted mutation {} from prepare list",
                    front.name()
                );
                self.entries.pop_front();
                self.start_decree = self.start_decree.next();
            }
            if self.entries.is_empty() {
                self.start_decree = d;
            }
            self.entries.push_back(mu);
            return Ok(());
        }

        if d > next {
            return Err(ReplicaError::decree_gap(next, d));
        }

        // Resident decree: ballot decides.
        let resident_ballot = self.get(d).expect("resident entry").ballot;
        if mu.ballot < resident_ballot {
            return Err(ReplicaError::ballot_regression(resident_ballot, mu.ballot));
        }
        if mu.ballot > resident_ballot {
            // Entries above came from the superseded ballot; drop any that
            // are older than the new one so ballots stay non-decreasing.
            let keep = (d.as_u64() - self.start_decree.as_u64() + 1) as usize;
            while self.entries.len() > keep {
                let tail = self.entries.back().expect("tail entry");
                if tail.ballot < mu.ballot {
                    debug!(dropped = %tail.name(), "superseded by higher-ballot prepare");
                    self.entries.pop_back();
                } else {
                    break;
                }
            }
        }
        *self.get_mut(d).expect("resident entry") = mu;
        Ok(())
    }

    /// Advances the committed prefix to `target`, yielding the newly
    /// committed mutations in strictly increasing decree order.
    ///
    /// Stops early at the first missing decree; never advances past
    /// `max_decree`. Committed entries stay resident until evicted.
    pub fn commit_to(&mut self, target: Decree) -> Vec<Mutation> {
        let mut committed = Vec::new();
        while self.last_committed < target {
            let next = self.last_committed.next();
            match self.get(next) {
                Some(mu) => {
                    committed.push(mu.clone());
                    self.last_committed = next;
                }
                None => break,
            }
        }
        committed
    }

    /// Discards all pending entries and restarts the window after
    /// `decree` (learner catch-up and split bootstrap).
    pub fn reset(&mut self, decree: Decree) {
        self.entries.clear();
        self.start_decree = decree.next();
        self.last_committed = decree;
    }

    /// Drops pending (uncommitted) entries, keeping the committed prefix.
    pub fn clear_pending(&mut self) {
        while self.max_decree() > self.last_committed {
            self.entries.pop_back();
        }
    }

    /// Number of decrees beyond the committed prefix.
    pub fn pending_count(&self) -> usize {
        self.last_committed.distance_to(self.max_decree()) as usize
    }

    fn physical_capacity(&self) -> usize {
        // Committed entries linger until the window slides past them, so
        // the deque may hold up to capacity pending plus capacity
        // committed entries.
        self.capacity * 2
    }

    /// Checks the structural invariants; used by tests after every
    /// public operation.
    pub fn validate(&self) -> ReplicaResult<()> {
        let mut prev_ballot = Ballot::ZERO;
        for (i, mu) in self.entries.iter().enumerate() {
            let expect = Decree::new(self.start_decree.as_u64() + i as u64);
            if mu.decree != expect {
                return Err(ReplicaError::decree_gap(expect, mu.decree));
            }
            if mu.ballot < prev_ballot {
                return Err(ReplicaError::ballot_regression(prev_ballot, mu.ballot));
            }
            prev_ballot = mu.ballot;
        }
        if self.max_decree() > Decree::new(self.last_committed.as_u64() + self.capacity as u64) {
            return Err(ReplicaError::InconsistentState {
                reason: "pending window exceeds capacity".to_string(),
            });
        }
        Ok(())
    }
}
