//! The speculative-execution gadget.
//!
//! An ordered list of `(hotstuff height, vm block id)` pairs tracking what
//! the VM has executed ahead of finality. Entries are strictly sequential
//! starting at `highest_committed + 1`; commits pop from the front with no
//! gaps, and any divergence clears the whole list so it can be re-seeded
//! from the committed chain.
//!
//! Compound bridge operations must hold the lock across the whole
//! operation; the guard returned by [`SpeculationTracker::lock`] is the
//! only way in.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt::Debug;
use thiserror::Error;
use tracing::warn;

/// Commit-ordering violations. Fatal at the caller: they mean consensus and
/// the speculation list disagree about the committed sequence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpeculationError {
    #[error("committing height {0} against an empty speculation list")]
    EmptyList(u64),

    #[error("gap in commit log: expected height {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
}

pub struct SpeculationState<I> {
    entries: VecDeque<(u64, I)>,
    /// Next height a speculative entry may be added at.
    head_height: u64,
    highest_committed: u64,
}

impl<I: Clone + Debug> SpeculationState<I> {
    /// Append a speculative entry. Only the exact head height is accepted;
    /// anything else is a stale speculation racing a revert, and is dropped
    /// with a warning.
    pub fn add_height_pair(&mut self, height: u64, id: I) {
        if height != self.head_height {
            warn!(
                height,
                head = self.head_height,
                "speculative entry out of sequence, dropped"
            );
            return;
        }
        self.head_height += 1;
        self.entries.push_back((height, id));
    }

    /// The oldest un-committed speculative entry.
    pub fn lowest(&self) -> Option<&(u64, I)> {
        self.entries.front()
    }

    /// Commit the front entry. The committed height must be exactly the
    /// front of the list: no gaps, no reordering.
    pub fn on_commit(&mut self, height: u64) -> Result<I, SpeculationError> {
        let Some((front_height, id)) = self.entries.pop_front() else {
            return Err(SpeculationError::EmptyList(height));
        };
        if front_height != height {
            self.entries.push_front((front_height, id));
            return Err(SpeculationError::Gap {
                expected: front_height,
                got: height,
            });
        }
        self.highest_committed = front_height;
        Ok(id)
    }

    /// Drop all speculation and reset the head to just above the committed
    /// frontier.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.head_height = self.highest_committed + 1;
    }

    /// Seed the committed frontier from durable state at startup.
    pub fn init_from_height(&mut self, highest_committed: u64) {
        self.highest_committed = highest_committed;
        self.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn highest_committed(&self) -> u64 {
        self.highest_committed
    }
}

/// Mutex wrapper handing out whole-operation guards.
pub struct SpeculationTracker<I> {
    inner: Mutex<SpeculationState<I>>,
}

impl<I: Clone + Debug> Default for SpeculationTracker<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Clone + Debug> SpeculationTracker<I> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SpeculationState {
                entries: VecDeque::new(),
                head_height: 1,
                highest_committed: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SpeculationState<I>> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_commit() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();

        g.add_height_pair(1, 100);
        g.add_height_pair(2, 101);
        g.add_height_pair(3, 102);

        assert_eq!(g.on_commit(1), Ok(100));
        assert_eq!(g.on_commit(2), Ok(101));
        assert_eq!(g.on_commit(3), Ok(102));

        g.add_height_pair(4, 103);
        assert_eq!(g.on_commit(4), Ok(103));
    }

    #[test]
    fn test_lowest_tracks_front() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();

        g.add_height_pair(1, 100);
        g.add_height_pair(2, 101);
        g.add_height_pair(3, 102);
        g.on_commit(1).unwrap();
        g.on_commit(2).unwrap();

        g.add_height_pair(4, 103);
        assert_eq!(g.lowest(), Some(&(3, 102)));
    }

    #[test]
    fn test_out_of_sequence_entries_dropped() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();

        // head is 1: both of these are out of sequence
        g.add_height_pair(5, 100);
        g.add_height_pair(10, 101);
        assert!(g.is_empty());
        assert_eq!(g.on_commit(5), Err(SpeculationError::EmptyList(5)));
    }

    #[test]
    fn test_commit_gap_detected() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();
        g.add_height_pair(1, 100);
        g.add_height_pair(2, 101);
        assert_eq!(
            g.on_commit(2),
            Err(SpeculationError::Gap {
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn test_clear_reseeds_head_after_commit() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();

        g.add_height_pair(1, 100);
        g.add_height_pair(2, 101);
        g.on_commit(1).unwrap();

        g.clear();

        // head is back at highest_committed + 1 = 2
        g.add_height_pair(2, 202);
        assert_eq!(g.on_commit(2), Ok(202));
    }

    #[test]
    fn test_init_from_height() {
        let tracker: SpeculationTracker<u64> = SpeculationTracker::new();
        let mut g = tracker.lock();
        g.init_from_height(41);
        g.add_height_pair(42, 7);
        assert_eq!(g.on_commit(42), Ok(7));
        assert_eq!(g.highest_committed(), 42);
    }
}
