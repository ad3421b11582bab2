//! Outstanding-request bookkeeping.

use crate::event::NetEvent;
use parking_lot::Mutex;
use shared_types::{Hash, ReplicaId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One not-yet-satisfied block request.
///
/// Tracks which peers have already been asked (a bitmap of replica ids) and
/// the network events parked until the block arrives. Created on first miss,
/// dropped once the block is delivered and the parked events are replayed.
pub struct RequestContext {
    hash: Hash,
    received: AtomicBool,
    /// Bitmap of replica ids this hash was already requested from.
    asked: AtomicU64,
    /// Events that cannot proceed until this block arrives.
    pending: Mutex<Vec<NetEvent>>,
}

impl RequestContext {
    pub fn new(hash: Hash) -> Self {
        Self {
            hash,
            received: AtomicBool::new(false),
            asked: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn is_received(&self) -> bool {
        self.received.load(Ordering::Acquire)
    }

    pub fn mark_received(&self) {
        self.received.store(true, Ordering::Release);
    }

    pub fn was_requested_from(&self, rid: ReplicaId) -> bool {
        (self.asked.load(Ordering::Acquire) >> rid) & 1 == 1
    }

    pub fn mark_requested_from(&self, rid: ReplicaId) {
        self.asked.fetch_or(1u64 << rid, Ordering::AcqRel);
    }

    pub fn add_events(&self, events: Vec<NetEvent>) {
        self.pending.lock().extend(events);
    }

    /// Detach the parked events for replay.
    pub fn take_events(&self) -> Vec<NetEvent> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_from_bitmap() {
        let ctx = RequestContext::new([1u8; 32]);
        assert!(!ctx.was_requested_from(0));
        assert!(!ctx.was_requested_from(63));
        ctx.mark_requested_from(0);
        ctx.mark_requested_from(63);
        assert!(ctx.was_requested_from(0));
        assert!(ctx.was_requested_from(63));
        assert!(!ctx.was_requested_from(5));
    }

    #[test]
    fn test_take_events_empties_pending() {
        let ctx = RequestContext::new([1u8; 32]);
        ctx.add_events(vec![NetEvent::Vote(crate::event::VoteNetEvent {
            cert: kestrel_consensus_types::PartialCertificate::create(
                [1u8; 32],
                &shared_crypto::Ed25519KeyPair::from_seed([1u8; 32]),
            ),
            voter: 0,
        })]);
        assert_eq!(ctx.take_events().len(), 1);
        assert!(ctx.take_events().is_empty());
    }
}
