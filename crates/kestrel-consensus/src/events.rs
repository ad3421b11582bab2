//! Consensus events.
//!
//! By the time an event is built, its block is resident in the store (so its
//! height is known) and its signatures were checked at the network layer.
//! Validation here re-checks cheaply before the event reaches the core;
//! failures are silent drops.

use crate::core::HotstuffCore;
use crate::errors::CoreError;
use kestrel_block_store::Block;
use kestrel_consensus_types::{PartialCertificate, ReplicaConfig};
use shared_types::{short_hex, ReplicaId};
use std::sync::Arc;
use tracing::{debug, error};

/// A validated vote on a block this replica holds.
pub struct VoteEvent {
    pub voter: ReplicaId,
    pub cert: PartialCertificate,
    pub block: Arc<Block>,
}

impl VoteEvent {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        let Ok(info) = config.info(self.voter) else {
            debug!(voter = self.voter, "vote from unknown replica");
            return false;
        };
        if self.cert.validate(info).is_err() {
            debug!(voter = self.voter, "vote signature invalid");
            return false;
        }
        if self.block.hash() != &self.cert.block_hash {
            // events are built from the certificate's hash; disagreement is
            // a construction bug, not peer input
            error!(
                block = %short_hex(self.block.hash()),
                "vote event built for a different block than its certificate"
            );
            return false;
        }
        true
    }
}

/// A proposal whose block has been admitted to the store.
pub struct ProposalEvent {
    pub proposer: ReplicaId,
    pub block: Arc<Block>,
}

impl ProposalEvent {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        if !self.block.is_admitted() {
            debug!(
                block = %short_hex(self.block.hash()),
                "proposal event for a block not yet in the store"
            );
            return false;
        }
        self.block.validate_hotstuff(config)
    }
}

/// Work items of the consensus state machine.
pub enum Event {
    Vote(VoteEvent),
    Proposal(ProposalEvent),
}

impl Event {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        match self {
            Event::Vote(vote) => vote.validate(config),
            Event::Proposal(proposal) => proposal.validate(config),
        }
    }

    /// Dispatch into the core.
    pub fn apply(self, core: &HotstuffCore) -> Result<(), CoreError> {
        match self {
            Event::Vote(vote) => core.on_receive_vote(&vote.cert, vote.block, vote.voter),
            Event::Proposal(proposal) => {
                core.on_receive_proposal(proposal.block, proposal.proposer)
            }
        }
    }
}
