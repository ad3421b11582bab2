//! Network events.
//!
//! The tagged union fed into the network event pipeline. Events are
//! validated against the replica config on entry; signature or hash failures
//! are silent drops, logged at debug level.

use kestrel_block_store::Block;
use kestrel_consensus_types::{PartialCertificate, ReplicaConfig};
use shared_types::{short_hex, Hash, ReplicaId};
use std::sync::Arc;
use tracing::debug;

/// A vote observed on the wire. The voted block may not be local yet.
#[derive(Clone)]
pub struct VoteNetEvent {
    pub cert: PartialCertificate,
    pub voter: ReplicaId,
}

impl VoteNetEvent {
    pub fn block_hash(&self) -> &Hash {
        &self.cert.block_hash
    }

    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        let Ok(info) = config.info(self.voter) else {
            debug!(voter = self.voter, "vote from unknown replica");
            return false;
        };
        if self.cert.validate(info).is_err() {
            debug!(
                voter = self.voter,
                block = %short_hex(self.block_hash()),
                "vote signature invalid"
            );
            return false;
        }
        true
    }
}

/// A proposed block received from a peer.
#[derive(Clone)]
pub struct ProposalNetEvent {
    pub block: Arc<Block>,
    pub proposer: ReplicaId,
}

impl ProposalNetEvent {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        if !config.is_valid_replica(self.proposer) {
            debug!(proposer = self.proposer, "proposal from unknown replica");
            return false;
        }
        self.block.validate_hotstuff(config)
    }
}

/// A block delivered by the fetch subsystem: a cache fill, never forwarded
/// to consensus directly.
#[derive(Clone)]
pub struct BlockReceiveNetEvent {
    pub block: Arc<Block>,
    pub sender: ReplicaId,
}

impl BlockReceiveNetEvent {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        self.block.validate_hotstuff(config)
    }
}

/// Work items of the network event pipeline.
#[derive(Clone)]
pub enum NetEvent {
    Vote(VoteNetEvent),
    Proposal(ProposalNetEvent),
    BlockReceive(BlockReceiveNetEvent),
}

impl NetEvent {
    pub fn validate(&self, config: &ReplicaConfig) -> bool {
        match self {
            NetEvent::Vote(vote) => vote.validate(config),
            NetEvent::Proposal(proposal) => proposal.validate(config),
            NetEvent::BlockReceive(receive) => receive.validate(config),
        }
    }
}
