//! Peer protocol wire messages.
//!
//! All messages travel as canonical bincode, length-prefixed by the
//! transport. The protocol port is one-way (no responses); the fetch port is
//! request/response.

use kestrel_block_store::BlockWire;
use kestrel_consensus_types::PartialCertificate;
use serde::{Deserialize, Serialize};
use shared_types::{Hash, ReplicaId};

/// A vote forwarded to a proposer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteMessage {
    pub vote: PartialCertificate,
    pub voter: ReplicaId,
}

/// A proposal broadcast to all replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeMessage {
    pub proposal: BlockWire,
    pub proposer: ReplicaId,
}

/// The two request kinds accepted on the protocol port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMessage {
    Vote(VoteMessage),
    Propose(ProposeMessage),
}

/// Batched request for blocks by header hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockFetchRequest {
    pub reqs: Vec<Hash>,
}

/// The subset of requested blocks resident in the server's memory cache.
/// Flushed blocks are omitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockFetchResponse {
    pub responses: Vec<BlockWire>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_block_store::Block;
    use kestrel_consensus_types::QuorumCertificate;
    use shared_crypto::Ed25519KeyPair;
    use shared_types::ZERO_HASH;

    #[test]
    fn test_peer_message_roundtrip() {
        let keypair = Ed25519KeyPair::from_seed([3u8; 32]);
        let block = Block::mint(b"payload".to_vec(), QuorumCertificate::genesis(), ZERO_HASH)
            .unwrap();

        let vote = PeerMessage::Vote(VoteMessage {
            vote: PartialCertificate::create(*block.hash(), &keypair),
            voter: 2,
        });
        let propose = PeerMessage::Propose(ProposeMessage {
            proposal: block.to_wire().unwrap(),
            proposer: 0,
        });

        for msg in [vote, propose] {
            let bytes = bincode::serialize(&msg).unwrap();
            let back: PeerMessage = bincode::deserialize(&bytes).unwrap();
            assert_eq!(bincode::serialize(&back).unwrap(), bytes);
        }
    }

    #[test]
    fn test_fetch_roundtrip() {
        let req = BlockFetchRequest {
            reqs: vec![[1u8; 32], [2u8; 32]],
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: BlockFetchRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.reqs, req.reqs);
    }
}
