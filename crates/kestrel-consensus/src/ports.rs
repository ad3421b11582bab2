//! Outbound ports of the consensus core.
//!
//! The network layer implements [`ProtocolOutbound`], the VM bridge
//! implements [`ExecutionHooks`], and whoever drives liveness (the node
//! runtime) implements [`ConsensusNotifier`].

use kestrel_block_store::Block;
use kestrel_consensus_types::PartialCertificate;
use shared_types::{Hash, ReplicaId};
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by the execution bridge on the commit path. Treated as an
/// invariant violation by the core.
#[derive(Debug, Error)]
#[error("execution hook failed: {0}")]
pub struct HookError(pub String);

/// Sending votes and proposals to peers (and to ourselves via loopback).
pub trait ProtocolOutbound: Send + Sync {
    /// Forward a vote to `target` (usually, but not necessarily, the
    /// proposer of the block being voted on).
    fn send_vote_to(&self, block: &Arc<Block>, cert: PartialCertificate, target: ReplicaId);

    /// Broadcast a freshly minted proposal. Implementations deliver to the
    /// local event queue before any remote send, so vote races always find
    /// the block already in the store.
    fn broadcast_proposal(&self, block: &Arc<Block>);
}

/// The execution side of commitment, implemented by the VM bridge.
pub trait ExecutionHooks: Send + Sync {
    /// Hand a block that just became committed to the VM for execution.
    /// No-op when the VM already executed it speculatively.
    fn apply_block(&self, block: &Arc<Block>);

    /// Settle the speculation entry for this block, forward the commitment
    /// to the VM's log, and return the serialized VM block id for the commit
    /// index.
    fn commitment_id(&self, block: &Arc<Block>) -> Result<Vec<u8>, HookError>;
}

/// Liveness-facing notifications out of the core.
pub trait ConsensusNotifier: Send + Sync {
    /// A quorum certificate formed (or arrived) for this block hash.
    fn on_new_qc(&self, block_hash: &Hash);

    /// A quorum formed on a block this replica did not produce.
    fn on_qc_for_foreign_block(&self, block: &Arc<Block>);
}

/// Notifier that ignores everything; useful for tests and followers.
pub struct NullNotifier;

impl ConsensusNotifier for NullNotifier {
    fn on_new_qc(&self, _block_hash: &Hash) {}
    fn on_qc_for_foreign_block(&self, _block: &Arc<Block>) {}
}
