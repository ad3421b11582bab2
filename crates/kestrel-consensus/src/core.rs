//! The HotStuff core.
//!
//! All five state variables (`hqc`, `b_lock`, `b_exec`, `b_leaf`, `vheight`)
//! live behind one mutex and are read and written as a single atomic record.
//!
//! Voting rule: vote for `bnew` iff `bnew.height > vheight` and (`bnew`
//! extends `b_lock`, or `bnew.justify` certifies a block higher than
//! `b_lock`). Commit rule: a contiguous three-chain `b‴ ← b″ ← b*` linked by
//! both parent and justify edges commits `b‴` and everything below it.

use crate::errors::CoreError;
use crate::ports::{ConsensusNotifier, ExecutionHooks, ProtocolOutbound};
use kestrel_block_store::{Block, BlockStore, CommitIndex};
use kestrel_consensus_types::{PartialCertificate, QuorumCertificate, ReplicaConfig};
use parking_lot::Mutex;
use shared_crypto::Ed25519KeyPair;
use shared_types::{short_hex, ReplicaId};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CoreState {
    /// Highest QC known, with the block it certifies.
    hqc: (Arc<Block>, QuorumCertificate),
    /// Block this replica is locked on.
    b_lock: Arc<Block>,
    /// Highest executed (committed) block.
    b_exec: Arc<Block>,
    /// Tip the local proposer builds on.
    b_leaf: Arc<Block>,
    /// Height of the highest block voted for.
    vheight: u64,
}

pub struct HotstuffCore {
    genesis: Arc<Block>,
    state: Mutex<CoreState>,
    self_id: ReplicaId,
    config: Arc<ReplicaConfig>,
    keypair: Ed25519KeyPair,
    store: Arc<BlockStore>,
    index: Arc<CommitIndex>,
    protocol: Arc<dyn ProtocolOutbound>,
    hooks: Arc<dyn ExecutionHooks>,
    notifier: Arc<dyn ConsensusNotifier>,
}

impl HotstuffCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ReplicaConfig>,
        self_id: ReplicaId,
        keypair: Ed25519KeyPair,
        genesis: Arc<Block>,
        store: Arc<BlockStore>,
        index: Arc<CommitIndex>,
        protocol: Arc<dyn ProtocolOutbound>,
        hooks: Arc<dyn ExecutionHooks>,
        notifier: Arc<dyn ConsensusNotifier>,
    ) -> Self {
        let state = CoreState {
            hqc: (Arc::clone(&genesis), QuorumCertificate::genesis()),
            b_lock: Arc::clone(&genesis),
            b_exec: Arc::clone(&genesis),
            b_leaf: Arc::clone(&genesis),
            vheight: 0,
        };
        Self {
            genesis,
            state: Mutex::new(state),
            self_id,
            config,
            keypair,
            store,
            index,
            protocol,
            hooks,
            notifier,
        }
    }

    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    pub fn config(&self) -> &Arc<ReplicaConfig> {
        &self.config
    }

    pub fn genesis(&self) -> &Arc<Block> {
        &self.genesis
    }

    /// Height of the highest committed block.
    pub fn committed_height(&self) -> u64 {
        self.state.lock().b_exec.height()
    }

    pub fn locked_height(&self) -> u64 {
        self.state.lock().b_lock.height()
    }

    pub fn high_qc_height(&self) -> u64 {
        self.state.lock().hqc.0.height()
    }

    pub fn leaf_height(&self) -> u64 {
        self.state.lock().b_leaf.height()
    }

    pub fn voted_height(&self) -> u64 {
        self.state.lock().vheight
    }

    /// Handle a validated proposal whose block is resident in the store.
    pub fn on_receive_proposal(
        &self,
        bnew: Arc<Block>,
        proposer: ReplicaId,
    ) -> Result<(), CoreError> {
        let mut vote = false;
        {
            let mut state = self.state.lock();
            self.update(&mut state, &bnew)?;

            if bnew.height() > state.vheight {
                let qc_block_higher = bnew
                    .justify_block()
                    .map(|qb| qb.height() > state.b_lock.height())
                    .unwrap_or(false);
                if qc_block_higher || extends(&bnew, &state.b_lock) {
                    state.vheight = bnew.height();
                    vote = true;
                }
            }
        }

        debug!(
            block = %short_hex(bnew.hash()),
            height = bnew.height(),
            proposer,
            vote,
            "processed proposal"
        );

        if vote {
            let cert = PartialCertificate::create(*bnew.hash(), &self.keypair);
            self.protocol.send_vote_to(&bnew, cert, proposer);
        }
        Ok(())
    }

    /// Handle a validated vote on a resident block. Once the block's
    /// accumulated certificate reaches a quorum it becomes a candidate for
    /// `hqc`, and liveness is notified.
    pub fn on_receive_vote(
        &self,
        cert: &PartialCertificate,
        block: Arc<Block>,
        voter: ReplicaId,
    ) -> Result<(), CoreError> {
        let snapshot = match block.add_vote(voter, cert) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(voter, %err, "vote dropped");
                return Ok(());
            }
        };

        if snapshot.has_quorum(&self.config) {
            {
                let mut state = self.state.lock();
                self.update_hqc(&mut state, &block, &snapshot);
            }
            self.notifier.on_new_qc(block.hash());
            if !block.is_self_produced() {
                self.notifier.on_qc_for_foreign_block(&block);
            }
        }
        Ok(())
    }

    /// Mint and broadcast a block extending `b_leaf`, justified by the
    /// current `hqc`. Called by the proposer driver once the VM has produced
    /// (or declined to produce) a payload.
    pub fn do_propose(&self, body: Vec<u8>) -> Result<Arc<Block>, CoreError> {
        let state = &mut *self.state.lock();

        let block = Block::mint(body, state.hqc.1.clone(), *state.b_leaf.hash())?;
        if self.store.insert(Arc::clone(&block)).is_err() {
            // b_leaf and the hqc block are resident by construction
            return Err(CoreError::Invariant(format!(
                "freshly minted block {} failed insertion",
                short_hex(block.hash())
            )));
        }

        state.b_leaf = Arc::clone(&block);

        info!(
            block = %short_hex(block.hash()),
            height = block.height(),
            "proposing"
        );
        self.protocol.broadcast_proposal(&block);
        Ok(block)
    }

    /// Restore consensus state from the commit index after a restart.
    ///
    /// Committed blocks are reloaded from the archive in height order and
    /// re-admitted to the store; `b_exec`, `b_lock` and `b_leaf` are seated
    /// at the highest committed block. The stored state carries no QC for
    /// that block, so `hqc` starts empty: this replica can vote right away
    /// but will not mint an acceptable proposal until it observes a fresh
    /// QC-carrying block from the network.
    pub fn reload_state_from_index(&self) -> Result<(), CoreError> {
        let entries = self.index.entries();
        if entries.is_empty() {
            return Ok(());
        }

        let mut highest: Arc<Block> = Arc::clone(&self.genesis);
        for (height, hash, _vm_id) in &entries {
            let wire = self.store.archive().load(hash)?;
            let block = Block::from_wire(wire)?;
            if self.store.insert(Arc::clone(&block)).is_err() {
                return Err(CoreError::Invariant(format!(
                    "archived block {} at height {height} has unresolved dependencies",
                    short_hex(hash)
                )));
            }
            block.mark_decided();
            block.mark_applied();
            block.claim_disk_write();
            highest = block;
        }

        let mut state = self.state.lock();
        state.vheight = highest.height();
        state.b_lock = Arc::clone(&highest);
        state.b_exec = Arc::clone(&highest);
        state.b_leaf = Arc::clone(&highest);
        state.hqc = (Arc::clone(&highest), QuorumCertificate::new(*highest.hash()));
        info!(
            height = highest.height(),
            block = %short_hex(highest.hash()),
            "restored consensus state from commit index"
        );
        Ok(())
    }

    /// The update algorithm, run for every QC-carrying block arrival.
    fn update(&self, state: &mut CoreState, nblk: &Arc<Block>) -> Result<(), CoreError> {
        // b*: the block certified by nblk's justify
        let Some(b_star) = nblk.justify_block() else {
            return Ok(());
        };
        self.update_hqc(state, &b_star, nblk.justify());

        // b″: one justify edge further down
        let Some(b_second) = b_star.justify_block() else {
            return Ok(());
        };
        if b_second.height() > state.b_lock.height() {
            debug!(height = b_second.height(), "advancing locked block");
            state.b_lock = Arc::clone(&b_second);
        }

        // b‴: the commit candidate
        let Some(b_third) = b_second.justify_block() else {
            return Ok(());
        };

        let chained = parent_is(&b_star, &b_second) && parent_is(&b_second, &b_third);
        if chained && b_third.height() > state.b_exec.height() {
            self.commit_chain(state, &b_third)?;
            state.b_exec = Arc::clone(&b_third);
            self.store.prune_below_height(state.b_exec.height());
        }
        Ok(())
    }

    fn update_hqc(&self, state: &mut CoreState, qc_block: &Arc<Block>, qc: &QuorumCertificate) {
        if qc_block.height() > state.hqc.0.height() {
            debug!(
                block = %short_hex(qc_block.hash()),
                height = qc_block.height(),
                "new highest QC"
            );
            state.hqc = (Arc::clone(qc_block), qc.clone());
            if qc_block.height() > state.b_leaf.height() {
                state.b_leaf = Arc::clone(qc_block);
            }
        }
    }

    /// Commit every block from `b_exec` (exclusive) up to `target`
    /// (inclusive), oldest first: persist, mark decided, execute, settle the
    /// speculation entry, record in the commit index.
    fn commit_chain(&self, state: &mut CoreState, target: &Arc<Block>) -> Result<(), CoreError> {
        let mut chain = Vec::new();
        let mut cur = Arc::clone(target);
        while cur.height() > state.b_exec.height() {
            chain.push(Arc::clone(&cur));
            cur = cur.parent().ok_or_else(|| {
                CoreError::Invariant(format!(
                    "commit walk from {} lost its parent chain",
                    short_hex(target.hash())
                ))
            })?;
        }
        if cur.hash() != state.b_exec.hash() {
            warn!(
                expected = %short_hex(state.b_exec.hash()),
                found = %short_hex(cur.hash()),
                "commit walk landed beside the executed chain"
            );
            return Err(CoreError::SafetyViolation);
        }

        for block in chain.iter().rev() {
            self.store.write_to_disk(block.hash())?;
            block.mark_decided();
            self.hooks.apply_block(block);
            block.mark_applied();
            let vm_id = self.hooks.commitment_id(block)?;
            self.index.put(block.height(), *block.hash(), vm_id)?;
            info!(
                block = %short_hex(block.hash()),
                height = block.height(),
                "committed"
            );
        }
        Ok(())
    }
}

/// True iff `ancestor` is on `block`'s parent chain (or is `block` itself).
fn extends(block: &Arc<Block>, ancestor: &Arc<Block>) -> bool {
    let mut cur = Arc::clone(block);
    while cur.height() > ancestor.height() {
        match cur.parent() {
            Some(parent) => cur = parent,
            None => return false,
        }
    }
    cur.hash() == ancestor.hash()
}

fn parent_is(block: &Arc<Block>, expected: &Arc<Block>) -> bool {
    block
        .parent()
        .map(|p| p.hash() == expected.hash())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::HookError;
    use kestrel_block_store::BlockArchive;
    use kestrel_consensus_types::ReplicaInfo;
    use parking_lot::Mutex as PlMutex;
    use shared_types::Hash;

    const N: ReplicaId = 4;

    fn keypair(id: ReplicaId) -> Ed25519KeyPair {
        Ed25519KeyPair::from_seed([id as u8 + 1; 32])
    }

    fn test_config() -> Arc<ReplicaConfig> {
        Arc::new(
            ReplicaConfig::new((0..N).map(|id| ReplicaInfo {
                id,
                hostname: "localhost".into(),
                protocol_port: 0,
                fetch_port: 0,
                public_key: keypair(id).public_key(),
            }))
            .unwrap(),
        )
    }

    #[derive(Default)]
    struct RecordingProtocol {
        votes: PlMutex<Vec<(Hash, ReplicaId)>>,
        proposals: PlMutex<Vec<Hash>>,
    }

    impl ProtocolOutbound for RecordingProtocol {
        fn send_vote_to(&self, block: &Arc<Block>, _cert: PartialCertificate, target: ReplicaId) {
            self.votes.lock().push((*block.hash(), target));
        }
        fn broadcast_proposal(&self, block: &Arc<Block>) {
            self.proposals.lock().push(*block.hash());
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        applied: PlMutex<Vec<u64>>,
    }

    impl ExecutionHooks for RecordingHooks {
        fn apply_block(&self, block: &Arc<Block>) {
            self.applied.lock().push(block.height());
        }
        fn commitment_id(&self, block: &Arc<Block>) -> Result<Vec<u8>, HookError> {
            Ok(block.height().to_le_bytes().to_vec())
        }
    }

    struct Harness {
        core: HotstuffCore,
        store: Arc<BlockStore>,
        protocol: Arc<RecordingProtocol>,
        hooks: Arc<RecordingHooks>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(BlockArchive::open(dir.path().join("blocks")).unwrap());
        let index = Arc::new(CommitIndex::open(dir.path().join("commit.idx")).unwrap());
        let genesis = Block::genesis();
        let store = Arc::new(BlockStore::new(Arc::clone(&genesis), archive));
        let protocol = Arc::new(RecordingProtocol::default());
        let hooks = Arc::new(RecordingHooks::default());
        let core = HotstuffCore::new(
            test_config(),
            0,
            keypair(0),
            genesis,
            Arc::clone(&store),
            index,
            Arc::clone(&protocol) as Arc<dyn ProtocolOutbound>,
            Arc::clone(&hooks) as Arc<dyn ExecutionHooks>,
            Arc::new(crate::ports::NullNotifier),
        );
        Harness {
            core,
            store,
            protocol,
            hooks,
            _dir: dir,
        }
    }

    /// A fully signed QC over `hash`.
    fn qc_for(hash: Hash) -> QuorumCertificate {
        let mut qc = QuorumCertificate::new(hash);
        for id in 0..N {
            qc.add_partial(id, &PartialCertificate::create(hash, &keypair(id)))
                .unwrap();
        }
        qc
    }

    /// Extend `parent` with a block justified by a full QC on `parent`.
    fn extend(h: &Harness, parent: &Arc<Block>, body: &[u8]) -> Arc<Block> {
        let justify = if parent.is_genesis() {
            QuorumCertificate::genesis()
        } else {
            qc_for(*parent.hash())
        };
        let block = Block::mint(body.to_vec(), justify, *parent.hash()).unwrap();
        h.store.insert(Arc::clone(&block)).unwrap();
        block
    }

    #[test]
    fn test_three_chain_commit_progression() {
        let h = harness();
        let genesis = Arc::clone(h.core.genesis());

        let b1 = extend(&h, &genesis, b"b1");
        let b2 = extend(&h, &b1, b"b2");
        let b3 = extend(&h, &b2, b"b3");
        let b4 = extend(&h, &b3, b"b4");
        let b5 = extend(&h, &b4, b"b5");

        for (i, blk) in [&b1, &b2, &b3].iter().enumerate() {
            h.core
                .on_receive_proposal(Arc::clone(blk), 1)
                .unwrap();
            assert_eq!(h.core.committed_height(), 0, "no commit before b4");
            assert_eq!(h.core.voted_height(), (i + 1) as u64);
        }

        // b4 carries the QC on b3, completing the chain b1 ← b2 ← b3
        h.core.on_receive_proposal(Arc::clone(&b4), 1).unwrap();
        assert_eq!(h.core.committed_height(), 1);
        assert!(b1.is_decided());
        assert!(b1.is_applied());
        assert!(!b2.is_decided());

        h.core.on_receive_proposal(Arc::clone(&b5), 1).unwrap();
        assert_eq!(h.core.committed_height(), 2);
        assert_eq!(*h.hooks.applied.lock(), vec![1, 2]);

        // b_exec <= b_lock <= hqc at every step (final state checked here)
        assert!(h.core.committed_height() <= h.core.locked_height());
        assert!(h.core.locked_height() <= h.core.high_qc_height());
    }

    #[test]
    fn test_votes_are_sent_to_proposer() {
        let h = harness();
        let b1 = extend(&h, h.core.genesis(), b"b1");
        h.core.on_receive_proposal(Arc::clone(&b1), 2).unwrap();
        assert_eq!(*h.protocol.votes.lock(), vec![(*b1.hash(), 2)]);
    }

    #[test]
    fn test_no_double_vote_at_same_height() {
        let h = harness();
        let genesis = Arc::clone(h.core.genesis());
        let b1a = extend(&h, &genesis, b"b1a");
        let b1b = extend(&h, &genesis, b"b1b");

        h.core.on_receive_proposal(b1a, 1).unwrap();
        h.core.on_receive_proposal(b1b, 2).unwrap();

        // voted once; the second height-1 proposal fails vheight check
        assert_eq!(h.protocol.votes.lock().len(), 1);
        assert_eq!(h.core.voted_height(), 1);
    }

    #[test]
    fn test_vote_quorum_advances_hqc() {
        let h = harness();
        let b1 = extend(&h, h.core.genesis(), b"b1");

        for id in 0..N {
            let cert = PartialCertificate::create(*b1.hash(), &keypair(id));
            h.core
                .on_receive_vote(&cert, Arc::clone(&b1), id)
                .unwrap();
            let expected = if (id + 1) as usize >= h.core.config().nmajority {
                1
            } else {
                0
            };
            assert_eq!(h.core.high_qc_height(), expected);
        }
        // hqc now points at b1; proposer would build on it
        assert_eq!(h.core.leaf_height(), 1);
    }

    #[test]
    fn test_vote_with_mismatched_hash_dropped() {
        let h = harness();
        let b1 = extend(&h, h.core.genesis(), b"b1");
        // certificate signs a different hash
        let cert = PartialCertificate::create([9u8; 32], &keypair(1));
        h.core.on_receive_vote(&cert, Arc::clone(&b1), 1).unwrap();
        assert_eq!(b1.self_qc().signer_count(), 0);
    }

    #[test]
    fn test_do_propose_extends_leaf() {
        let h = harness();
        let block = h.core.do_propose(b"payload".to_vec()).unwrap();
        assert_eq!(block.height(), 1);
        assert_eq!(h.core.leaf_height(), 1);
        assert_eq!(*h.protocol.proposals.lock(), vec![*block.hash()]);

        let next = h.core.do_propose(b"more".to_vec()).unwrap();
        assert_eq!(next.height(), 2);
        assert_eq!(next.parent_hash(), block.hash());
    }

    #[test]
    fn test_locked_block_blocks_conflicting_votes() {
        let h = harness();
        let genesis = Arc::clone(h.core.genesis());

        // main chain through height 3 locks b1
        let b1 = extend(&h, &genesis, b"b1");
        let b2 = extend(&h, &b1, b"b2");
        let b3 = extend(&h, &b2, b"b3");
        for blk in [&b1, &b2, &b3] {
            h.core.on_receive_proposal(Arc::clone(blk), 1).unwrap();
        }
        assert_eq!(h.core.locked_height(), 1);

        // a fork off genesis at height 4 with a stale (genesis) justify:
        // neither extends b_lock nor carries a higher justify, so no vote
        let fork1 = extend(&h, &genesis, b"fork1");
        let fork2 = extend(&h, &fork1, b"fork2");
        let fork3 = extend(&h, &fork2, b"fork3");
        let fork4 = Block::mint(
            b"fork4".to_vec(),
            QuorumCertificate::genesis(),
            *fork3.hash(),
        )
        .unwrap();
        h.store.insert(Arc::clone(&fork4)).unwrap();

        let votes_before = h.protocol.votes.lock().len();
        h.core.on_receive_proposal(fork4, 2).unwrap();
        assert_eq!(h.protocol.votes.lock().len(), votes_before);
    }

    #[test]
    fn test_conflicting_three_chain_is_safety_violation_not_commit() {
        let h = harness();
        let genesis = Arc::clone(h.core.genesis());

        // chain A commits A1
        let a1 = extend(&h, &genesis, b"a1");
        let a2 = extend(&h, &a1, b"a2");
        let a3 = extend(&h, &a2, b"a3");
        let a4 = extend(&h, &a3, b"a4");
        for blk in [&a1, &a2, &a3, &a4] {
            h.core.on_receive_proposal(Arc::clone(blk), 1).unwrap();
        }
        assert_eq!(h.core.committed_height(), 1);

        // a fully certified conflicting chain (only possible with > f
        // equivocating signers); its three-chain must not commit a sibling
        let b1 = extend(&h, &genesis, b"b1");
        let b2 = extend(&h, &b1, b"b2");
        let b3 = extend(&h, &b2, b"b3");
        let b4 = extend(&h, &b3, b"b4");
        let b5 = extend(&h, &b4, b"b5");
        for blk in [&b1, &b2, &b3, &b4] {
            h.core.on_receive_proposal(Arc::clone(blk), 2).unwrap();
        }
        // b5 completes a three-chain over b2; committing b2 would require
        // walking beside the executed chain
        let result = h.core.on_receive_proposal(b5, 2);
        assert!(matches!(result, Err(CoreError::SafetyViolation)));

        // the committed prefix is untouched
        assert_eq!(h.core.committed_height(), 1);
        assert_eq!(*h.hooks.applied.lock(), vec![1]);
        assert!(!b1.is_decided());
    }

    #[test]
    fn test_commit_records_index_and_restart_restores() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("blocks");
        let index_path = dir.path().join("commit.idx");

        let committed_hash;
        {
            let archive = Arc::new(BlockArchive::open(&archive_path).unwrap());
            let index = Arc::new(CommitIndex::open(&index_path).unwrap());
            let genesis = Block::genesis();
            let store = Arc::new(BlockStore::new(Arc::clone(&genesis), archive));
            let h = Harness {
                core: HotstuffCore::new(
                    test_config(),
                    0,
                    keypair(0),
                    Arc::clone(&genesis),
                    Arc::clone(&store),
                    Arc::clone(&index),
                    Arc::new(RecordingProtocol::default()),
                    Arc::new(RecordingHooks::default()),
                    Arc::new(crate::ports::NullNotifier),
                ),
                store,
                protocol: Arc::new(RecordingProtocol::default()),
                hooks: Arc::new(RecordingHooks::default()),
                _dir: dir,
            };

            let b1 = extend(&h, &genesis, b"b1");
            let b2 = extend(&h, &b1, b"b2");
            let b3 = extend(&h, &b2, b"b3");
            let b4 = extend(&h, &b3, b"b4");
            for blk in [&b1, &b2, &b3, &b4] {
                h.core.on_receive_proposal(Arc::clone(blk), 1).unwrap();
            }
            assert_eq!(h.core.committed_height(), 1);
            assert_eq!(index.highest_height(), Some(1));
            committed_hash = *b1.hash();

            // fresh process over the same data directory
            let archive2 = Arc::new(BlockArchive::open(&archive_path).unwrap());
            let index2 = Arc::new(CommitIndex::open(&index_path).unwrap());
            let genesis2 = Block::genesis();
            let store2 = Arc::new(BlockStore::new(Arc::clone(&genesis2), archive2));
            let core2 = HotstuffCore::new(
                test_config(),
                0,
                keypair(0),
                genesis2,
                Arc::clone(&store2),
                index2,
                Arc::new(RecordingProtocol::default()),
                Arc::new(RecordingHooks::default()),
                Arc::new(crate::ports::NullNotifier),
            );
            core2.reload_state_from_index().unwrap();
            assert_eq!(core2.committed_height(), 1);
            assert_eq!(core2.locked_height(), 1);
            assert_eq!(core2.voted_height(), 1);
            assert!(store2.contains(&committed_hash));
        }
    }
}
