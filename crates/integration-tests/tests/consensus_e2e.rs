//! End-to-end consensus scenarios over the loopback transport.

use integration_tests::{
    test_keypair, test_replica_config, wait_until, LoopbackConnector, LoopbackNet, TestCluster,
};
use kestrel_block_store::Block;
use kestrel_consensus_types::{PartialCertificate, QuorumCertificate};
use kestrel_network::{BlockFetchRequest, NetEvent, ProposalNetEvent, VoteNetEvent};
use node_runtime::{CounterVm, KestrelNode};
use shared_types::{Hash, ReplicaId, ZERO_HASH};
use std::sync::Arc;
use std::time::Duration;

/// A certificate over `hash` signed by every replica of an `n`-replica set.
fn full_qc(hash: Hash, n: ReplicaId) -> QuorumCertificate {
    let mut qc = QuorumCertificate::new(hash);
    for id in 0..n {
        qc.add_partial(id, &PartialCertificate::create(hash, &test_keypair(id)))
            .unwrap();
    }
    qc
}

#[test]
fn happy_path_four_replicas_commit_three_chain() {
    let cluster = TestCluster::build(4);

    // B1..B6 from replica 0; after B6 is seen everywhere, b_exec = B3
    cluster.drive_proposals(6);

    for (id, node) in cluster.nodes.iter().enumerate() {
        assert!(
            node.wait_for_commit(3, Duration::from_secs(10)),
            "replica {id} stuck at height {}",
            node.core().committed_height()
        );
    }

    // all replicas committed the same chain
    let reference: Vec<(u64, Hash, Vec<u8>)> = cluster.nodes[0].index().entries();
    assert_eq!(reference.len(), 3);
    for node in &cluster.nodes[1..] {
        assert_eq!(node.index().entries(), reference);
    }

    // safety ordering holds everywhere
    for node in &cluster.nodes {
        assert!(node.core().committed_height() <= node.core().locked_height());
        assert!(node.core().locked_height() <= node.core().high_qc_height());
    }
}

#[test]
fn out_of_order_arrival_repairs_through_fetch() {
    let cluster = TestCluster::build(2);
    let node0 = &cluster.nodes[0];
    let node1 = &cluster.nodes[1];

    // a valid chain B1 <- B2 <- B3 known only to replica 1
    let b1 = Block::mint(Vec::new(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
    let b2 = Block::mint(Vec::new(), full_qc(*b1.hash(), 2), *b1.hash()).unwrap();
    let b3 = Block::mint(Vec::new(), full_qc(*b2.hash(), 2), *b2.hash()).unwrap();
    node1.store().insert(Arc::clone(&b1)).unwrap();
    node1.store().insert(Arc::clone(&b2)).unwrap();

    // replica 0 hears only the tip
    node0
        .net_queue()
        .validate_and_submit(NetEvent::Proposal(ProposalNetEvent {
            block: Arc::clone(&b3),
            proposer: 1,
        }));

    // the fetch cascade fills B2 then B1, and B3 is replayed and accepted
    assert!(wait_until(Duration::from_secs(10), || {
        node0.store().contains(b3.hash())
    }));
    assert_eq!(node0.store().get(b3.hash()).unwrap().height(), 3);
    assert!(wait_until(Duration::from_secs(5), || {
        node0.core().voted_height() == 3
    }));
}

#[test]
fn vote_arriving_before_block_is_parked_and_counted() {
    let cluster = TestCluster::build(2);
    let node0 = &cluster.nodes[0];
    let node1 = &cluster.nodes[1];

    let b1 = Block::mint(Vec::new(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
    node1.store().insert(Arc::clone(&b1)).unwrap();

    // replica 1's vote reaches replica 0 before the block does
    node0
        .net_queue()
        .validate_and_submit(NetEvent::Vote(VoteNetEvent {
            cert: PartialCertificate::create(*b1.hash(), &test_keypair(1)),
            voter: 1,
        }));

    assert!(wait_until(Duration::from_secs(10), || {
        node0
            .store()
            .get(b1.hash())
            .map(|block| block.self_qc().signer_count() == 1)
            .unwrap_or(false)
    }));
}

#[test]
fn byzantine_parent_is_never_forwarded() {
    let cluster = TestCluster::build(2);
    let node0 = &cluster.nodes[0];

    // valid justify, unknown parent: the fetch can never be satisfied
    let orphan = Block::mint(Vec::new(), QuorumCertificate::genesis(), [0xEE; 32]).unwrap();
    node0
        .net_queue()
        .validate_and_submit(NetEvent::Proposal(ProposalNetEvent {
            block: Arc::clone(&orphan),
            proposer: 1,
        }));

    // give the fetch workers time to exhaust their attempts
    std::thread::sleep(Duration::from_secs(3));

    assert!(!node0.store().contains(orphan.hash()));
    assert_eq!(node0.core().voted_height(), 0);
    assert_eq!(node0.core().committed_height(), 0);
    // the request context outlives the per-peer attempts
    assert_eq!(node0.fetch().outstanding_len(), 1);
}

#[test]
fn flushed_blocks_are_omitted_from_fetch_responses() {
    let cluster = TestCluster::build(2);
    let node0 = &cluster.nodes[0];
    node0.bridge().set_proposer();

    // drive enough rounds that B1 falls below the committed frontier
    let mut proposed = Vec::new();
    for _ in 0..6 {
        assert!(wait_until(Duration::from_secs(10), || {
            node0.core().high_qc_height() >= node0.core().leaf_height()
        }));
        let height = node0.core().leaf_height() + 1;
        let body = node0.bridge().get_and_apply_next_proposal(height).unwrap();
        proposed.push(node0.core().do_propose(body).unwrap());
    }
    assert!(node0.wait_for_commit(3, Duration::from_secs(10)));

    let b1_hash = *proposed[0].hash();
    // eviction happens on the GC worker after the commit
    assert!(wait_until(Duration::from_secs(5), || {
        node0.store().get(&b1_hash).is_none()
    }));

    let response = node0.fetch_service().fetch(&BlockFetchRequest {
        reqs: vec![b1_hash],
    });
    assert!(response.responses.is_empty());

    // the block is still on disk
    assert!(node0.store().archive().contains(&b1_hash));
}

#[test]
fn single_replica_restart_restores_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let net = LoopbackNet::new();
    let connector = LoopbackConnector {
        net: Arc::clone(&net),
    };

    let committed_entries;
    {
        let node = KestrelNode::build(
            test_replica_config(1),
            0,
            test_keypair(0),
            dir.path(),
            CounterVm::new(),
            &connector,
        )
        .unwrap();
        net.register(0, node.protocol_service(), node.fetch_service());
        node.bridge().set_proposer();

        for _ in 0..5 {
            assert!(wait_until(Duration::from_secs(10), || {
                node.core().high_qc_height() >= node.core().leaf_height()
            }));
            let height = node.core().leaf_height() + 1;
            let body = node.bridge().get_and_apply_next_proposal(height).unwrap();
            node.core().do_propose(body).unwrap();
        }
        assert!(node.wait_for_commit(2, Duration::from_secs(10)));
        committed_entries = node.index().entries();
        net.unregister(0);
        node.shutdown();
    }

    // a fresh process over the same data directory
    let node = KestrelNode::build(
        test_replica_config(1),
        0,
        test_keypair(0),
        dir.path(),
        CounterVm::new(),
        &connector,
    )
    .unwrap();

    assert_eq!(
        node.core().committed_height(),
        committed_entries.last().map(|(h, _, _)| *h).unwrap()
    );
    assert_eq!(node.index().entries(), committed_entries);
    // the committed chain is resident again
    for (_, hash, _) in &committed_entries {
        assert!(node.store().contains(hash));
    }
}
