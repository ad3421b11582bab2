//! Test support for multi-replica scenarios.
//!
//! Replicas run fully in-process and exchange messages over a loopback
//! "network": clients resolve their target's inbound service through a
//! shared registry on every call, so peers can be registered late, taken
//! down, and brought back. That is enough to exercise retries and fetch
//! repair.

use kestrel_consensus_types::{ReplicaConfig, ReplicaInfo};
use kestrel_network::{
    BlockFetchRequest, BlockFetchResponse, FetchClient, FetchService, PeerConnector, PeerMessage,
    ProtocolClient, ProtocolService, TransportError,
};
use node_runtime::{CounterVm, KestrelNode};
use parking_lot::Mutex;
use shared_crypto::Ed25519KeyPair;
use shared_types::ReplicaId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry of in-process replica endpoints.
#[derive(Default)]
pub struct LoopbackNet {
    services: Mutex<HashMap<ReplicaId, (Arc<ProtocolService>, Arc<FetchService>)>>,
    down: Mutex<HashSet<ReplicaId>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ReplicaId, protocol: ProtocolService, fetch: FetchService) {
        self.services
            .lock()
            .insert(id, (Arc::new(protocol), Arc::new(fetch)));
    }

    pub fn unregister(&self, id: ReplicaId) {
        self.services.lock().remove(&id);
    }

    /// Simulate a peer outage; sends and fetches toward it fail until
    /// restored.
    pub fn set_down(&self, id: ReplicaId, down: bool) {
        if down {
            self.down.lock().insert(id);
        } else {
            self.down.lock().remove(&id);
        }
    }

    fn protocol(&self, id: ReplicaId) -> Result<Arc<ProtocolService>, TransportError> {
        if self.down.lock().contains(&id) {
            return Err(TransportError::Unavailable);
        }
        self.services
            .lock()
            .get(&id)
            .map(|(protocol, _)| Arc::clone(protocol))
            .ok_or(TransportError::Unavailable)
    }

    fn fetch(&self, id: ReplicaId) -> Result<Arc<FetchService>, TransportError> {
        if self.down.lock().contains(&id) {
            return Err(TransportError::Unavailable);
        }
        self.services
            .lock()
            .get(&id)
            .map(|(_, fetch)| Arc::clone(fetch))
            .ok_or(TransportError::Unavailable)
    }
}

struct LoopbackProtocolClient {
    net: Arc<LoopbackNet>,
    target: ReplicaId,
}

impl ProtocolClient for LoopbackProtocolClient {
    fn send(&self, msg: &PeerMessage) -> Result<(), TransportError> {
        self.net.protocol(self.target)?.handle(msg.clone());
        Ok(())
    }
}

struct LoopbackFetchClient {
    net: Arc<LoopbackNet>,
    target: ReplicaId,
}

impl FetchClient for LoopbackFetchClient {
    fn fetch(&self, req: &BlockFetchRequest) -> Result<BlockFetchResponse, TransportError> {
        Ok(self.net.fetch(self.target)?.fetch(req))
    }
}

pub struct LoopbackConnector {
    pub net: Arc<LoopbackNet>,
}

impl PeerConnector for LoopbackConnector {
    fn protocol_client(&self, info: &ReplicaInfo) -> Arc<dyn ProtocolClient> {
        Arc::new(LoopbackProtocolClient {
            net: Arc::clone(&self.net),
            target: info.id,
        })
    }

    fn fetch_client(&self, info: &ReplicaInfo) -> Arc<dyn FetchClient> {
        Arc::new(LoopbackFetchClient {
            net: Arc::clone(&self.net),
            target: info.id,
        })
    }
}

/// Deterministic per-replica keypair for tests.
pub fn test_keypair(id: ReplicaId) -> Ed25519KeyPair {
    Ed25519KeyPair::from_seed([id as u8 + 1; 32])
}

/// A replica set with loopback addresses.
pub fn test_replica_config(n: ReplicaId) -> ReplicaConfig {
    ReplicaConfig::new((0..n).map(|id| ReplicaInfo {
        id,
        hostname: "loopback".into(),
        protocol_port: 0,
        fetch_port: 0,
        public_key: test_keypair(id).public_key(),
    }))
    .expect("valid test replica set")
}

/// An in-process cluster of counter-VM replicas.
pub struct TestCluster {
    pub net: Arc<LoopbackNet>,
    pub nodes: Vec<KestrelNode<CounterVm>>,
    pub dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    pub fn build(n: ReplicaId) -> Self {
        let net = LoopbackNet::new();
        let connector = LoopbackConnector {
            net: Arc::clone(&net),
        };

        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for id in 0..n {
            let dir = tempfile::tempdir().expect("tempdir");
            let node = KestrelNode::build(
                test_replica_config(n),
                id,
                test_keypair(id),
                dir.path(),
                CounterVm::new(),
                &connector,
            )
            .expect("node wiring");
            net.register(id, node.protocol_service(), node.fetch_service());
            nodes.push(node);
            dirs.push(dir);
        }

        Self { net, nodes, dirs }
    }

    /// Run `rounds` chained proposals from replica 0, waiting for each leaf
    /// to be certified before stacking the next block.
    pub fn drive_proposals(&self, rounds: u64) {
        let node0 = &self.nodes[0];
        node0.bridge().set_proposer();

        for _ in 0..rounds {
            assert!(
                wait_until(Duration::from_secs(10), || {
                    node0.core().high_qc_height() >= node0.core().leaf_height()
                }),
                "leaf never certified (leaf {}, hqc {})",
                node0.core().leaf_height(),
                node0.core().high_qc_height(),
            );
            let height = node0.core().leaf_height() + 1;
            let body = node0
                .bridge()
                .get_and_apply_next_proposal(height)
                .expect("proposal body");
            node0.core().do_propose(body).expect("propose");
        }
    }
}

/// Poll `check` until it holds or the deadline lapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
