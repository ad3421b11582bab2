//! Node wiring.
//!
//! Builds the full subsystem stack in dependency order, runs the restart
//! path against durable state, and owns orderly shutdown. Transport comes
//! in through a [`PeerConnector`], so the same wiring serves real TCP
//! deployments and in-process test clusters.

use anyhow::Context;
use kestrel_block_store::{Block, BlockArchive, BlockStore, CommitIndex};
use kestrel_consensus::{EventQueue, HotstuffCore};
use kestrel_consensus_types::ReplicaConfig;
use kestrel_network::{
    FetchManager, FetchService, NetworkEventQueue, NetworkPipeline, PeerConnector,
    ProtocolManager, ProtocolService,
};
use kestrel_vm_bridge::{VirtualMachine, VmBridge};
use shared_crypto::Ed25519KeyPair;
use shared_types::{JoinOnDrop, ReplicaId};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::proposer::QcSignal;

pub struct KestrelNode<V: VirtualMachine> {
    config: Arc<ReplicaConfig>,
    store: Arc<BlockStore>,
    index: Arc<CommitIndex>,
    core: Arc<HotstuffCore>,
    bridge: Arc<VmBridge<V>>,
    consensus_queue: EventQueue,
    net_queue: NetworkEventQueue,
    fetch: Arc<FetchManager>,
    protocol: Arc<ProtocolManager>,
    qc_signal: Arc<QcSignal>,
    _pipeline: NetworkPipeline,
    _consensus_worker: JoinOnDrop,
}

impl<V: VirtualMachine> KestrelNode<V> {
    pub fn build(
        replica_config: ReplicaConfig,
        self_id: ReplicaId,
        keypair: Ed25519KeyPair,
        data_dir: &Path,
        vm: V,
        connector: &dyn PeerConnector,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(replica_config);

        let archive = Arc::new(
            BlockArchive::open(data_dir.join("blocks")).context("opening block archive")?,
        );
        let index = Arc::new(
            CommitIndex::open(data_dir.join("commit.idx")).context("opening commit index")?,
        );

        let genesis = Block::genesis();
        let store = Arc::new(BlockStore::new(Arc::clone(&genesis), archive));

        let consensus_queue = EventQueue::new(Arc::clone(&config));
        let net_queue = NetworkEventQueue::new(Arc::clone(&config));

        let fetch = Arc::new(FetchManager::new(
            Arc::clone(&config),
            self_id,
            net_queue.clone(),
            connector,
        ));
        let protocol = Arc::new(ProtocolManager::new(
            &config,
            self_id,
            consensus_queue.clone(),
            connector,
        ));

        let bridge = Arc::new(VmBridge::new(vm));
        let qc_signal = Arc::new(QcSignal::new());

        let core = Arc::new(HotstuffCore::new(
            Arc::clone(&config),
            self_id,
            keypair,
            genesis,
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&protocol) as Arc<dyn kestrel_consensus::ProtocolOutbound>,
            Arc::clone(&bridge) as Arc<dyn kestrel_consensus::ExecutionHooks>,
            Arc::clone(&qc_signal) as Arc<dyn kestrel_consensus::ConsensusNotifier>,
        ));

        // restart path: replay durable state before any event flows
        if index.is_empty() {
            bridge.init_clean();
        } else {
            core.reload_state_from_index()
                .context("restoring consensus state")?;
            bridge.init_from_index(&index);
        }

        let consensus_worker = consensus_queue.start(Arc::clone(&core));
        let pipeline = NetworkPipeline::start(
            net_queue.clone(),
            Arc::clone(&store),
            Arc::clone(&fetch),
            consensus_queue.clone(),
        );

        info!(self_id, nreplicas = config.nreplicas, "kestrel node wired");
        Ok(Self {
            config,
            store,
            index,
            core,
            bridge,
            consensus_queue,
            net_queue,
            fetch,
            protocol,
            qc_signal,
            _pipeline: pipeline,
            _consensus_worker: consensus_worker,
        })
    }

    pub fn config(&self) -> &Arc<ReplicaConfig> {
        &self.config
    }

    pub fn core(&self) -> &Arc<HotstuffCore> {
        &self.core
    }

    pub fn bridge(&self) -> &Arc<VmBridge<V>> {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<CommitIndex> {
        &self.index
    }

    pub fn fetch(&self) -> &Arc<FetchManager> {
        &self.fetch
    }

    pub fn qc_signal(&self) -> &Arc<QcSignal> {
        &self.qc_signal
    }

    pub fn net_queue(&self) -> &NetworkEventQueue {
        &self.net_queue
    }

    /// Inbound handler for the protocol port.
    pub fn protocol_service(&self) -> ProtocolService {
        ProtocolService::new(self.net_queue.clone())
    }

    /// Inbound handler for the block-fetch port.
    pub fn fetch_service(&self) -> FetchService {
        FetchService::new(Arc::clone(&self.store))
    }

    /// Poll until the committed height reaches `height` or the timeout
    /// lapses.
    pub fn wait_for_commit(&self, height: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.core.committed_height() >= height {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.core.committed_height() >= height
    }

    /// Stop all queues and workers. Safe to call more than once; also runs
    /// on drop.
    pub fn shutdown(&self) {
        self.net_queue.shutdown();
        self.consensus_queue.shutdown();
        self.fetch.shutdown();
        self.protocol.shutdown();
        self.bridge.shutdown();
    }
}

impl<V: VirtualMachine> Drop for KestrelNode<V> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
