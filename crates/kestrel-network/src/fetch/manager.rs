//! The fetch request registry.
//!
//! Maps missing block hashes to their request contexts and routes each
//! request onto the right per-peer queue. The registry itself is only
//! touched from the network pipeline thread; the mutex exists because
//! delivery and registration share the map with shutdown.

use crate::event::NetEvent;
use crate::fetch::request::RequestContext;
use crate::fetch::worker::{FetchWorker, PeerQueue};
use crate::pipeline::NetworkEventQueue;
use crate::ports::PeerConnector;
use kestrel_block_store::Block;
use kestrel_consensus_types::ReplicaConfig;
use parking_lot::Mutex;
use shared_types::{short_hex, Hash, ReplicaId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct FetchPeer {
    queue: Arc<PeerQueue>,
    worker: FetchWorker,
}

pub struct FetchManager {
    peers: HashMap<ReplicaId, FetchPeer>,
    outstanding: Mutex<HashMap<Hash, Arc<RequestContext>>>,
    config: Arc<ReplicaConfig>,
    self_id: ReplicaId,
}

impl FetchManager {
    /// Spawn one fetch worker per remote peer.
    pub fn new(
        config: Arc<ReplicaConfig>,
        self_id: ReplicaId,
        pipeline: NetworkEventQueue,
        connector: &dyn PeerConnector,
    ) -> Self {
        let mut peers = HashMap::new();
        for info in config.iter().filter(|info| info.id != self_id) {
            let queue = Arc::new(PeerQueue::new());
            let client = connector.fetch_client(info);
            let worker =
                FetchWorker::spawn(info.id, Arc::clone(&queue), client, pipeline.clone());
            peers.insert(info.id, FetchPeer { queue, worker });
        }
        Self {
            peers,
            outstanding: Mutex::new(HashMap::new()),
            config,
            self_id,
        }
    }

    /// Register interest in a missing block.
    ///
    /// Creates the request context on first miss, parks `dependent_events`
    /// on it, and enqueues it toward `target` unless that peer was already
    /// asked. Requests to invalid peers (or to ourselves) are dropped.
    pub fn add_fetch_request(
        &self,
        requested_block: Hash,
        target: ReplicaId,
        dependent_events: Vec<NetEvent>,
    ) {
        if !self.config.is_valid_replica(target) || target == self.self_id {
            debug!(peer = target, block = %short_hex(&requested_block), "fetch target invalid, dropped");
            return;
        }

        let ctx = {
            let mut outstanding = self.outstanding.lock();
            Arc::clone(
                outstanding
                    .entry(requested_block)
                    .or_insert_with(|| Arc::new(RequestContext::new(requested_block))),
            )
        };

        ctx.add_events(dependent_events);

        if !ctx.was_requested_from(target) {
            ctx.mark_requested_from(target);
            if let Some(peer) = self.peers.get(&target) {
                debug!(peer = target, block = %short_hex(&requested_block), "requesting block");
                peer.queue.add(Arc::clone(&ctx));
            }
        }
    }

    /// A block arrived. Settle its request context (if any) and hand back
    /// the events parked on it, for exactly-once replay by the caller.
    pub fn deliver(&self, block: &Arc<Block>) -> Vec<NetEvent> {
        let ctx = self.outstanding.lock().remove(block.hash());
        match ctx {
            Some(ctx) => {
                ctx.mark_received();
                ctx.take_events()
            }
            None => {
                debug!(block = %short_hex(block.hash()), "block arrived with no pending request");
                Vec::new()
            }
        }
    }

    /// Number of unresolved requests (for observability and tests).
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn shutdown(&self) {
        for peer in self.peers.values() {
            peer.worker.shutdown();
        }
    }
}

impl Drop for FetchManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
