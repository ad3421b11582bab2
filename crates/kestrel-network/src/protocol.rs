//! Protocol manager, per-peer send workers, and the inbound service handler.
//!
//! Outbound: votes go to one peer, proposals to everyone. The local replica
//! is short-circuited through the consensus event queue; for proposals this
//! happens before any remote send, so a vote racing back always finds the
//! block already in the store.
//!
//! Inbound: the service handler decodes peer messages into net events and
//! feeds the pipeline.

use crate::event::{NetEvent, ProposalNetEvent, VoteNetEvent};
use crate::messages::{PeerMessage, ProposeMessage, VoteMessage};
use crate::pipeline::NetworkEventQueue;
use crate::ports::{PeerConnector, ProtocolClient};
use kestrel_block_store::Block;
use kestrel_consensus::{Event, EventQueue, ProposalEvent, ProtocolOutbound, VoteEvent};
use kestrel_consensus_types::{PartialCertificate, ReplicaConfig};
use shared_types::{short_hex, spawn_queue_worker, JoinOnDrop, ReplicaId, WorkQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pause between redelivery attempts to an unreachable peer.
const RESEND_DELAY: Duration = Duration::from_millis(500);

struct PeerSender {
    queue: WorkQueue<PeerMessage>,
    _worker: JoinOnDrop,
}

impl PeerSender {
    fn spawn(peer: ReplicaId, client: Arc<dyn ProtocolClient>) -> Self {
        let queue: WorkQueue<PeerMessage> = WorkQueue::new();
        let worker_queue = queue.clone();
        let shutdown_probe = queue.clone();
        let worker = spawn_queue_worker(
            &format!("protocol-peer-{peer}"),
            worker_queue,
            move |msg: PeerMessage| {
                // retry indefinitely; messages must not be lost to transient
                // transport failures
                loop {
                    match client.send(&msg) {
                        Ok(()) => return,
                        Err(err) => {
                            warn!(peer, %err, "protocol send failed, retrying");
                        }
                    }
                    let waited = std::time::Instant::now();
                    while waited.elapsed() < RESEND_DELAY {
                        if shutdown_probe.is_shut_down() {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            },
        );
        Self {
            queue,
            _worker: worker,
        }
    }
}

/// Fans votes and proposals out to peers; implements the core's outbound
/// port.
pub struct ProtocolManager {
    self_id: ReplicaId,
    consensus: EventQueue,
    peers: HashMap<ReplicaId, PeerSender>,
}

impl ProtocolManager {
    pub fn new(
        config: &ReplicaConfig,
        self_id: ReplicaId,
        consensus: EventQueue,
        connector: &dyn PeerConnector,
    ) -> Self {
        let mut peers = HashMap::new();
        for info in config.iter().filter(|info| info.id != self_id) {
            let client = connector.protocol_client(info);
            peers.insert(info.id, PeerSender::spawn(info.id, client));
        }
        Self {
            self_id,
            consensus,
            peers,
        }
    }

    pub fn shutdown(&self) {
        for peer in self.peers.values() {
            peer.queue.shutdown();
        }
    }
}

impl Drop for ProtocolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ProtocolOutbound for ProtocolManager {
    fn send_vote_to(&self, block: &Arc<Block>, cert: PartialCertificate, target: ReplicaId) {
        if target == self.self_id {
            self.consensus.validate_and_submit(Event::Vote(VoteEvent {
                voter: self.self_id,
                cert,
                block: Arc::clone(block),
            }));
            return;
        }

        match self.peers.get(&target) {
            Some(peer) => {
                peer.queue.push(PeerMessage::Vote(VoteMessage {
                    vote: cert,
                    voter: self.self_id,
                }));
            }
            None => debug!(peer = target, "vote for unknown peer dropped"),
        }
    }

    fn broadcast_proposal(&self, block: &Arc<Block>) {
        // self first: any vote that races back will find the block resident
        self.consensus
            .validate_and_submit(Event::Proposal(ProposalEvent {
                proposer: self.self_id,
                block: Arc::clone(block),
            }));

        let wire = match block.to_wire() {
            Ok(wire) => wire,
            Err(err) => {
                error!(
                    block = %short_hex(block.hash()),
                    %err,
                    "own proposal lost its body before broadcast"
                );
                return;
            }
        };
        let msg = PeerMessage::Propose(ProposeMessage {
            proposal: wire,
            proposer: self.self_id,
        });
        for peer in self.peers.values() {
            peer.queue.push(msg.clone());
        }
    }
}

/// Inbound handler for the protocol port. Transport adapters call
/// [`ProtocolService::handle`] for each decoded frame.
pub struct ProtocolService {
    pipeline: NetworkEventQueue,
}

impl ProtocolService {
    pub fn new(pipeline: NetworkEventQueue) -> Self {
        Self { pipeline }
    }

    pub fn handle(&self, msg: PeerMessage) {
        match msg {
            PeerMessage::Vote(vote) => {
                self.pipeline.validate_and_submit(NetEvent::Vote(VoteNetEvent {
                    cert: vote.vote,
                    voter: vote.voter,
                }));
            }
            PeerMessage::Propose(propose) => match Block::from_wire(propose.proposal) {
                Ok(block) => {
                    self.pipeline
                        .validate_and_submit(NetEvent::Proposal(ProposalNetEvent {
                            block,
                            proposer: propose.proposer,
                        }));
                }
                Err(err) => {
                    debug!(proposer = propose.proposer, %err, "undecodable proposal dropped");
                }
            },
        }
    }
}
