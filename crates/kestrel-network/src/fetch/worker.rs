//! Per-peer fetch worker.
//!
//! Each peer gets one queue of outstanding request contexts and one worker
//! thread holding a best-effort connection. The worker batches every pending
//! hash into a single fetch RPC, feeds returned blocks into the network
//! pipeline as `BlockReceive` events, and paces retries so a peer that does
//! not have (or no longer has) a block is not hammered. A context is dropped
//! from this peer's queue after a bounded number of attempts; the request
//! itself stays alive in the registry for other peers.

use crate::event::{BlockReceiveNetEvent, NetEvent};
use crate::fetch::request::RequestContext;
use crate::pipeline::NetworkEventQueue;
use crate::ports::FetchClient;
use kestrel_block_store::Block;
use parking_lot::{Condvar, Mutex};
use shared_types::{short_hex, JoinOnDrop, ReplicaId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts against one peer before giving up on that peer.
const MAX_ATTEMPTS_PER_PEER: u32 = 8;

/// Pause between fetch rounds toward the same peer.
const RETRY_DELAY: Duration = Duration::from_millis(300);

struct QueuedRequest {
    ctx: Arc<RequestContext>,
    attempts: u32,
}

struct PeerQueueState {
    outstanding: Vec<QueuedRequest>,
    shutdown: bool,
}

pub(crate) struct PeerQueue {
    state: Mutex<PeerQueueState>,
    work_ready: Condvar,
}

impl PeerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PeerQueueState {
                outstanding: Vec::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        }
    }

    pub(crate) fn add(&self, ctx: Arc<RequestContext>) {
        let mut state = self.state.lock();
        state.outstanding.push(QueuedRequest { ctx, attempts: 0 });
        self.work_ready.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.work_ready.notify_all();
    }
}

/// Owns the background thread fetching from one peer.
pub(crate) struct FetchWorker {
    queue: Arc<PeerQueue>,
    _worker: JoinOnDrop,
}

impl FetchWorker {
    pub(crate) fn spawn(
        peer: ReplicaId,
        queue: Arc<PeerQueue>,
        client: Arc<dyn FetchClient>,
        pipeline: NetworkEventQueue,
    ) -> Self {
        let worker_queue = Arc::clone(&queue);
        let worker = JoinOnDrop::spawn(&format!("fetch-peer-{peer}"), move || {
            run(peer, worker_queue, client, pipeline);
        });
        Self {
            queue,
            _worker: worker,
        }
    }

    pub(crate) fn shutdown(&self) {
        self.queue.shutdown();
    }
}

fn run(
    peer: ReplicaId,
    queue: Arc<PeerQueue>,
    client: Arc<dyn FetchClient>,
    pipeline: NetworkEventQueue,
) {
    loop {
        // wait for outstanding work
        {
            let mut state = queue.state.lock();
            while !state.shutdown && state.outstanding.is_empty() {
                queue.work_ready.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
        }

        let hashes = drain_pending(&queue);
        if !hashes.is_empty() {
            let request = crate::messages::BlockFetchRequest { reqs: hashes };
            match client.fetch(&request) {
                Ok(response) => {
                    debug!(
                        peer,
                        requested = request.reqs.len(),
                        returned = response.responses.len(),
                        "fetch round complete"
                    );
                    for wire in response.responses {
                        match Block::from_wire(wire) {
                            Ok(block) => {
                                pipeline.validate_and_submit(NetEvent::BlockReceive(
                                    BlockReceiveNetEvent {
                                        block,
                                        sender: peer,
                                    },
                                ));
                            }
                            Err(err) => {
                                debug!(peer, %err, "undecodable block in fetch response");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(peer, %err, "fetch RPC failed, will retry");
                }
            }
        }

        // pace the next round; satisfied contexts are pruned on the next
        // drain, unsatisfied ones get re-requested
        let mut state = queue.state.lock();
        if state.shutdown {
            return;
        }
        let _ = queue.work_ready.wait_for(&mut state, RETRY_DELAY);
        if state.shutdown {
            return;
        }
    }
}

/// Prune satisfied and exhausted contexts; return the hashes still worth
/// requesting from this peer.
fn drain_pending(queue: &PeerQueue) -> Vec<shared_types::Hash> {
    let mut state = queue.state.lock();
    let mut hashes = Vec::new();
    state.outstanding.retain_mut(|req| {
        if req.ctx.is_received() {
            return false;
        }
        if req.attempts >= MAX_ATTEMPTS_PER_PEER {
            debug!(
                hash = %short_hex(req.ctx.hash()),
                "giving up on this peer for block"
            );
            return false;
        }
        req.attempts += 1;
        hashes.push(*req.ctx.hash());
        true
    });
    hashes
}
