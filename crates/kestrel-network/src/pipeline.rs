//! The network event pipeline.
//!
//! A single worker thread serializes all updates to the block store and the
//! fetch registry. Per event:
//!
//! - **Vote**: forward to consensus if the voted block is resident,
//!   otherwise register a fetch against the voter with the vote parked on
//!   it.
//! - **Proposal**: try to insert the block. On success, replay any events
//!   that were waiting for this block and forward the proposal to
//!   consensus. On missing dependencies, park the proposal (and anything
//!   already waiting on it) against a fetch to the proposer.
//! - **BlockReceive**: same as proposal, but a pure cache fill; nothing is
//!   forwarded to consensus.
//!
//! Parked events are recorded against exactly one fetch (the parent's, when
//! both dependencies are missing) so each deferred event replays exactly
//! once, when its last missing dependency arrives.

use crate::event::NetEvent;
use crate::fetch::FetchManager;
use kestrel_block_store::{BlockStore, InsertStatus};
use kestrel_consensus::{Event, EventQueue, ProposalEvent, VoteEvent};
use kestrel_consensus_types::ReplicaConfig;
use shared_types::{short_hex, spawn_queue_worker, JoinOnDrop, WorkQueue};
use std::sync::Arc;
use tracing::debug;

/// Cloneable submission handle onto the pipeline.
///
/// `validate_and_submit` is the entry point for transport handlers and
/// fetch workers; events failing config validation are dropped silently.
#[derive(Clone)]
pub struct NetworkEventQueue {
    queue: WorkQueue<NetEvent>,
    config: Arc<ReplicaConfig>,
}

impl NetworkEventQueue {
    pub fn new(config: Arc<ReplicaConfig>) -> Self {
        Self {
            queue: WorkQueue::new(),
            config,
        }
    }

    pub fn validate_and_submit(&self, event: NetEvent) {
        if !event.validate(&self.config) {
            debug!("network event failed validation, dropped");
            return;
        }
        self.queue.push(event);
    }

    /// Re-enqueue events that were already validated on first entry.
    fn replay(&self, events: Vec<NetEvent>) {
        if !events.is_empty() {
            self.queue.push_all(events);
        }
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

/// The worker thread behind a [`NetworkEventQueue`].
pub struct NetworkPipeline {
    _worker: JoinOnDrop,
}

impl NetworkPipeline {
    pub fn start(
        handle: NetworkEventQueue,
        store: Arc<BlockStore>,
        fetch: Arc<FetchManager>,
        consensus: EventQueue,
    ) -> Self {
        let replayer = handle.clone();
        let worker = spawn_queue_worker(
            "network-events",
            handle.queue.clone(),
            move |event: NetEvent| {
                process(event, &store, &fetch, &consensus, &replayer);
            },
        );
        Self { _worker: worker }
    }
}

fn process(
    event: NetEvent,
    store: &Arc<BlockStore>,
    fetch: &Arc<FetchManager>,
    consensus: &EventQueue,
    replayer: &NetworkEventQueue,
) {
    match event {
        NetEvent::Vote(vote) => {
            // signature was validated on entry
            match store.get(vote.block_hash()) {
                Some(block) => {
                    consensus.validate_and_submit(Event::Vote(VoteEvent {
                        voter: vote.voter,
                        cert: vote.cert,
                        block,
                    }));
                }
                None => {
                    let hash = *vote.block_hash();
                    let voter = vote.voter;
                    fetch.add_fetch_request(hash, voter, vec![NetEvent::Vote(vote)]);
                }
            }
        }
        NetEvent::Proposal(proposal) => {
            let block = Arc::clone(&proposal.block);
            let proposer = proposal.proposer;
            match store.insert(Arc::clone(&block)) {
                Ok(status) => {
                    if status == InsertStatus::AlreadyPresent {
                        debug!(block = %short_hex(block.hash()), "duplicate proposal block");
                    }
                    replayer.replay(fetch.deliver(&block));
                    consensus.validate_and_submit(Event::Proposal(ProposalEvent {
                        proposer,
                        block,
                    }));
                }
                Err(missing) => {
                    // events already waiting on this block stay parked with
                    // the proposal itself
                    let mut dependents = fetch.deliver(&block);
                    dependents.push(NetEvent::Proposal(proposal));
                    park_on_missing(fetch, proposer, missing, dependents);
                }
            }
        }
        NetEvent::BlockReceive(receive) => {
            let block = Arc::clone(&receive.block);
            let sender = receive.sender;
            match store.insert(Arc::clone(&block)) {
                Ok(_) => {
                    replayer.replay(fetch.deliver(&block));
                }
                Err(missing) => {
                    let mut dependents = fetch.deliver(&block);
                    dependents.push(NetEvent::BlockReceive(receive));
                    park_on_missing(fetch, sender, missing, dependents);
                }
            }
        }
    }
}

/// Fire up to two fetches for a block's missing dependencies. The dependent
/// events ride on the first fetch only, so they replay once.
fn park_on_missing(
    fetch: &Arc<FetchManager>,
    target: shared_types::ReplicaId,
    missing: kestrel_block_store::MissingDependencies,
    mut dependents: Vec<NetEvent>,
) {
    if let Some(parent_hash) = missing.parent_hash {
        fetch.add_fetch_request(parent_hash, target, std::mem::take(&mut dependents));
    }
    if let Some(justify_hash) = missing.justify_hash {
        fetch.add_fetch_request(justify_hash, target, dependents);
    }
}
