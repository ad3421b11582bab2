//! The consensus event queue.
//!
//! Producers (the network pipeline, the protocol loopback) submit events
//! through a cloneable handle that validates before enqueueing; a single
//! worker thread applies them to the core in arrival order. A core error is
//! a logic bug: the queue shuts itself down so no further state transitions
//! happen on a broken machine.

use crate::core::HotstuffCore;
use crate::events::Event;
use kestrel_consensus_types::ReplicaConfig;
use shared_types::{spawn_queue_worker, JoinOnDrop, WorkQueue};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct EventQueue {
    queue: WorkQueue<Event>,
    config: Arc<ReplicaConfig>,
}

impl EventQueue {
    pub fn new(config: Arc<ReplicaConfig>) -> Self {
        Self {
            queue: WorkQueue::new(),
            config,
        }
    }

    /// Validate an event against the replica config and enqueue it.
    /// Invalid events are dropped silently (logged at debug level).
    pub fn validate_and_submit(&self, event: Event) {
        if !event.validate(&self.config) {
            debug!("consensus event failed validation, dropped");
            return;
        }
        self.queue.push(event);
    }

    /// Spawn the worker thread that drives the core.
    pub fn start(&self, core: Arc<HotstuffCore>) -> JoinOnDrop {
        let queue = self.queue.clone();
        let poison = self.queue.clone();
        spawn_queue_worker("consensus-events", queue, move |event: Event| {
            if let Err(err) = event.apply(&core) {
                error!(%err, "fatal consensus error, halting event processing");
                poison.shutdown();
            }
        })
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}
