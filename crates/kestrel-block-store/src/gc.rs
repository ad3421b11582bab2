//! Block garbage collector.
//!
//! A background worker that receives every admitted block into an enqueue
//! buffer and, when triggered with a committed height, flushes the bodies of
//! tracked blocks strictly below that height and evicts them from the live
//! cache. Pruning below the committed frontier is safe: honest proposers
//! only build on `justify.height >= highest_qc.height >= committed_height`.

use crate::block::Block;
use parking_lot::{Condvar, Mutex};
use shared_types::{Hash, JoinOnDrop};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct GcState {
    /// Blocks handed over since the last collection.
    buffer: Vec<Arc<Block>>,
    /// Most recent "collect everything below this height" trigger.
    trigger_height: Option<u64>,
    shutdown: bool,
}

struct GcShared {
    state: Mutex<GcState>,
    work_ready: Condvar,
}

/// Owns the collector thread. Evictions operate on the live cache map shared
/// with the block store.
pub struct GarbageCollector {
    shared: Arc<GcShared>,
    _worker: JoinOnDrop,
}

impl GarbageCollector {
    pub fn spawn(cache: Arc<Mutex<HashMap<Hash, Arc<Block>>>>) -> Self {
        let shared = Arc::new(GcShared {
            state: Mutex::new(GcState {
                buffer: Vec::new(),
                trigger_height: None,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = JoinOnDrop::spawn("block-gc", move || {
            run(worker_shared, cache);
        });

        Self {
            shared,
            _worker: worker,
        }
    }

    /// Track a newly admitted block for eventual collection.
    pub fn track(&self, block: Arc<Block>) {
        let mut state = self.shared.state.lock();
        state.buffer.push(block);
    }

    /// Request collection of all tracked blocks below `height`. Overwrites
    /// any pending trigger; only the newest frontier matters.
    pub fn invoke(&self, height: u64) {
        let mut state = self.shared.state.lock();
        state.trigger_height = Some(height);
        self.shared.work_ready.notify_all();
    }

    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.work_ready.notify_all();
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<GcShared>, cache: Arc<Mutex<HashMap<Hash, Arc<Block>>>>) {
    let mut tracked: Vec<Arc<Block>> = Vec::new();
    loop {
        let trigger_height;
        {
            let mut state = shared.state.lock();
            while !state.shutdown && state.trigger_height.is_none() {
                shared.work_ready.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            tracked.append(&mut state.buffer);
            trigger_height = state.trigger_height.take().unwrap_or(0);
        }
        collect(&mut tracked, trigger_height, &cache);
    }
}

fn collect(tracked: &mut Vec<Arc<Block>>, height: u64, cache: &Mutex<HashMap<Hash, Arc<Block>>>) {
    let before = tracked.len();
    let mut evicted = 0usize;
    let mut i = 0;
    while i < tracked.len() {
        if tracked[i].height() < height {
            let block = tracked.swap_remove(i);
            block.flush_body();
            if cache.lock().remove(block.hash()).is_some() {
                evicted += 1;
            }
        } else {
            i += 1;
        }
    }
    debug!(
        height,
        evicted,
        retained = tracked.len(),
        scanned = before,
        "garbage collection pass"
    );
}
