//! Proposer driver.
//!
//! Kestrel's liveness policy is deliberately minimal (no view changes, no
//! rotation): a replica configured to propose keeps extending its own leaf,
//! pulling each payload from the VM bridge and waiting for the leaf to be
//! certified before stacking the next block on top. The wait is bounded so
//! a lost vote round degrades into a re-proposal rather than a stall.

use kestrel_block_store::Block;
use kestrel_consensus::{ConsensusNotifier, HotstuffCore};
use kestrel_vm_bridge::{VirtualMachine, VmBridge};
use parking_lot::{Condvar, Mutex};
use shared_types::{short_hex, Hash, JoinOnDrop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How long to wait for a QC on the current leaf before proposing anyway.
const QC_WAIT: Duration = Duration::from_millis(500);

/// Condvar-based QC notifications out of the core; the proposer sleeps on
/// this between rounds.
pub struct QcSignal {
    generation: Mutex<u64>,
    qc_seen: Condvar,
}

impl Default for QcSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl QcSignal {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            qc_seen: Condvar::new(),
        }
    }

    /// Block until any QC arrives or the timeout lapses.
    pub fn wait(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let seen = *generation;
        while *generation == seen {
            let now = std::time::Instant::now();
            if now >= deadline {
                return;
            }
            let result = self.qc_seen.wait_for(&mut generation, deadline - now);
            if result.timed_out() {
                return;
            }
        }
    }
}

impl ConsensusNotifier for QcSignal {
    fn on_new_qc(&self, block_hash: &Hash) {
        debug!(block = %short_hex(block_hash), "qc formed");
        let mut generation = self.generation.lock();
        *generation += 1;
        self.qc_seen.notify_all();
    }

    fn on_qc_for_foreign_block(&self, block: &Arc<Block>) {
        debug!(
            block = %short_hex(block.hash()),
            height = block.height(),
            "qc on foreign block"
        );
    }
}

/// Background loop minting proposals through the VM bridge.
pub struct ProposerDriver {
    shutdown: Arc<AtomicBool>,
    _worker: JoinOnDrop,
}

impl ProposerDriver {
    pub fn spawn<V: VirtualMachine>(
        core: Arc<HotstuffCore>,
        bridge: Arc<VmBridge<V>>,
        qc_signal: Arc<QcSignal>,
    ) -> Self {
        bridge.set_proposer();

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = JoinOnDrop::spawn("proposer-driver", move || {
            run(core, bridge, qc_signal, worker_shutdown);
        });
        Self {
            shutdown,
            _worker: worker,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for ProposerDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<V: VirtualMachine>(
    core: Arc<HotstuffCore>,
    bridge: Arc<VmBridge<V>>,
    qc_signal: Arc<QcSignal>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        // chained HotStuff: stack the next block once the leaf is certified
        if core.high_qc_height() < core.leaf_height() {
            qc_signal.wait(QC_WAIT);
            if shutdown.load(Ordering::Acquire) {
                return;
            }
        }

        let proposal_height = core.leaf_height() + 1;
        let body = match bridge.get_and_apply_next_proposal(proposal_height) {
            Ok(body) => body,
            Err(err) => {
                error!(%err, "proposal payload unavailable, stopping proposer");
                return;
            }
        };
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = core.do_propose(body) {
            error!(%err, "propose failed, stopping proposer");
            return;
        }
    }
}
