//! The VM control worker.
//!
//! Owns the VM instance and runs it on a single background thread, so VM
//! access stays single-threaded no matter how many producers submit work.
//! Work priorities per pass: execute submitted blocks first, then log
//! commitments, then produce at most one speculative proposal.
//!
//! While in proposer mode the worker keeps the proposal buffer near its
//! target; submitting a block for execution cancels proposer state outright,
//! because execution may be on a different chain than what was being
//! speculatively proposed.

use crate::vm::VirtualMachine;
use kestrel_block_store::CommitIndex;
use parking_lot::{Condvar, Mutex};
use shared_types::JoinOnDrop;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info};

/// How many speculative proposals to keep warm while proposing.
pub const PROPOSAL_BUFFER_TARGET: usize = 3;

struct CtlState<V: VirtualMachine> {
    vm: V,
    /// Blocks awaiting execution. `None` marks a block with no parseable
    /// payload; the VM is not invoked for those.
    to_exec: VecDeque<Option<V::Block>>,
    /// Speculative proposals produced ahead of `get_proposal` calls. A
    /// `None` entry means the VM declined to propose that round.
    proposal_buffer: VecDeque<Option<V::Block>>,
    pending_requests: usize,
    /// Proposal buffer size target; zero once proposals are stopped.
    buffer_target: usize,
    is_proposer: bool,
    /// Newest commitment not yet logged to the VM; commits coalesce.
    pending_commit: Option<V::BlockId>,
    shutdown: bool,
}

impl<V: VirtualMachine> CtlState<V> {
    fn exists_work(&self) -> bool {
        !self.to_exec.is_empty()
            || (self.pending_requests > 0 && self.is_proposer)
            || self.pending_commit.is_some()
    }

    fn clear_proposal_settings(&mut self) {
        self.is_proposer = false;
        self.proposal_buffer.clear();
        self.pending_requests = 0;
    }
}

struct CtlShared<V: VirtualMachine> {
    state: Mutex<CtlState<V>>,
    work_ready: Condvar,
}

pub struct VmController<V: VirtualMachine> {
    shared: Arc<CtlShared<V>>,
    _worker: JoinOnDrop,
}

impl<V: VirtualMachine> VmController<V> {
    pub fn spawn(vm: V) -> Self {
        let shared = Arc::new(CtlShared {
            state: Mutex::new(CtlState {
                vm,
                to_exec: VecDeque::new(),
                proposal_buffer: VecDeque::new(),
                pending_requests: 0,
                buffer_target: PROPOSAL_BUFFER_TARGET,
                is_proposer: false,
                pending_commit: None,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = JoinOnDrop::spawn("vm-worker", move || run(worker_shared));
        Self {
            shared,
            _worker: worker,
        }
    }

    pub fn init_clean(&self) {
        self.shared.state.lock().vm.init_clean();
    }

    pub fn init_from_index(&self, index: &CommitIndex) {
        self.shared.state.lock().vm.init_from_index(index);
    }

    /// Enter proposer mode: the worker starts keeping the proposal buffer
    /// warm.
    pub fn set_proposer(&self) {
        let mut state = self.shared.state.lock();
        info!("vm controller entering proposer mode");
        state.is_proposer = true;
    }

    /// Stop producing proposals. Outstanding buffered proposals drain;
    /// `get_proposal` then returns `None`.
    pub fn stop_proposals(&self) {
        let mut state = self.shared.state.lock();
        state.buffer_target = 0;
        self.shared.work_ready.notify_all();
    }

    /// Pop the next speculative proposal, blocking while the buffer is
    /// empty and proposals are still permitted. Returns `None` when not in
    /// proposer mode, when proposals have been stopped and the buffer is
    /// dry, when the VM declined to propose, or on shutdown.
    pub fn get_proposal(&self) -> Option<V::Block> {
        let mut state = self.shared.state.lock();
        if !state.is_proposer {
            debug!("get_proposal outside proposer mode");
            return None;
        }
        if state.shutdown {
            return None;
        }

        if state.proposal_buffer.is_empty() {
            if state.buffer_target == 0 {
                debug!("proposals stopped and buffer empty");
                return None;
            }
            if state.pending_requests < state.buffer_target {
                state.pending_requests = state.buffer_target;
            }
            self.shared.work_ready.notify_all();
            // a submission for execution cancels the wait: it clears
            // proposer state and wakes everyone
            while state.proposal_buffer.is_empty()
                && !state.shutdown
                && state.is_proposer
                && state.buffer_target != 0
            {
                self.shared.work_ready.wait(&mut state);
            }
            if state.shutdown || state.proposal_buffer.is_empty() {
                return None;
            }
        }

        let out = state.proposal_buffer.pop_front().flatten();

        state.pending_requests = state
            .buffer_target
            .saturating_sub(state.proposal_buffer.len());
        if state.pending_requests > 0 {
            self.shared.work_ready.notify_all();
        }
        out
    }

    /// Queue a block for execution. Clears proposer-side state and cancels
    /// in-flight proposals first.
    pub fn submit_for_exec(&self, submission: Option<V::Block>) {
        let mut state = self.shared.state.lock();
        state.clear_proposal_settings();
        state.to_exec.push_back(submission);
        self.shared.work_ready.notify_all();
    }

    /// Record a commitment to forward to the VM, in commit order. Empty
    /// block ids are not logged; successive commitments coalesce to the
    /// newest.
    pub fn log_commitment(&self, id: V::BlockId) {
        let mut state = self.shared.state.lock();
        if id != V::empty_block_id() {
            state.pending_commit = Some(id);
            self.shared.work_ready.notify_all();
        }
    }

    /// Wait for the worker to drain, then rewind the VM to its last durable
    /// commit.
    pub fn finish_and_rewind(&self) {
        let mut state = self.shared.state.lock();
        while !state.shutdown && state.exists_work() {
            self.shared.work_ready.wait(&mut state);
        }
        if state.shutdown {
            return;
        }
        state.vm.rewind_to_last_commit();
    }

    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.work_ready.notify_all();
    }
}

impl<V: VirtualMachine> Drop for VmController<V> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<V: VirtualMachine>(shared: Arc<CtlShared<V>>) {
    loop {
        let mut state = shared.state.lock();
        while !state.shutdown && !state.exists_work() {
            shared.work_ready.wait(&mut state);
        }
        if state.shutdown {
            return;
        }

        while let Some(submission) = state.to_exec.pop_front() {
            if let Some(block) = submission {
                state.vm.exec_block(&block);
            }
        }

        if let Some(id) = state.pending_commit.take() {
            state.vm.log_commitment(id);
        }

        if state.pending_requests > 0 {
            if !state.is_proposer {
                // submit_for_exec resets both flags together; seeing one
                // without the other is a logic bug
                error!("vm worker woke with proposal requests outside proposer mode");
                state.pending_requests = 0;
            } else {
                let proposal = state.vm.propose();
                state.proposal_buffer.push_back(proposal);
                state.pending_requests -= 1;
            }
        }

        shared.work_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal deterministic VM: blocks are sequence numbers.
    struct SeqVm {
        next: u64,
        executed: Vec<u64>,
        committed: Vec<u64>,
    }

    impl SeqVm {
        fn new() -> Self {
            Self {
                next: 1,
                executed: Vec::new(),
                committed: Vec::new(),
            }
        }
    }

    impl VirtualMachine for SeqVm {
        type Block = u64;
        type BlockId = Option<u64>;

        fn init_clean(&mut self) {}
        fn init_from_index(&mut self, _index: &CommitIndex) {}

        fn propose(&mut self) -> Option<u64> {
            let n = self.next;
            self.next += 1;
            Some(n)
        }

        fn exec_block(&mut self, block: &u64) {
            self.executed.push(*block);
        }

        fn log_commitment(&mut self, id: Option<u64>) {
            if let Some(n) = id {
                self.committed.push(n);
            }
        }

        fn rewind_to_last_commit(&mut self) {}

        fn empty_block_id() -> Option<u64> {
            None
        }

        fn block_id(block: &u64) -> Option<u64> {
            Some(*block)
        }
    }

    #[test]
    fn test_get_proposal_requires_proposer_mode() {
        let controller = VmController::spawn(SeqVm::new());
        assert_eq!(controller.get_proposal(), None);
    }

    #[test]
    fn test_proposals_flow_in_order() {
        let controller = VmController::spawn(SeqVm::new());
        controller.set_proposer();
        assert_eq!(controller.get_proposal(), Some(1));
        assert_eq!(controller.get_proposal(), Some(2));
        assert_eq!(controller.get_proposal(), Some(3));
    }

    #[test]
    fn test_submission_cancels_proposer_mode() {
        let controller = VmController::spawn(SeqVm::new());
        controller.set_proposer();
        assert!(controller.get_proposal().is_some());

        controller.submit_for_exec(Some(99));
        // proposer state cleared; no blocking wait happens
        assert_eq!(controller.get_proposal(), None);

        controller.finish_and_rewind();
        let state = controller.shared.state.lock();
        assert!(state.vm.executed.contains(&99));
    }

    #[test]
    fn test_stop_proposals_drains_then_none() {
        let controller = VmController::spawn(SeqVm::new());
        controller.set_proposer();
        assert!(controller.get_proposal().is_some());
        controller.stop_proposals();
        // drain whatever was buffered, then None forever
        let mut saw_none = false;
        for _ in 0..PROPOSAL_BUFFER_TARGET + 2 {
            if controller.get_proposal().is_none() {
                saw_none = true;
                break;
            }
        }
        assert!(saw_none);
        assert_eq!(controller.get_proposal(), None);
    }

    #[test]
    fn test_commitments_reach_vm() {
        let controller = VmController::spawn(SeqVm::new());
        controller.submit_for_exec(Some(7));
        controller.log_commitment(Some(7));
        // empty ids are skipped
        controller.log_commitment(None);
        controller.finish_and_rewind();
        let state = controller.shared.state.lock();
        assert_eq!(state.vm.committed, vec![7]);
    }
}
