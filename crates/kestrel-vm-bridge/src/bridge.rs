//! The consensus ↔ VM bridge.
//!
//! Implements the core's execution hooks on top of the VM controller and
//! the speculation gadget. Block bodies are bincode-encoded VM blocks; an
//! empty or unparseable body is valid at the consensus level and reaches
//! the VM as "no payload".

use crate::controller::VmController;
use crate::errors::BridgeError;
use crate::speculation::SpeculationTracker;
use crate::vm::VirtualMachine;
use kestrel_block_store::{Block, CommitIndex};
use kestrel_consensus::{ExecutionHooks, HookError};
use shared_types::short_hex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct VmBridge<V: VirtualMachine> {
    speculation: SpeculationTracker<V::BlockId>,
    controller: VmController<V>,
}

impl<V: VirtualMachine> VmBridge<V> {
    pub fn new(vm: V) -> Self {
        Self {
            speculation: SpeculationTracker::new(),
            controller: VmController::spawn(vm),
        }
    }

    /// Start the VM from scratch.
    pub fn init_clean(&self) {
        self.controller.init_clean();
    }

    /// Start the VM from durable state and seed the speculation gadget at
    /// the recovered commit frontier.
    pub fn init_from_index(&self, index: &CommitIndex) {
        let highest = index.highest_height().unwrap_or(0);
        self.controller.init_from_index(index);
        self.speculation.lock().init_from_height(highest);
        info!(highest, "vm bridge restored from commit index");
    }

    pub fn set_proposer(&self) {
        self.controller.set_proposer();
    }

    pub fn stop_proposals(&self) {
        self.controller.stop_proposals();
    }

    /// Register an empty speculative entry for a proposal round that
    /// carries no payload. Returns the (empty) consensus body.
    pub fn make_empty_proposal(&self, proposal_height: u64) -> Vec<u8> {
        let mut speculation = self.speculation.lock();
        speculation.add_height_pair(proposal_height, V::empty_block_id());
        Vec::new()
    }

    /// Pull the next speculative proposal from the VM, register it at
    /// `proposal_height`, and return its encoded body (empty if the VM
    /// declined).
    pub fn get_and_apply_next_proposal(
        &self,
        proposal_height: u64,
    ) -> Result<Vec<u8>, BridgeError> {
        let mut speculation = self.speculation.lock();
        match self.controller.get_proposal() {
            None => {
                speculation.add_height_pair(proposal_height, V::empty_block_id());
                Ok(Vec::new())
            }
            Some(block) => {
                speculation.add_height_pair(proposal_height, V::block_id(&block));
                bincode::serialize(&block).map_err(|e| BridgeError::Encoding(e.to_string()))
            }
        }
    }

    /// Drain outstanding VM work and rewind to the last durable commit.
    pub fn finish_and_rewind(&self) {
        self.controller.finish_and_rewind();
        self.speculation.lock().clear();
    }

    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    fn parse_body(block: &Arc<Block>) -> Option<V::Block> {
        let body = block.body()?;
        if body.is_empty() {
            return None;
        }
        match bincode::deserialize(&body) {
            Ok(vm_block) => Some(vm_block),
            Err(err) => {
                debug!(
                    block = %short_hex(block.hash()),
                    %err,
                    "block body failed to parse, treated as no payload"
                );
                None
            }
        }
    }
}

impl<V: VirtualMachine> ExecutionHooks for VmBridge<V> {
    fn apply_block(&self, block: &Arc<Block>) {
        let mut speculation = self.speculation.lock();

        let parsed = Self::parse_body(block);
        let block_id = parsed
            .as_ref()
            .map(V::block_id)
            .unwrap_or_else(V::empty_block_id);

        // If the lowest speculative entry matches, the VM is already
        // executing this chain.
        if let Some((_, speculative_id)) = speculation.lowest() {
            if *speculative_id == block_id {
                debug!(
                    height = block.height(),
                    "committed block matches speculation"
                );
                return;
            }
        }

        // Divergence (or no speculation at all): roll back, re-seed at this
        // block, and hand it to the VM.
        speculation.clear();
        speculation.add_height_pair(block.height(), block_id);
        self.controller.submit_for_exec(parsed);
    }

    fn commitment_id(&self, block: &Arc<Block>) -> Result<Vec<u8>, HookError> {
        let mut speculation = self.speculation.lock();
        let id = speculation
            .on_commit(block.height())
            .map_err(|e| HookError(e.to_string()))?;
        self.controller.log_commitment(id.clone());
        bincode::serialize(&id).map_err(|e| HookError(e.to_string()))
    }
}
