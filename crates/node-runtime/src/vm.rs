//! A minimal stand-in application VM.
//!
//! Orders opaque counter blocks; real deployments supply their own
//! [`VirtualMachine`] implementation. Useful for bringing a cluster up
//! end-to-end and in tests.

use kestrel_block_store::CommitIndex;
use kestrel_vm_bridge::VirtualMachine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBlock {
    pub seq: u64,
}

/// Executes a strictly increasing sequence of counter blocks.
#[derive(Default)]
pub struct CounterVm {
    /// Next sequence number to propose (speculative).
    next_seq: u64,
    /// Highest executed sequence number.
    executed: Option<u64>,
    /// Highest committed sequence number.
    committed: Option<u64>,
}

impl CounterVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }
}

impl VirtualMachine for CounterVm {
    type Block = CounterBlock;
    type BlockId = Option<u64>;

    fn init_clean(&mut self) {
        self.next_seq = 0;
        self.executed = None;
        self.committed = None;
    }

    fn init_from_index(&mut self, index: &CommitIndex) {
        for (height, _hash, id_bytes) in index.entries() {
            match bincode::deserialize::<Option<u64>>(&id_bytes) {
                Ok(Some(seq)) => {
                    self.executed = Some(seq);
                    self.committed = Some(seq);
                    self.next_seq = seq + 1;
                }
                Ok(None) => {}
                Err(err) => debug!(height, %err, "unreadable vm id in commit index"),
            }
        }
        info!(committed = ?self.committed, "counter vm restored");
    }

    fn propose(&mut self) -> Option<CounterBlock> {
        let block = CounterBlock { seq: self.next_seq };
        self.next_seq += 1;
        Some(block)
    }

    fn exec_block(&mut self, block: &CounterBlock) {
        self.executed = Some(block.seq);
        self.next_seq = block.seq + 1;
    }

    fn log_commitment(&mut self, id: Option<u64>) {
        if let Some(seq) = id {
            self.committed = Some(seq);
        }
    }

    fn rewind_to_last_commit(&mut self) {
        self.executed = self.committed;
        self.next_seq = self.committed.map(|seq| seq + 1).unwrap_or(0);
    }

    fn empty_block_id() -> Option<u64> {
        None
    }

    fn block_id(block: &CounterBlock) -> Option<u64> {
        Some(block.seq)
    }
}
