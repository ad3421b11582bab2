//! The virtual machine contract.

use kestrel_block_store::CommitIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// What the engine requires of an application VM.
///
/// All methods are called from a single dedicated thread, so implementations
/// need no internal synchronization. `propose` may leave the VM in a
/// speculative future state; `exec_block` is responsible for reverting any
/// leftover speculation before executing, and `rewind_to_last_commit`
/// restores the last durably committed state.
pub trait VirtualMachine: Send + 'static {
    /// The application block produced and executed by this VM. Encoded with
    /// bincode into the opaque consensus block body.
    type Block: Serialize + DeserializeOwned + Send;

    /// Opaque identifier whose equality defines "same application state".
    type BlockId: Clone + Eq + Debug + Serialize + DeserializeOwned + Send;

    /// Start from an empty state.
    fn init_clean(&mut self);

    /// Start from durable state, replaying the committed-block index.
    fn init_from_index(&mut self, index: &CommitIndex);

    /// Produce the next speculative block, or `None` to propose nothing
    /// this round.
    fn propose(&mut self) -> Option<Self::Block>;

    /// Drive deterministic state forward with a block ordered by consensus.
    fn exec_block(&mut self, block: &Self::Block);

    /// A previously executed block is now final.
    fn log_commitment(&mut self, id: Self::BlockId);

    /// Discard all speculative state.
    fn rewind_to_last_commit(&mut self);

    /// The id of "no application payload at this height".
    fn empty_block_id() -> Self::BlockId;

    /// The id of a concrete block.
    fn block_id(block: &Self::Block) -> Self::BlockId;
}
