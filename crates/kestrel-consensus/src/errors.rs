//! Consensus core error types.

use crate::ports::HookError;
use kestrel_block_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the consensus core.
///
/// Every variant here indicates a bug or a broken environment rather than a
/// recoverable protocol condition; malformed input is filtered and dropped
/// upstream and never reaches the core as an error.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A structural invariant did not hold (e.g. a freshly minted block
    /// failed insertion)
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The commit walk did not land on the previously executed block
    #[error("consensus safety violated: committed chain diverged from b_exec")]
    SafetyViolation,

    /// Durable storage failed while committing
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The execution bridge rejected a commit-path call
    #[error(transparent)]
    Hook(#[from] HookError),
}
