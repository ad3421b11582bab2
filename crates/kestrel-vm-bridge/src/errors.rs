//! Bridge error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A VM block failed to encode for the consensus body
    #[error("vm block encoding failed: {0}")]
    Encoding(String),
}
