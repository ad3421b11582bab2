//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Invalid signature encoding
    #[error("Invalid signature encoding")]
    InvalidSignature,

    /// Object could not be canonically encoded for hashing
    #[error("Canonical encoding failed: {0}")]
    EncodingFailed(String),
}
