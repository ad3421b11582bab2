//! # BLAKE3 Hashing
//!
//! Content addressing for blocks and wire objects.

use crate::CryptoError;
use serde::Serialize;
use shared_types::Hash;

/// Hash raw bytes with BLAKE3 (one-shot).
pub fn hash_bytes(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Canonically encode a value with bincode, then hash the encoding.
///
/// This is how block headers obtain their content address: the digest covers
/// the exact bytes that travel on the wire.
pub fn hash_encode<T: Serialize>(value: &T) -> Result<Hash, CryptoError> {
    let bytes =
        bincode::serialize(value).map_err(|e| CryptoError::EncodingFailed(e.to_string()))?;
    Ok(hash_bytes(&bytes))
}
