//! Core identifier types.
//!
//! Blocks are content-addressed by a 32-byte digest of their header;
//! replicas are numbered densely from zero.

/// A 32-byte content hash (blake3).
pub type Hash = [u8; 32];

/// The all-zero hash. Reserved for the genesis block; no real block hashes
/// to it.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Identifier of a replica in the configured set, in `[0, nreplicas)`.
pub type ReplicaId = u32;

/// Upper bound on replica ids. Request bookkeeping uses a `u64` bitmap of
/// replica ids, so ids at or above this are rejected outright.
pub const MAX_REPLICAS: usize = 64;

/// Abbreviated hex rendering of a hash for log lines.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}
