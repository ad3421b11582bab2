//! # Shared Crypto Crate
//!
//! Cryptographic primitives for Kestrel BFT: Ed25519 detached signatures
//! over 32-byte digests and blake3 content addressing.
//!
//! Consensus messages are never signed directly; callers hash the canonical
//! encoding of an object and sign the digest.

pub mod errors;
pub mod hashing;
pub mod signatures;

pub use errors::CryptoError;
pub use hashing::{hash_bytes, hash_encode};
pub use signatures::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
