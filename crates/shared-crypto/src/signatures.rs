//! # Ed25519 Signatures
//!
//! Detached signatures over 32-byte digests with deterministic nonces.
//!
//! Secret key material is zeroized on drop.

use crate::CryptoError;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use shared_types::Hash;
use zeroize::Zeroize;

/// Ed25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519PublicKey([u8; 32]);

impl Ed25519PublicKey {
    /// Create from bytes, validating that they encode a curve point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify a detached signature over a 32-byte digest.
    pub fn verify(&self, digest: &Hash, signature: &Ed25519Signature) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);

        verifying_key
            .verify(digest.as_slice(), &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Ed25519 detached signature (64 bytes).
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Signature(#[serde_as(as = "Bytes")] [u8; 64]);

impl Ed25519Signature {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// Ed25519 keypair.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        Self { signing_key }
    }

    /// Create from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Self { signing_key }
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a 32-byte digest (deterministic, no RNG needed).
    pub fn sign(&self, digest: &Hash) -> Ed25519Signature {
        let sig = self.signing_key.sign(digest.as_slice());
        Ed25519Signature(sig.to_bytes())
    }

    /// Get the secret seed (for key files).
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Drop for Ed25519KeyPair {
    fn drop(&mut self) {
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;

    #[test]
    fn test_sign_verify() {
        let keypair = Ed25519KeyPair::generate();
        let digest = hash_bytes(b"a block header");

        let signature = keypair.sign(&digest);
        assert!(keypair.public_key().verify(&digest, &signature).is_ok());
    }

    #[test]
    fn test_wrong_digest_fails() {
        let keypair = Ed25519KeyPair::generate();

        let signature = keypair.sign(&hash_bytes(b"digest1"));
        let result = keypair.public_key().verify(&hash_bytes(b"digest2"), &signature);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair1 = Ed25519KeyPair::generate();
        let keypair2 = Ed25519KeyPair::generate();
        let digest = hash_bytes(b"payload");

        let signature = keypair1.sign(&digest);
        assert!(keypair2.public_key().verify(&digest, &signature).is_err());
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = Ed25519KeyPair::from_seed([0xAB; 32]);
        let digest = hash_bytes(b"deterministic");

        assert_eq!(
            keypair.sign(&digest).as_bytes(),
            keypair.sign(&digest).as_bytes()
        );
    }

    #[test]
    fn test_seed_roundtrip() {
        let original = Ed25519KeyPair::generate();
        let restored = Ed25519KeyPair::from_seed(original.to_seed());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_signature_serde_roundtrip() {
        let keypair = Ed25519KeyPair::from_seed([1u8; 32]);
        let sig = keypair.sign(&hash_bytes(b"wire"));
        let bytes = bincode::serialize(&sig).unwrap();
        let back: Ed25519Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(sig, back);
    }
}
