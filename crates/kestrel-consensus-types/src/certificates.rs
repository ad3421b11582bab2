//! Vote certificates.
//!
//! A `PartialCertificate` is one replica's signature over a block hash; a
//! `QuorumCertificate` aggregates partials from distinct replicas. Signatures
//! are verified lazily: accumulation only checks the hash and the replica id,
//! and `verify` does the cryptographic work when the certificate is actually
//! relied upon.

use serde::{Deserialize, Serialize};
use shared_crypto::{Ed25519KeyPair, Ed25519Signature};
use shared_types::{short_hex, Hash, ReplicaId, MAX_REPLICAS, ZERO_HASH};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::config::ReplicaConfig;
use crate::config::ReplicaInfo;

/// Certificate accumulation errors.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Partial certificate merged into a certificate for a different block
    #[error("partial certificate for {partial} merged into certificate for {certificate}")]
    HashMismatch {
        partial: String,
        certificate: String,
    },

    /// Replica id outside the supported range
    #[error("invalid replica id {0}")]
    BadReplica(ReplicaId),

    /// Signature does not verify under the signer's public key
    #[error("bad signature")]
    BadSignature,
}

/// A single replica's signature over a block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCertificate {
    pub block_hash: Hash,
    pub signature: Ed25519Signature,
}

impl PartialCertificate {
    /// Sign `block_hash` with the local secret key.
    pub fn create(block_hash: Hash, keypair: &Ed25519KeyPair) -> Self {
        Self {
            block_hash,
            signature: keypair.sign(&block_hash),
        }
    }

    /// Verify the signature under the signer's public key.
    pub fn validate(&self, info: &ReplicaInfo) -> Result<(), CertificateError> {
        info.public_key
            .verify(&self.block_hash, &self.signature)
            .map_err(|_| CertificateError::BadSignature)
    }
}

/// An aggregate of partial certificates over one block hash.
///
/// The map keys are replica ids, so bincode encoding is canonical (sorted)
/// and the certificate can be embedded in hashed block headers directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    block_hash: Hash,
    signatures: BTreeMap<ReplicaId, Ed25519Signature>,
}

impl QuorumCertificate {
    /// Empty certificate for the given block hash.
    pub fn new(block_hash: Hash) -> Self {
        Self {
            block_hash,
            signatures: BTreeMap::new(),
        }
    }

    /// The distinguished certificate for the genesis block. Vacuously valid.
    pub fn genesis() -> Self {
        Self::new(ZERO_HASH)
    }

    pub fn block_hash(&self) -> &Hash {
        &self.block_hash
    }

    pub fn signer_count(&self) -> usize {
        self.signatures.len()
    }

    /// Merge one replica's partial certificate. A later partial from the same
    /// replica overwrites the earlier one.
    pub fn add_partial(
        &mut self,
        rid: ReplicaId,
        partial: &PartialCertificate,
    ) -> Result<(), CertificateError> {
        if partial.block_hash != self.block_hash {
            return Err(CertificateError::HashMismatch {
                partial: short_hex(&partial.block_hash),
                certificate: short_hex(&self.block_hash),
            });
        }
        if rid as usize >= MAX_REPLICAS {
            return Err(CertificateError::BadReplica(rid));
        }
        self.signatures.insert(rid, partial.signature);
        Ok(())
    }

    /// Count-only quorum check: at least `nmajority` distinct signers are
    /// present. Cheaper than `verify`, and sufficient while accumulating
    /// partials that were already validated on arrival.
    pub fn has_quorum(&self, config: &ReplicaConfig) -> bool {
        self.signatures.len() >= config.nmajority
    }

    /// Full verification: at least `nmajority` entries are valid signatures
    /// of `block_hash` by configured replicas. The genesis certificate is
    /// vacuously valid.
    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        if self.block_hash == ZERO_HASH {
            return true;
        }
        if self.signatures.len() < config.nmajority {
            return false;
        }
        let mut n_valid = 0;
        for (rid, signature) in &self.signatures {
            let Ok(pk) = config.public_key(*rid) else {
                debug!(rid, "certificate carries signature from unknown replica");
                continue;
            };
            if pk.verify(&self.block_hash, signature).is_ok() {
                n_valid += 1;
            }
        }
        n_valid >= config.nmajority
    }
}
