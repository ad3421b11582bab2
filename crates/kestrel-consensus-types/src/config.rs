//! Replica membership configuration.
//!
//! The replica set is fixed for the lifetime of the process: ids, peer
//! addresses, and public keys are loaded once at startup and never change.

use shared_crypto::Ed25519PublicKey;
use shared_types::{ReplicaId, MAX_REPLICAS};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Membership configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Replica id registered twice
    #[error("replica id {0} registered twice")]
    DuplicateReplica(ReplicaId),

    /// Replica id outside the supported range
    #[error("replica id {0} exceeds the supported maximum of {MAX_REPLICAS}")]
    ReplicaIdOutOfRange(ReplicaId),

    /// Lookup of an id not in the set
    #[error("unknown replica id {0}")]
    UnknownReplica(ReplicaId),

    /// Empty replica set
    #[error("replica set is empty")]
    EmptyReplicaSet,
}

/// One replica's identity: id, where to reach it, and its signing key.
#[derive(Clone, Debug)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub hostname: String,
    /// Port of the vote/proposal service.
    pub protocol_port: u16,
    /// Port of the block-fetch service.
    pub fetch_port: u16,
    pub public_key: Ed25519PublicKey,
}

impl ReplicaInfo {
    pub fn protocol_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.protocol_port)
    }

    pub fn fetch_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.fetch_port)
    }
}

/// The full replica set plus derived quorum thresholds.
///
/// Immutable after construction. `nmajority = n - floor(n/3)` distinct
/// signers constitute a quorum.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    pub nreplicas: usize,
    pub nmajority: usize,
}

impl ReplicaConfig {
    pub fn new(infos: impl IntoIterator<Item = ReplicaInfo>) -> Result<Self, ConfigError> {
        let mut replicas = BTreeMap::new();
        for info in infos {
            if info.id as usize >= MAX_REPLICAS {
                return Err(ConfigError::ReplicaIdOutOfRange(info.id));
            }
            if replicas.insert(info.id, info.clone()).is_some() {
                return Err(ConfigError::DuplicateReplica(info.id));
            }
        }
        if replicas.is_empty() {
            return Err(ConfigError::EmptyReplicaSet);
        }

        let nreplicas = replicas.len();
        let nfaulty = nreplicas / 3;
        if nfaulty == 0 {
            warn!(nreplicas, "replica set tolerates zero faults");
        }
        Ok(Self {
            replicas,
            nreplicas,
            nmajority: nreplicas - nfaulty,
        })
    }

    pub fn info(&self, rid: ReplicaId) -> Result<&ReplicaInfo, ConfigError> {
        self.replicas
            .get(&rid)
            .ok_or(ConfigError::UnknownReplica(rid))
    }

    pub fn public_key(&self, rid: ReplicaId) -> Result<&Ed25519PublicKey, ConfigError> {
        Ok(&self.info(rid)?.public_key)
    }

    pub fn is_valid_replica(&self, rid: ReplicaId) -> bool {
        self.replicas.contains_key(&rid)
    }

    /// All replicas, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::Ed25519KeyPair;

    fn info(id: ReplicaId) -> ReplicaInfo {
        ReplicaInfo {
            id,
            hostname: "127.0.0.1".into(),
            protocol_port: 9100 + id as u16,
            fetch_port: 9200 + id as u16,
            public_key: Ed25519KeyPair::from_seed([id as u8; 32]).public_key(),
        }
    }

    #[test]
    fn test_quorum_thresholds() {
        for (n, expected) in [(1, 1), (3, 2), (4, 3), (7, 5), (10, 7)] {
            let config = ReplicaConfig::new((0..n).map(info)).unwrap();
            assert_eq!(config.nreplicas, n as usize);
            assert_eq!(config.nmajority, expected, "n = {n}");
        }
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let result = ReplicaConfig::new(vec![info(0), info(0)]);
        assert!(matches!(result, Err(ConfigError::DuplicateReplica(0))));
    }

    #[test]
    fn test_out_of_range_replica_rejected() {
        let result = ReplicaConfig::new(vec![info(MAX_REPLICAS as ReplicaId)]);
        assert!(matches!(result, Err(ConfigError::ReplicaIdOutOfRange(_))));
    }

    #[test]
    fn test_lookup() {
        let config = ReplicaConfig::new((0..4).map(info)).unwrap();
        assert!(config.is_valid_replica(3));
        assert!(!config.is_valid_replica(4));
        assert!(config.info(2).is_ok());
        assert!(matches!(config.info(9), Err(ConfigError::UnknownReplica(9))));
    }
}
