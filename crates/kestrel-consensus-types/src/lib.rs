//! # Kestrel Consensus Types
//!
//! Leaf types shared by the consensus stack: replica membership and quorum
//! thresholds, and the partial / quorum certificates that carry votes.
//!
//! These live below the block store so that blocks can embed certificates
//! without depending on the consensus state machine.

pub mod certificates;
pub mod config;

pub use certificates::{CertificateError, PartialCertificate, QuorumCertificate};
pub use config::{ConfigError, ReplicaConfig, ReplicaInfo};
