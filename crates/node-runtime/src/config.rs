//! Replica configuration file.
//!
//! A static TOML file names the full replica set, this replica's id, and
//! its secret seed. There is no runtime reconfiguration; the file is read
//! once at startup.
//!
//! ```toml
//! self_id = 0
//! secret_seed_hex = "…64 hex chars…"
//! data_dir = "./data/replica-0"
//! propose = true
//!
//! [[replicas]]
//! id = 0
//! hostname = "127.0.0.1"
//! protocol_port = 9100
//! fetch_port = 9200
//! public_key_hex = "…64 hex chars…"
//! ```

use anyhow::{bail, Context};
use kestrel_consensus_types::{ReplicaConfig, ReplicaInfo};
use serde::Deserialize;
use shared_crypto::{Ed25519KeyPair, Ed25519PublicKey};
use shared_types::ReplicaId;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct ReplicaEntry {
    pub id: ReplicaId,
    pub hostname: String,
    pub protocol_port: u16,
    pub fetch_port: u16,
    pub public_key_hex: String,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub self_id: ReplicaId,
    pub secret_seed_hex: String,
    pub data_dir: PathBuf,
    /// Whether this replica runs the proposer driver.
    #[serde(default)]
    pub propose: bool,
    pub replicas: Vec<ReplicaEntry>,
}

fn decode_32(hex_str: &str, what: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).with_context(|| format!("{what} is not valid hex"))?;
    if bytes.len() != 32 {
        bail!("{what} must be 32 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        let config: NodeConfig = toml::from_str(&text).context("parsing config")?;
        if !config.replicas.iter().any(|r| r.id == config.self_id) {
            bail!("self_id {} is not in the replica set", config.self_id);
        }
        Ok(config)
    }

    /// Build the immutable replica set.
    pub fn replica_config(&self) -> anyhow::Result<ReplicaConfig> {
        let mut infos = Vec::with_capacity(self.replicas.len());
        for entry in &self.replicas {
            let key_bytes = decode_32(
                &entry.public_key_hex,
                &format!("public key of replica {}", entry.id),
            )?;
            let public_key = Ed25519PublicKey::from_bytes(key_bytes)
                .map_err(|e| anyhow::anyhow!("replica {}: {e}", entry.id))?;
            infos.push(ReplicaInfo {
                id: entry.id,
                hostname: entry.hostname.clone(),
                protocol_port: entry.protocol_port,
                fetch_port: entry.fetch_port,
                public_key,
            });
        }
        Ok(ReplicaConfig::new(infos)?)
    }

    /// This replica's signing key.
    pub fn keypair(&self) -> anyhow::Result<Ed25519KeyPair> {
        let seed = decode_32(&self.secret_seed_hex, "secret seed")?;
        let keypair = Ed25519KeyPair::from_seed(seed);

        // the configured public key for self_id must match the seed
        let configured = self
            .replicas
            .iter()
            .find(|r| r.id == self.self_id)
            .map(|r| decode_32(&r.public_key_hex, "own public key"))
            .transpose()?;
        if let Some(expected) = configured {
            if keypair.public_key().as_bytes() != &expected {
                bail!("secret seed does not match the configured public key");
            }
        }
        Ok(keypair)
    }
}
