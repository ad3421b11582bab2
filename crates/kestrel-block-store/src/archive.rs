//! Durable block archive.
//!
//! One file per block, named by the hex of the header hash. Identical hash
//! means identical content, so rewrites are harmless; writes go through a
//! temp file and an atomic rename.

use crate::block::BlockWire;
use crate::errors::StoreError;
use shared_types::Hash;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct BlockArchive {
    dir: PathBuf,
}

impl BlockArchive {
    /// Open (creating if needed) the archive directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hex::encode(hash))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.path_for(hash).exists()
    }

    /// Persist a wire block under its hash.
    pub fn save(&self, hash: &Hash, wire: &BlockWire) -> Result<(), StoreError> {
        let bytes = bincode::serialize(wire).map_err(|e| StoreError::Encoding(e.to_string()))?;

        let path = self.path_for(hash);
        let tmp = path.with_extension("tmp");
        let io_err = |e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        };

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    /// Load a wire block by hash.
    pub fn load(&self, hash: &Hash) -> Result<BlockWire, StoreError> {
        let path = self.path_for(hash);
        if !path.exists() {
            return Err(StoreError::NotArchived(hex::encode(&hash[..4])));
        }
        let bytes = fs::read(&path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        bincode::deserialize(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use kestrel_consensus_types::QuorumCertificate;
    use shared_types::ZERO_HASH;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = BlockArchive::open(dir.path()).unwrap();

        let block =
            Block::mint(b"payload".to_vec(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
        let wire = block.to_wire().unwrap();

        assert!(!archive.contains(block.hash()));
        archive.save(block.hash(), &wire).unwrap();
        assert!(archive.contains(block.hash()));

        let loaded = archive.load(block.hash()).unwrap();
        assert_eq!(loaded, wire);
        assert_eq!(&loaded.hash().unwrap(), block.hash());
    }

    #[test]
    fn test_load_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let archive = BlockArchive::open(dir.path()).unwrap();
        assert!(matches!(
            archive.load(&[7u8; 32]),
            Err(StoreError::NotArchived(_))
        ));
    }

    #[test]
    fn test_rewrite_same_hash_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = BlockArchive::open(dir.path()).unwrap();

        let block = Block::mint(b"x".to_vec(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
        let wire = block.to_wire().unwrap();
        archive.save(block.hash(), &wire).unwrap();
        archive.save(block.hash(), &wire).unwrap();
        assert_eq!(archive.load(block.hash()).unwrap(), wire);
    }
}
