//! Fetch server handler.
//!
//! Answers batched hash requests with whatever is still resident in the
//! memory cache. Blocks that were flushed by the garbage collector are
//! omitted: requesters make progress through other peers or newer blocks.

use crate::messages::{BlockFetchRequest, BlockFetchResponse};
use kestrel_block_store::BlockStore;
use shared_types::short_hex;
use std::sync::Arc;
use tracing::debug;

pub struct FetchService {
    store: Arc<BlockStore>,
}

impl FetchService {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }

    pub fn fetch(&self, req: &BlockFetchRequest) -> BlockFetchResponse {
        let mut responses = Vec::new();
        for hash in &req.reqs {
            let Some(block) = self.store.get(hash) else {
                debug!(block = %short_hex(hash), "fetch miss");
                continue;
            };
            if block.is_flushed() {
                debug!(block = %short_hex(hash), "fetch hit a flushed block, omitted");
                continue;
            }
            match block.to_wire() {
                Ok(wire) => responses.push(wire),
                // flushed between the check and the read; same as a miss
                Err(_) => continue,
            }
        }
        BlockFetchResponse { responses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_block_store::{Block, BlockArchive};
    use kestrel_consensus_types::QuorumCertificate;
    use shared_types::ZERO_HASH;

    #[test]
    fn test_serves_resident_blocks_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(BlockArchive::open(dir.path()).unwrap());
        let genesis = Block::genesis();
        let store = Arc::new(BlockStore::new(genesis, archive));

        let block =
            Block::mint(b"b1".to_vec(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
        store.insert(Arc::clone(&block)).unwrap();

        let service = FetchService::new(Arc::clone(&store));
        let response = service.fetch(&BlockFetchRequest {
            reqs: vec![*block.hash(), [9u8; 32]],
        });

        assert_eq!(response.responses.len(), 1);
        assert_eq!(&response.responses[0].hash().unwrap(), block.hash());
    }
}
