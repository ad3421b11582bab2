//! The in-memory block store.
//!
//! A mutex-guarded map from header hash to live block, seeded with the
//! genesis sentinel. Insertion is dependency-checked: a block is only
//! admitted once both its parent and its justify target are resident, at
//! which point its links and height are seated. Committed blocks are
//! persisted through the archive; blocks below the committed frontier are
//! handed to the garbage collector.

use crate::archive::BlockArchive;
use crate::block::Block;
use crate::errors::StoreError;
use crate::gc::GarbageCollector;
use parking_lot::Mutex;
use shared_types::{short_hex, Hash};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a successful insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted,
    /// A block with the same hash is already resident; the store is
    /// unchanged.
    AlreadyPresent,
}

/// The dependencies that kept a block out of the store.
///
/// Expected and non-fatal at the network layer: the caller registers
/// fetches for the listed hashes and retries once they arrive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingDependencies {
    pub parent_hash: Option<Hash>,
    pub justify_hash: Option<Hash>,
}

pub struct BlockStore {
    cache: Arc<Mutex<HashMap<Hash, Arc<Block>>>>,
    archive: Arc<BlockArchive>,
    gc: GarbageCollector,
}

impl BlockStore {
    /// Create a store seeded with the genesis sentinel and spawn its
    /// garbage collector.
    pub fn new(genesis: Arc<Block>, archive: Arc<BlockArchive>) -> Self {
        let mut map = HashMap::new();
        map.insert(*genesis.hash(), genesis);
        let cache = Arc::new(Mutex::new(map));
        let gc = GarbageCollector::spawn(Arc::clone(&cache));
        Self { cache, archive, gc }
    }

    /// Admit a block whose parent and justify target are already resident.
    ///
    /// On success the block's parent/justify references and height
    /// (`parent.height + 1`) are seated and the block becomes visible to
    /// readers. Re-inserting an identical hash is a no-op. If either
    /// dependency is absent the store is unchanged and the missing hashes
    /// are reported.
    pub fn insert(&self, block: Arc<Block>) -> Result<InsertStatus, MissingDependencies> {
        let mut cache = self.cache.lock();

        if cache.contains_key(block.hash()) {
            return Ok(InsertStatus::AlreadyPresent);
        }

        let parent = cache.get(block.parent_hash()).cloned();
        let justify = cache.get(block.justify_hash()).cloned();

        let (parent, justify) = match (parent, justify) {
            (Some(parent), Some(justify)) => (parent, justify),
            (parent, justify) => {
                let missing = MissingDependencies {
                    parent_hash: parent.is_none().then(|| *block.parent_hash()),
                    justify_hash: justify.is_none().then(|| *block.justify_hash()),
                };
                debug!(
                    block = %short_hex(block.hash()),
                    missing_parent = missing.parent_hash.is_some(),
                    missing_justify = missing.justify_hash.is_some(),
                    "block not admitted, dependencies missing"
                );
                return Err(missing);
            }
        };

        block.seat_parent(parent);
        block.seat_justify(justify);
        cache.insert(*block.hash(), Arc::clone(&block));
        drop(cache);

        self.gc.track(block);
        Ok(InsertStatus::Inserted)
    }

    /// Fetch a resident block. Memory only: evicted blocks return `None`
    /// even when archived on disk.
    pub fn get(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.cache.lock().get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.cache.lock().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Persist a block and any not-yet-persisted ancestors to the archive.
    ///
    /// Must be called for every block about to be committed, before it is
    /// executed. Each block is written at most once; the walk stops at the
    /// first ancestor that already claimed its write.
    pub fn write_to_disk(&self, hash: &Hash) -> Result<(), StoreError> {
        let block = self
            .get(hash)
            .ok_or_else(|| StoreError::MissingForPersist(short_hex(hash)))?;

        let mut cur = Some(block);
        while let Some(b) = cur {
            if !b.claim_disk_write() {
                break;
            }
            let wire = b.to_wire()?;
            self.archive.save(b.hash(), &wire)?;
            cur = b.parent();
        }
        Ok(())
    }

    /// Mark every tracked block strictly below `height` as eligible for
    /// memory eviction. Collection happens on the GC worker.
    pub fn prune_below_height(&self, height: u64) {
        self.gc.invoke(height);
    }

    pub fn archive(&self) -> &Arc<BlockArchive> {
        &self.archive
    }
}
