//! Block entities.
//!
//! A block travels on the wire as a header (parent hash, justify
//! certificate, body hash) plus an opaque application body. On admission to
//! the store it gains derived attributes: its height, owning references to
//! its parent and justify blocks, and commit-status flags.

use kestrel_consensus_types::{CertificateError, PartialCertificate, QuorumCertificate, ReplicaConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_crypto::{hash_bytes, hash_encode};
use shared_types::{short_hex, Hash, ReplicaId, ZERO_HASH};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::errors::StoreError;

/// The hashed portion of a block.
///
/// The block's content address is the blake3 digest of this header's
/// canonical encoding; the body is covered through `body_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: Hash,
    pub justify: QuorumCertificate,
    pub body_hash: Hash,
}

/// A block in wire form: header plus opaque body bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWire {
    pub header: BlockHeader,
    pub body: Vec<u8>,
}

impl BlockWire {
    /// The content address of this wire block.
    pub fn hash(&self) -> Result<Hash, StoreError> {
        hash_encode(&self.header).map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

/// A block held by the store.
///
/// Shared between the store, the fetch subsystem, the event pipeline and the
/// consensus core; the longest holder keeps it alive. Parent and justify are
/// strong references so an ancestor cannot be collected while a descendant
/// still references it.
pub struct Block {
    header: BlockHeader,
    hash: Hash,
    /// Opaque application body. `None` once flushed by the garbage
    /// collector.
    body: Mutex<Option<Vec<u8>>>,

    // Derived on insertion into the store.
    height: AtomicU64,
    parent: OnceLock<Arc<Block>>,
    justify_block: OnceLock<Arc<Block>>,

    /// Votes received for this block, accumulated toward a quorum.
    self_qc: Mutex<QuorumCertificate>,

    decided: AtomicBool,
    applied: AtomicBool,
    written_to_disk: AtomicBool,
    self_produced: bool,
    genesis: bool,
}

impl Block {
    /// The distinguished genesis sentinel: height 0, zero hash, already
    /// decided, applied and on disk.
    pub fn genesis() -> Arc<Self> {
        Arc::new(Self {
            header: BlockHeader {
                parent_hash: ZERO_HASH,
                justify: QuorumCertificate::genesis(),
                body_hash: ZERO_HASH,
            },
            hash: ZERO_HASH,
            body: Mutex::new(Some(Vec::new())),
            height: AtomicU64::new(0),
            parent: OnceLock::new(),
            justify_block: OnceLock::new(),
            self_qc: Mutex::new(QuorumCertificate::genesis()),
            decided: AtomicBool::new(true),
            applied: AtomicBool::new(true),
            written_to_disk: AtomicBool::new(true),
            self_produced: false,
            genesis: true,
        })
    }

    /// Wrap a block received from the network.
    pub fn from_wire(wire: BlockWire) -> Result<Arc<Self>, StoreError> {
        let hash = wire.hash()?;
        Ok(Arc::new(Self::with_hash(wire, hash, false)))
    }

    /// Mint a locally produced block on top of `parent_hash`, justified by
    /// `justify`.
    pub fn mint(
        body: Vec<u8>,
        justify: QuorumCertificate,
        parent_hash: Hash,
    ) -> Result<Arc<Self>, StoreError> {
        let wire = BlockWire {
            header: BlockHeader {
                parent_hash,
                justify,
                body_hash: hash_bytes(&body),
            },
            body,
        };
        let hash = wire.hash()?;
        Ok(Arc::new(Self::with_hash(wire, hash, true)))
    }

    fn with_hash(wire: BlockWire, hash: Hash, self_produced: bool) -> Self {
        Self {
            header: wire.header,
            hash,
            body: Mutex::new(Some(wire.body)),
            height: AtomicU64::new(0),
            parent: OnceLock::new(),
            justify_block: OnceLock::new(),
            self_qc: Mutex::new(QuorumCertificate::new(hash)),
            decided: AtomicBool::new(false),
            applied: AtomicBool::new(false),
            written_to_disk: AtomicBool::new(false),
            self_produced,
            genesis: false,
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn parent_hash(&self) -> &Hash {
        &self.header.parent_hash
    }

    /// The certificate this block extends for safety.
    pub fn justify(&self) -> &QuorumCertificate {
        &self.header.justify
    }

    pub fn justify_hash(&self) -> &Hash {
        self.header.justify.block_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.genesis
    }

    pub fn is_self_produced(&self) -> bool {
        self.self_produced
    }

    /// Height in the DAG. Zero until admitted to the store (and forever for
    /// genesis).
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    /// True once the store has admitted this block and seated its links.
    pub fn is_admitted(&self) -> bool {
        self.genesis || self.height() > 0
    }

    pub fn parent(&self) -> Option<Arc<Block>> {
        self.parent.get().cloned()
    }

    pub fn justify_block(&self) -> Option<Arc<Block>> {
        self.justify_block.get().cloned()
    }

    /// Seat the parent link and derive the height. Store-internal; a block's
    /// links are seated exactly once.
    pub(crate) fn seat_parent(&self, parent: Arc<Block>) {
        self.height
            .store(parent.height() + 1, Ordering::Release);
        let _ = self.parent.set(parent);
    }

    pub(crate) fn seat_justify(&self, justify_block: Arc<Block>) {
        let _ = self.justify_block.set(justify_block);
    }

    /// A copy of the body, or `None` if it has been flushed from memory.
    pub fn body(&self) -> Option<Vec<u8>> {
        self.body.lock().clone()
    }

    pub fn is_flushed(&self) -> bool {
        self.body.lock().is_none()
    }

    /// Drop the body from memory. Only the garbage collector calls this,
    /// and only for blocks below the committed frontier.
    pub(crate) fn flush_body(&self) {
        *self.body.lock() = None;
    }

    /// Reconstruct the wire form. Fails if the body has already been
    /// flushed, which is an invariant violation on any path that persists
    /// blocks.
    pub fn to_wire(&self) -> Result<BlockWire, StoreError> {
        let body = self
            .body
            .lock()
            .clone()
            .ok_or_else(|| StoreError::BodyFlushed(short_hex(&self.hash)))?;
        Ok(BlockWire {
            header: self.header.clone(),
            body,
        })
    }

    /// Basic HotStuff validity: the body matches the header's body hash and
    /// the justify certificate carries a verified quorum.
    pub fn validate_hotstuff(&self, config: &ReplicaConfig) -> bool {
        match self.body.lock().as_ref() {
            Some(body) => {
                if hash_bytes(body) != self.header.body_hash {
                    debug!(
                        block = %short_hex(&self.hash),
                        "body hash does not match header"
                    );
                    return false;
                }
            }
            None => return false,
        }
        self.header.justify.verify(config)
    }

    /// Merge a vote into this block's certificate-under-construction and
    /// return a snapshot of the accumulated certificate.
    pub fn add_vote(
        &self,
        voter: ReplicaId,
        partial: &PartialCertificate,
    ) -> Result<QuorumCertificate, CertificateError> {
        let mut qc = self.self_qc.lock();
        qc.add_partial(voter, partial)?;
        Ok(qc.clone())
    }

    /// Snapshot of the votes accumulated so far.
    pub fn self_qc(&self) -> QuorumCertificate {
        self.self_qc.lock().clone()
    }

    pub fn mark_decided(&self) {
        self.decided.store(true, Ordering::Release);
    }

    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::Acquire)
    }

    pub fn mark_applied(&self) {
        self.applied.store(true, Ordering::Release);
    }

    pub fn is_applied(&self) -> bool {
        self.applied.load(Ordering::Acquire)
    }

    /// Claim the write-once disk flag. Returns true exactly once, for the
    /// caller that must perform the write (or that knows the block is
    /// already durable, as on the restart path).
    pub fn claim_disk_write(&self) -> bool {
        !self.written_to_disk.swap(true, Ordering::AcqRel)
    }

    pub fn is_written_to_disk(&self) -> bool {
        self.written_to_disk.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("hash", &short_hex(&self.hash))
            .field("parent", &short_hex(&self.header.parent_hash))
            .field("height", &self.height())
            .field("decided", &self.is_decided())
            .finish()
    }
}
