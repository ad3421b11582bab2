//! # Kestrel Block Store
//!
//! The block DAG: content-addressed blocks linked by parent and justify
//! edges, an in-memory cache of live blocks, a file-per-hash durable
//! archive, a garbage collector that evicts blocks below the committed
//! frontier, and the durable commit index consulted on restart.
//!
//! The DAG is append-only: once a block is admitted its parent, justify and
//! height never change again; only commit-status flags and the flushable
//! body mutate afterwards.

pub mod archive;
pub mod block;
pub mod errors;
pub mod gc;
pub mod index;
pub mod store;

pub use archive::BlockArchive;
pub use block::{Block, BlockHeader, BlockWire};
pub use errors::StoreError;
pub use index::CommitIndex;
pub use store::{BlockStore, InsertStatus, MissingDependencies};
