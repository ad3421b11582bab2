//! Block store error types.

use thiserror::Error;

/// Durable-storage and invariant errors.
///
/// The invariant variants indicate logic bugs: callers treat them as fatal
/// rather than recoverable conditions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Bincode encode/decode failure
    #[error("encoding: {0}")]
    Encoding(String),

    /// A block slated for persistence is not in the cache (invariant)
    #[error("block {0} slated for persistence is missing from the cache")]
    MissingForPersist(String),

    /// A block's body was flushed before it was archived (invariant)
    #[error("block {0} body flushed before archival")]
    BodyFlushed(String),

    /// Archive has no entry for the requested hash
    #[error("no archived block {0}")]
    NotArchived(String),
}
