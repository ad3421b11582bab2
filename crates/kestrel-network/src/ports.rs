//! Transport-facing ports.
//!
//! The engine speaks to peers through these traits; the actual byte-stream
//! transport (TCP connect/reconnect, framing, session handling) lives in
//! adapters provided by the runtime. Clients are expected to manage their
//! own connections: a failed call may be retried indefinitely by the
//! workers that own them.

use crate::messages::{BlockFetchRequest, BlockFetchResponse, PeerMessage};
use kestrel_consensus_types::ReplicaInfo;
use std::sync::Arc;
use thiserror::Error;

/// Transport failures. Always retryable; never fatal to the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Recv(String),

    /// Peer is known but currently unreachable
    #[error("peer unavailable")]
    Unavailable,
}

/// One-way vote/proposal channel to a single peer.
pub trait ProtocolClient: Send + Sync {
    fn send(&self, msg: &PeerMessage) -> Result<(), TransportError>;
}

/// Request/response block-fetch channel to a single peer.
pub trait FetchClient: Send + Sync {
    fn fetch(&self, req: &BlockFetchRequest) -> Result<BlockFetchResponse, TransportError>;
}

/// Factory handing out per-peer clients at wiring time.
pub trait PeerConnector: Send + Sync {
    fn protocol_client(&self, info: &ReplicaInfo) -> Arc<dyn ProtocolClient>;
    fn fetch_client(&self, info: &ReplicaInfo) -> Arc<dyn FetchClient>;
}
