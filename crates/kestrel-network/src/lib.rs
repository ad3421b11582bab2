//! # Kestrel Network
//!
//! Everything between the transport and the consensus core: peer wire
//! messages, the validated `NetEvent` pipeline that resolves block
//! dependencies, the block-fetch subsystem that repairs missing ancestors,
//! and the protocol manager that fans votes and proposals out to peers.
//!
//! The transport itself (TCP framing, session handling) is not here; it
//! plugs in through the client traits in [`ports`].

pub mod event;
pub mod fetch;
pub mod messages;
pub mod pipeline;
pub mod ports;
pub mod protocol;

pub use event::{BlockReceiveNetEvent, NetEvent, ProposalNetEvent, VoteNetEvent};
pub use fetch::{FetchManager, FetchService};
pub use messages::{BlockFetchRequest, BlockFetchResponse, PeerMessage, ProposeMessage, VoteMessage};
pub use pipeline::{NetworkEventQueue, NetworkPipeline};
pub use ports::{FetchClient, PeerConnector, ProtocolClient, TransportError};
pub use protocol::{ProtocolManager, ProtocolService};
