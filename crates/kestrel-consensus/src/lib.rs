//! # Kestrel Consensus
//!
//! The HotStuff state machine: voting rule, locked block, three-chain commit
//! rule and highest-QC tracking, plus the validated event queue that feeds
//! it.
//!
//! The core is a single type behind one mutex. Everything it needs from the
//! outside world (sending votes and proposals, executing committed blocks,
//! liveness wake-ups) enters through the port traits in [`ports`], so the
//! network layer and the VM bridge plug in without the core knowing either.

pub mod core;
pub mod errors;
pub mod event_queue;
pub mod events;
pub mod ports;

pub use crate::core::HotstuffCore;
pub use errors::CoreError;
pub use event_queue::EventQueue;
pub use events::{Event, ProposalEvent, VoteEvent};
pub use ports::{ConsensusNotifier, ExecutionHooks, HookError, NullNotifier, ProtocolOutbound};
