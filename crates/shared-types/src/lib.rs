//! # Shared Types Crate
//!
//! Identifier aliases and worker primitives shared by every Kestrel
//! subsystem.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: cross-subsystem identifiers (`Hash`,
//!   `ReplicaId`) are defined here and nowhere else.
//! - **Owned workers**: every long-running subsystem is a first-class thread
//!   with an explicit shutdown signal, joined on drop. No detached threads.

pub mod ids;
pub mod worker;

pub use ids::{short_hex, Hash, ReplicaId, MAX_REPLICAS, ZERO_HASH};
pub use worker::{spawn_queue_worker, JoinOnDrop, WorkQueue};
