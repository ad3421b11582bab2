//! # Kestrel VM Bridge
//!
//! Keeps the application VM in lock-step with consensus. The VM runs on its
//! own worker thread (the only thread that ever touches it); the speculation
//! gadget tracks which heights the VM has executed ahead of finality, and
//! the bridge reconciles committed blocks against that speculation: a
//! matching block is a no-op, a divergent one rolls the VM back.

pub mod bridge;
pub mod controller;
pub mod errors;
pub mod speculation;
pub mod vm;

pub use bridge::VmBridge;
pub use controller::VmController;
pub use errors::BridgeError;
pub use speculation::{SpeculationError, SpeculationTracker};
pub use vm::VirtualMachine;
