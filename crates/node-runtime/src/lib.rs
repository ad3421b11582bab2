//! # Kestrel Node Runtime
//!
//! Assembles the subsystem crates into a runnable replica: configuration
//! loading, the TCP adapters behind the network ports, node wiring with the
//! restart path, and a minimal proposer driver.

pub mod config;
pub mod node;
pub mod proposer;
pub mod tcp;
pub mod vm;

pub use config::NodeConfig;
pub use node::KestrelNode;
pub use proposer::ProposerDriver;
pub use vm::CounterVm;
