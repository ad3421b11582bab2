//! # Kestrel Replica Runtime
//!
//! Entry point for a single replica: load the TOML replica-set config,
//! wire the subsystems over TCP, optionally start the proposer driver, and
//! run until interrupted.

use anyhow::Context;
use node_runtime::{CounterVm, KestrelNode, NodeConfig, ProposerDriver};
use node_runtime::tcp::{spawn_fetch_server, spawn_protocol_server, TcpConnector};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "kestrel.toml".to_string());
    let node_config = NodeConfig::load(&config_path)?;
    let replica_config = node_config.replica_config()?;
    let keypair = node_config.keypair()?;
    let self_info = replica_config.info(node_config.self_id)?.clone();

    info!(
        self_id = node_config.self_id,
        nreplicas = replica_config.nreplicas,
        nmajority = replica_config.nmajority,
        "starting kestrel replica"
    );

    let node = KestrelNode::build(
        replica_config,
        node_config.self_id,
        keypair,
        &node_config.data_dir,
        CounterVm::new(),
        &TcpConnector,
    )?;

    let protocol_server = spawn_protocol_server(
        &self_info.protocol_addr(),
        Arc::new(node.protocol_service()),
    )?;
    let fetch_server =
        spawn_fetch_server(&self_info.fetch_addr(), Arc::new(node.fetch_service()))?;

    let proposer = if node_config.propose {
        Some(ProposerDriver::spawn(
            Arc::clone(node.core()),
            Arc::clone(node.bridge()),
            Arc::clone(node.qc_signal()),
        ))
    } else {
        None
    };

    let (interrupt_tx, interrupt_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("installing interrupt handler")?;

    info!("replica running; interrupt to stop");
    let _ = interrupt_rx.recv();

    info!("shutting down");
    if let Some(proposer) = &proposer {
        proposer.shutdown();
    }
    protocol_server.shutdown();
    fetch_server.shutdown();
    node.shutdown();
    Ok(())
}
