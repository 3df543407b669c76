//! BDN relay node binary.
//!
//! Wires the injected collaborators together (message factory, version
//! manager, validator, network config) and runs the network front end
//! until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tokio::signal;
use tracing::{error, info};

use bdn_config::{NetworkNum, NodeModel};
use bdn_network::{
    DefaultMessageValidator, MessageValidator, NetworkConfig, P2pNode, VersionManager,
};

mod config;

use config::FileConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = Command::new("bdn-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Block distribution network relay node")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("listen-port")
                .long("listen-port")
                .value_name("PORT")
                .help("Port to listen on for peers"),
        )
        .arg(
            Arg::new("network-num")
                .long("network-num")
                .value_name("NUM")
                .help("Logical network number"),
        )
        .arg(
            Arg::new("peer")
                .long("peer")
                .value_name("ADDR")
                .action(ArgAction::Append)
                .help("Peer address to dial on startup (repeatable)"),
        )
        .arg(
            Arg::new("gateway")
                .long("gateway")
                .action(ArgAction::SetTrue)
                .help("Run as a gateway instead of a relay"),
        )
        .get_matches();

    let mut network_config = NetworkConfig::default();
    if let Some(path) = matches.get_one::<String>("config") {
        let file = FileConfig::load(&PathBuf::from(path))?;
        network_config = file.apply(network_config);
    }
    if let Some(port) = matches.get_one::<String>("listen-port") {
        network_config.listen_port = port.parse().context("parsing --listen-port")?;
    }
    if let Some(num) = matches.get_one::<String>("network-num") {
        network_config.network_num = num
            .parse::<NetworkNum>()
            .context("parsing --network-num")?;
    }
    if let Some(peers) = matches.get_many::<String>("peer") {
        let mut parsed = Vec::new();
        for peer in peers {
            parsed.push(
                peer.parse::<SocketAddr>()
                    .with_context(|| format!("parsing peer address {peer}"))?,
            );
        }
        network_config.outbound_peers = parsed;
    }
    if matches.get_flag("gateway") {
        network_config.node_model = NodeModel::Gateway;
    }

    info!("starting bdn-node");
    info!(
        port = network_config.listen_port,
        network_num = network_config.network_num,
        model = ?network_config.node_model,
        node_id = %network_config.node_id,
        peers = network_config.outbound_peers.len(),
        "configuration resolved"
    );

    if let Err(err) = run_node(network_config).await {
        error!("node failed: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(network_config: NetworkConfig) -> Result<()> {
    let factory = Arc::new(bdn_network::MessageFactory::new());
    let version_manager =
        Arc::new(VersionManager::new().context("building version manager")?);
    let validator: Arc<dyn MessageValidator> = Arc::new(DefaultMessageValidator::new());

    let node = P2pNode::new(network_config, factory, version_manager, validator)
        .context("building network node")?;
    let handle = node.start().await.context("starting network node")?;
    info!(addr = %handle.local_addr(), "node running, ctrl-c to stop");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received, shutting down");
    handle.shutdown().await;
    Ok(())
}
