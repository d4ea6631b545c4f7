//! bitlight CLI: run a light-client node from the command line.

use bitlight::chain::MemoryChain;
use bitlight::config::{Network, NodeConfig};
use bitlight::network::{Node, NodeCallbacks, SyncMode};
use bitlight::watch::StaticWatchList;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bitlight", version, about = "Light-client Bitcoin node")]
struct Cli {
    /// Path to a JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network to connect to.
    #[arg(short, long, value_enum)]
    network: Option<Network>,

    /// Peer address (host:port). Repeatable.
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Hex-encoded script to watch for. Repeatable.
    #[arg(short = 'w', long = "watch-script")]
    watch_scripts: Vec<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Sync with BIP 37 bloom filters loaded onto the peers.
    Spv,
    /// Sync with BIP 157/158 compact block filters, matched locally.
    Neutrino,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    if !cli.peers.is_empty() {
        config.peers = cli.peers.clone();
    }

    let mode = match cli.mode {
        Mode::Spv => SyncMode::Spv,
        Mode::Neutrino => SyncMode::Neutrino,
    };

    let chain = Arc::new(MemoryChain::new(config.network.genesis_header()));
    let watch = Arc::new(StaticWatchList::from_hex(&cli.watch_scripts)?);

    let callbacks = NodeCallbacks::new()
        .on_headers(|headers, tip| {
            log::info!("accepted {} headers, tip at height {tip}", headers.len());
            Ok(())
        })
        .on_filter_match(|block, height| {
            println!("filter match: block {block} at height {height}");
            Ok(())
        })
        .on_transaction(|tx| {
            println!("transaction: {}", tx.txid());
            Ok(())
        })
        .on_peer_connected(|peer, version| {
            log::info!("connected to {peer} ({})", version.user_agent);
            Ok(())
        })
        .on_peer_disconnected(|peer| {
            log::info!("disconnected from {peer}");
            Ok(())
        });

    let mut node = Node::new(config, chain, watch, mode);
    node.add_callbacks(callbacks);
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    node.stop().await;
    Ok(())
}
