//! bitlight: a light-client Bitcoin network node.
//!
//! The node connects to a handful of peers, keeps a header chain in sync
//! through an external [`chain::ChainApi`] collaborator, and finds
//! wallet-relevant transactions with one of two strategies: BIP 37 bloom
//! filtering (SPV) or BIP 157/158 compact block filters (Neutrino). The
//! embedding application supplies the scripts to watch via
//! [`watch::WatchList`] and observes progress through
//! [`network::NodeCallbacks`].
//!
//! ```no_run
//! use bitlight::chain::MemoryChain;
//! use bitlight::config::{Network, NodeConfig};
//! use bitlight::network::{Node, NodeCallbacks, SyncMode};
//! use bitlight::watch::StaticWatchList;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig {
//!     network: Network::Regtest,
//!     peers: vec!["127.0.0.1:18444".into()],
//!     ..NodeConfig::default()
//! };
//! let chain = Arc::new(MemoryChain::new(config.network.genesis_header()));
//! let watch = Arc::new(StaticWatchList::from_hex(&[
//!     "76a914000000000000000000000000000000000000000088ac",
//! ])?);
//!
//! let mut node = Node::new(config, chain, watch, SyncMode::Neutrino);
//! node.add_callbacks(NodeCallbacks::new().on_filter_match(|block, height| {
//!     println!("match in {block} at height {height}");
//!     Ok(())
//! }));
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod core;
pub mod network;
pub mod watch;

pub use chain::{ChainApi, ChainError, ChainUpdate, MemoryChain};
pub use config::{Network, NodeConfig};
pub use network::{Node, NodeCallbacks, NodeError, SyncMode};
pub use watch::{StaticWatchList, WatchList};
