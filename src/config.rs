//! Node configuration
//!
//! Network parameters (magic bytes, default ports, genesis headers) plus the
//! runtime knobs the node reads: peer list, request timeout and retry
//! budget, reconnect policy. Configuration loads from a JSON file and every
//! field has a sensible default, so an empty `{}` is a valid config.

use crate::core::{BlockHash, BlockHeader};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Genesis coinbase merkle root, shared by all three networks (internal
/// byte order).
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which Bitcoin network to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    #[default]
    Regtest,
}

impl Network {
    /// The four magic bytes prefixing every frame on this network.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xF9, 0xBE, 0xB4, 0xD9],
            Network::Testnet => [0x0B, 0x11, 0x09, 0x07],
            Network::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// The hard-coded genesis block header anchoring the chain.
    pub fn genesis_header(&self) -> BlockHeader {
        match self {
            Network::Mainnet => BlockHeader {
                version: 1,
                prev_blockhash: BlockHash::ZERO,
                merkle_root: BlockHash(GENESIS_MERKLE_ROOT),
                time: 1_231_006_505,
                bits: 0x1d00ffff,
                nonce: 2_083_236_893,
            },
            Network::Testnet => BlockHeader {
                version: 1,
                prev_blockhash: BlockHash::ZERO,
                merkle_root: BlockHash(GENESIS_MERKLE_ROOT),
                time: 1_296_688_602,
                bits: 0x1d00ffff,
                nonce: 414_098_458,
            },
            Network::Regtest => BlockHeader {
                version: 1,
                prev_blockhash: BlockHash::ZERO,
                merkle_root: BlockHash(GENESIS_MERKLE_ROOT),
                time: 1_296_688_602,
                bits: 0x207fffff,
                nonce: 2,
            },
        }
    }
}

/// Runtime configuration for a [`Node`](crate::network::Node).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    /// Peer addresses as `host:port` strings.
    pub peers: Vec<String>,
    /// How long to wait for a reply to an outstanding request.
    pub request_timeout_secs: u64,
    /// Resend attempts before giving up on a peer.
    pub max_request_retries: u32,
    /// Connection attempts per peer before its supervisor gives up.
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,
    pub user_agent: String,
    pub protocol_version: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            peers: Vec::new(),
            request_timeout_secs: 30,
            max_request_retries: 2,
            reconnect_attempts: 3,
            reconnect_delay_secs: 5,
            ping_interval_secs: 120,
            user_agent: concat!("/bitlight:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            protocol_version: 70016,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}
