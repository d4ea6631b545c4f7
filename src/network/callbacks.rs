//! Node event callbacks
//!
//! The embedding application observes sync progress through a set of
//! registered closures. Handlers are isolated from each other: one handler
//! returning an error is logged and never prevents the remaining handlers
//! (or the node itself) from making progress.

use crate::core::{BlockHash, BlockHeader};
use crate::network::message::{TxMessage, VersionMessage};
use crate::network::peer::Peer;
use std::error::Error;
use std::sync::Arc;

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

pub type OnHeaders = Arc<dyn Fn(&[BlockHeader], u32) -> HandlerResult + Send + Sync>;
pub type OnFilterMatch = Arc<dyn Fn(&BlockHash, u32) -> HandlerResult + Send + Sync>;
pub type OnTransaction = Arc<dyn Fn(&TxMessage) -> HandlerResult + Send + Sync>;
pub type OnPeerConnected = Arc<dyn Fn(&Peer, &VersionMessage) -> HandlerResult + Send + Sync>;
pub type OnPeerDisconnected = Arc<dyn Fn(&Peer) -> HandlerResult + Send + Sync>;

/// Registry of application callbacks, built with the `on_*` methods and
/// handed to the node before start.
#[derive(Clone, Default)]
pub struct NodeCallbacks {
    on_headers: Vec<OnHeaders>,
    on_filter_match: Vec<OnFilterMatch>,
    on_transaction: Vec<OnTransaction>,
    on_peer_connected: Vec<OnPeerConnected>,
    on_peer_disconnected: Vec<OnPeerDisconnected>,
}

impl NodeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with no handlers, the valid do-nothing default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Called after a batch of headers was accepted by the chain, with the
    /// new tip height.
    pub fn on_headers<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[BlockHeader], u32) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_headers.push(Arc::new(handler));
        self
    }

    /// Called when a verified compact filter matched the watch list.
    pub fn on_filter_match<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BlockHash, u32) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_filter_match.push(Arc::new(handler));
        self
    }

    /// Called for every transaction delivered for the loaded bloom filter.
    pub fn on_transaction<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TxMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_transaction.push(Arc::new(handler));
        self
    }

    /// Called once a peer completes the handshake.
    pub fn on_peer_connected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Peer, &VersionMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_peer_connected.push(Arc::new(handler));
        self
    }

    /// Called when a peer connection is lost or torn down, including when
    /// sync stalls with no replacement peer available.
    pub fn on_peer_disconnected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Peer) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_peer_disconnected.push(Arc::new(handler));
        self
    }

    /// Append all handlers from `other`.
    pub fn merge(mut self, other: NodeCallbacks) -> Self {
        self.on_headers.extend(other.on_headers);
        self.on_filter_match.extend(other.on_filter_match);
        self.on_transaction.extend(other.on_transaction);
        self.on_peer_connected.extend(other.on_peer_connected);
        self.on_peer_disconnected.extend(other.on_peer_disconnected);
        self
    }

    pub(crate) fn dispatch_headers(&self, headers: &[BlockHeader], tip_height: u32) {
        for handler in &self.on_headers {
            if let Err(e) = handler(headers, tip_height) {
                log::warn!("headers callback failed: {e}");
            }
        }
    }

    pub(crate) fn dispatch_filter_match(&self, block_hash: &BlockHash, height: u32) {
        for handler in &self.on_filter_match {
            if let Err(e) = handler(block_hash, height) {
                log::warn!("filter match callback failed: {e}");
            }
        }
    }

    pub(crate) fn dispatch_transaction(&self, tx: &TxMessage) {
        for handler in &self.on_transaction {
            if let Err(e) = handler(tx) {
                log::warn!("transaction callback failed: {e}");
            }
        }
    }

    pub(crate) fn dispatch_peer_connected(&self, peer: &Peer, version: &VersionMessage) {
        for handler in &self.on_peer_connected {
            if let Err(e) = handler(peer, version) {
                log::warn!("peer connected callback failed: {e}");
            }
        }
    }

    pub(crate) fn dispatch_peer_disconnected(&self, peer: &Peer) {
        for handler in &self.on_peer_disconnected {
            if let Err(e) = handler(peer) {
                log::warn!("peer disconnected callback failed: {e}");
            }
        }
    }
}
