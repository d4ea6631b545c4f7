//! The network node
//!
//! [`Node`] owns every peer connection and a single event loop. Each
//! configured peer gets a supervisor task that dials, runs the connection,
//! and redials on transient failures; decoded traffic funnels into the
//! event loop over one mpsc channel, where the [`SyncManager`] decides what
//! to do with it.
//!
//! The event loop also owns the request clock: when the single outstanding
//! request goes unanswered past the configured timeout it is retried, then
//! the peer is dropped and the request fails over to another handshaked
//! peer. With no peer left to serve it, sync stalls loudly.

use crate::chain::ChainApi;
use crate::config::NodeConfig;
use crate::network::callbacks::NodeCallbacks;
use crate::network::codec::FrameCodec;
use crate::network::message::{ProtocolMessage, TxMessage, VersionMessage};
use crate::network::peer::{
    Peer, PeerError, PeerMessageReceiver, PeerMessageSender, Reaction, SendError,
};
use crate::network::sync::{SyncManager, SyncMode};
use crate::watch::WatchList;
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SEND_QUEUE_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already started")]
    AlreadyStarted,
    #[error("node is not running")]
    NotStarted,
    #[error("no peers configured")]
    NoPeers,
    #[error("unknown peer {0}")]
    UnknownPeer(Peer),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the connection tasks report to the event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; the remote `version` is attached.
    Connected { peer: Peer, version: VersionMessage },
    /// A post-handshake message to act on.
    Message { peer: Peer, message: ProtocolMessage },
    /// The connection is gone, with the error that ended it if any.
    Disconnected { peer: Peer, reason: Option<PeerError> },
}

#[derive(Clone)]
struct PeerConnection {
    sender: PeerMessageSender,
    /// Cancelling this token ends the connection AND its supervisor, so an
    /// event-loop-initiated drop is permanent (no redial).
    cancel: CancellationToken,
}

/// Shared registry of live connections.
#[derive(Clone, Default)]
struct Connections {
    map: Arc<RwLock<HashMap<Peer, PeerConnection>>>,
}

impl Connections {
    async fn get(&self, peer: &Peer) -> Option<PeerConnection> {
        self.map.read().await.get(peer).cloned()
    }

    async fn insert(&self, peer: Peer, connection: PeerConnection) {
        self.map.write().await.insert(peer, connection);
    }

    async fn remove(&self, peer: &Peer) {
        self.map.write().await.remove(peer);
    }

    async fn handshaked(&self) -> Vec<PeerConnection> {
        self.map
            .read()
            .await
            .values()
            .filter(|c| c.sender.is_handshaked())
            .cloned()
            .collect()
    }

    async fn handshaked_count(&self) -> usize {
        self.map
            .read()
            .await
            .values()
            .filter(|c| c.sender.is_handshaked())
            .count()
    }
}

struct NodeRuntime {
    connections: Connections,
    cancel: CancellationToken,
    supervisors: Vec<JoinHandle<()>>,
    event_loop: JoinHandle<()>,
}

/// A light-client network node.
pub struct Node {
    config: NodeConfig,
    chain: Arc<dyn ChainApi>,
    watch: Arc<dyn WatchList>,
    mode: SyncMode,
    callbacks: NodeCallbacks,
    runtime: Option<NodeRuntime>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainApi>,
        watch: Arc<dyn WatchList>,
        mode: SyncMode,
    ) -> Self {
        Self {
            config,
            chain,
            watch,
            mode,
            callbacks: NodeCallbacks::new(),
            runtime: None,
        }
    }

    /// Register application callbacks. Later registrations merge with
    /// earlier ones.
    pub fn add_callbacks(&mut self, callbacks: NodeCallbacks) {
        self.callbacks = std::mem::take(&mut self.callbacks).merge(callbacks);
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Connect to the configured peers and start syncing.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.runtime.is_some() {
            return Err(NodeError::AlreadyStarted);
        }

        let mut peers = Vec::new();
        for entry in &self.config.peers {
            match tokio::net::lookup_host(entry.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => peers.push(Peer::new(addr)),
                    None => log::warn!("peer '{entry}' resolved to no addresses"),
                },
                Err(e) => log::warn!("cannot resolve peer '{entry}': {e}"),
            }
        }
        if peers.is_empty() {
            return Err(NodeError::NoPeers);
        }

        let cancel = CancellationToken::new();
        let connections = Connections::default();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut supervisors = Vec::with_capacity(peers.len());
        for peer in peers {
            supervisors.push(tokio::spawn(supervise_peer(
                peer,
                self.config.clone(),
                self.chain.best_height(),
                connections.clone(),
                events_tx.clone(),
                cancel.child_token(),
            )));
        }

        let event_loop = EventLoop {
            sync: SyncManager::new(
                self.chain.clone(),
                self.watch.clone(),
                self.mode,
                self.config.protocol_version,
            ),
            callbacks: self.callbacks.clone(),
            connections: connections.clone(),
            events: events_rx,
            cancel: cancel.clone(),
            request_timeout: self.config.request_timeout(),
            max_request_retries: self.config.max_request_retries,
            ping_interval: self.config.ping_interval(),
        };
        let event_loop = tokio::spawn(event_loop.run());

        log::info!(
            "node started on {:?} in {:?} mode",
            self.config.network,
            self.mode
        );
        self.runtime = Some(NodeRuntime {
            connections,
            cancel,
            supervisors,
            event_loop,
        });
        Ok(())
    }

    /// Stop all connections and the event loop. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        runtime.cancel.cancel();
        for handle in runtime.supervisors {
            let _ = handle.await;
        }
        let _ = runtime.event_loop.await;
        log::info!("node stopped");
    }

    /// Number of peers with a completed handshake.
    pub async fn connected_peer_count(&self) -> usize {
        match &self.runtime {
            Some(runtime) => runtime.connections.handshaked_count().await,
            None => 0,
        }
    }

    /// Send a message to one connected peer.
    pub async fn send(&self, peer: Peer, message: ProtocolMessage) -> Result<(), NodeError> {
        let runtime = self.runtime.as_ref().ok_or(NodeError::NotStarted)?;
        let connection = runtime
            .connections
            .get(&peer)
            .await
            .ok_or(NodeError::UnknownPeer(peer))?;
        connection.sender.send(message).await?;
        Ok(())
    }

    /// Announce a raw transaction to every handshaked peer. Returns how many
    /// peers it went to.
    pub async fn broadcast_transaction(&self, raw: Vec<u8>) -> Result<usize, NodeError> {
        let runtime = self.runtime.as_ref().ok_or(NodeError::NotStarted)?;
        let tx = TxMessage { raw };
        log::info!("broadcasting transaction {}", tx.txid());

        let mut sent = 0;
        for connection in runtime.connections.handshaked().await {
            match connection.sender.send(ProtocolMessage::Tx(tx.clone())).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("broadcast to {} failed: {e}", connection.sender.peer()),
            }
        }
        Ok(sent)
    }
}

/// Dial a peer, run the connection, and redial on transient failures until
/// the token is cancelled or the attempt budget is spent.
async fn supervise_peer(
    peer: Peer,
    config: NodeConfig,
    start_height: u32,
    connections: Connections,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    let mut failures = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let (reached_handshake, result) = run_connection(
            peer,
            &config,
            start_height,
            &connections,
            &events,
            &cancel,
        )
        .await;

        connections.remove(&peer).await;
        // Only a session that completed the handshake restores the attempt
        // budget; dial failures, pre-handshake drops, and protocol
        // violations all spend it.
        if reached_handshake {
            failures = 0;
        } else {
            failures += 1;
        }
        match result {
            Ok(()) => {
                // The event goes out even on a deliberate cancel, so the
                // event loop can fail over any request this peer was serving.
                let _ = events
                    .send(PeerEvent::Disconnected { peer, reason: None })
                    .await;
                if cancel.is_cancelled() {
                    return;
                }
            }
            Err(e) => {
                let _ = events
                    .send(PeerEvent::Disconnected {
                        peer,
                        reason: Some(e),
                    })
                    .await;
            }
        }

        if failures >= config.reconnect_attempts {
            log::error!(
                "giving up on peer {peer} after {failures} failed connection attempts"
            );
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
        }
    }
}

/// One full connection lifetime: dial, handshake, pump messages. The flag
/// says whether the session got as far as a completed handshake.
async fn run_connection(
    peer: Peer,
    config: &NodeConfig,
    start_height: u32,
    connections: &Connections,
    events: &mpsc::Sender<PeerEvent>,
    cancel: &CancellationToken,
) -> (bool, Result<(), PeerError>) {
    log::debug!("connecting to {peer}");
    let stream = match TcpStream::connect(peer.address).await {
        Ok(stream) => stream,
        Err(e) => return (false, Err(PeerError::ConnectionFailed(peer, e))),
    };
    let (mut read_half, write_half) = stream.into_split();

    let magic = config.network.magic();
    let (queue_tx, mut queue_rx) = mpsc::channel::<ProtocolMessage>(SEND_QUEUE_CAPACITY);
    let sender = PeerMessageSender::new(peer, queue_tx);

    // Writer task: drains the send queue onto the socket.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, FrameCodec::new(magic));
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = queue_rx.recv() => match message {
                    Some(message) => {
                        log::trace!("-> {} to {peer}", message.command());
                        if let Err(e) = framed.send(message).await {
                            log::debug!("write to {peer} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let mut receiver = PeerMessageReceiver::new(peer, magic);
    receiver.connection_established();

    connections
        .insert(
            peer,
            PeerConnection {
                sender: sender.clone(),
                cancel: cancel.clone(),
            },
        )
        .await;

    let version = VersionMessage::new(
        config.protocol_version,
        crate::network::message::ServiceFlags::empty(),
        peer.address,
        start_height as i32,
        &config.user_agent,
    );
    let result = sender
        .send(ProtocolMessage::Version(version))
        .await
        .map_err(|_| PeerError::Disconnected(peer));
    if result.is_ok() {
        receiver.version_sent();
    }

    let mut result = result;
    if result.is_ok() {
        result = pump_messages(peer, &mut read_half, &mut receiver, &sender, events, cancel).await;
    }

    writer.abort();
    let _ = writer.await;
    (sender.is_handshaked(), result)
}

async fn pump_messages(
    peer: Peer,
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    receiver: &mut PeerMessageReceiver,
    sender: &PeerMessageSender,
    events: &mpsc::Sender<PeerEvent>,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = read_half.read(&mut buffer) => read,
        };
        let n = read.map_err(|source| PeerError::Io { peer, source })?;
        if n == 0 {
            return Err(PeerError::Disconnected(peer));
        }

        for reaction in receiver.receive(&buffer[..n])? {
            match reaction {
                Reaction::Reply(message) => {
                    sender
                        .send(message)
                        .await
                        .map_err(|_| PeerError::Disconnected(peer))?;
                }
                Reaction::HandshakeComplete(version) => {
                    sender.mark_handshaked();
                    log::info!("handshake complete with {peer} ({})", version.user_agent);
                    let _ = events.send(PeerEvent::Connected { peer, version }).await;
                }
                Reaction::Forward(message) => {
                    log::trace!("<- {} from {peer}", message.command());
                    let _ = events.send(PeerEvent::Message { peer, message }).await;
                }
            }
        }
    }
}

struct EventLoop {
    sync: SyncManager,
    callbacks: NodeCallbacks,
    connections: Connections,
    events: mpsc::Receiver<PeerEvent>,
    cancel: CancellationToken,
    request_timeout: Duration,
    max_request_retries: u32,
    ping_interval: Duration,
}

impl EventLoop {
    async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.ping_interval,
            self.ping_interval,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &mut deadline).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => {
                    self.handle_timeout(&mut deadline).await;
                }
                _ = ping.tick() => self.ping_peers().await,
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent, deadline: &mut Option<Instant>) {
        let before = self.request_snapshot();

        match event {
            PeerEvent::Connected { peer, version } => {
                self.handle_connected(peer, version).await;
            }
            PeerEvent::Message { peer, message } => {
                self.handle_message(peer, message).await;
            }
            PeerEvent::Disconnected { peer, reason } => {
                if let Some(reason) = &reason {
                    log::warn!("lost peer {peer}: {reason}");
                } else {
                    log::info!("peer {peer} disconnected");
                }
                self.callbacks.dispatch_peer_disconnected(&peer);
                if self.sync.outstanding().map(|r| r.peer) == Some(peer) {
                    self.failover().await;
                }
            }
        }

        // Refresh the request clock only when the request itself moved: a
        // new one went out, or a filter reply advanced the current range.
        // Keepalives and gossip from the serving peer do not count.
        let after = self.request_snapshot();
        *deadline = match after {
            None => None,
            Some(_) if before != after => Some(Instant::now() + self.request_timeout),
            Some(_) => *deadline,
        };
    }

    async fn handle_connected(&mut self, peer: Peer, version: VersionMessage) {
        let Some(connection) = self.connections.get(&peer).await else {
            return;
        };

        let required = self.sync.mode().required_services();
        if !version.services.contains(required) {
            log::warn!(
                "peer {peer} does not advertise {required:?}, dropping it"
            );
            connection.cancel.cancel();
            return;
        }

        self.callbacks.dispatch_peer_connected(&peer, &version);
        if self.sync.is_idle() {
            if let Err(e) = self.sync.begin(&connection.sender).await {
                log::error!("cannot start sync with {peer}: {e}");
                connection.cancel.cancel();
            }
        }
    }

    async fn handle_message(&mut self, peer: Peer, message: ProtocolMessage) {
        let Some(connection) = self.connections.get(&peer).await else {
            return;
        };
        if let Err(e) = self
            .sync
            .handle_message(peer, message, &connection.sender, &self.callbacks)
            .await
        {
            // A chain or filter error means the peer served bad data.
            log::error!("disconnecting {peer}: {e}");
            connection.cancel.cancel();
        }
    }

    async fn handle_timeout(&mut self, deadline: &mut Option<Instant>) {
        let Some(request) = self.sync.outstanding() else {
            *deadline = None;
            return;
        };
        let peer = request.peer;
        let retries = request.retries;

        let Some(connection) = self.connections.get(&peer).await else {
            self.failover().await;
            *deadline = self.next_deadline();
            return;
        };

        if retries >= self.max_request_retries {
            log::warn!("peer {peer} unresponsive after {retries} retries, dropping it");
            // Failover happens when the disconnect event comes back.
            connection.cancel.cancel();
        } else if self.sync.retry(&connection.sender).await.is_err() {
            connection.cancel.cancel();
        }
        *deadline = self.next_deadline();
    }

    async fn failover(&mut self) {
        let candidates = self.connections.handshaked().await;
        // A connection the loop just cancelled may still be in the map
        // until its task unwinds; it cannot serve anything.
        match candidates.iter().find(|c| !c.cancel.is_cancelled()) {
            Some(connection) => {
                if let Err(e) = self.sync.failover(&connection.sender).await {
                    log::warn!("failover to {} failed: {e}", connection.sender.peer());
                    connection.cancel.cancel();
                }
            }
            None => {
                if let Some(request) = self.sync.abort() {
                    log::error!(
                        "sync stalled: no peer left to serve '{}'",
                        request.message.command()
                    );
                }
            }
        }
    }

    async fn ping_peers(&self) {
        for connection in self.connections.handshaked().await {
            let nonce = rand::random();
            if connection
                .sender
                .send(ProtocolMessage::Ping(nonce))
                .await
                .is_err()
            {
                log::debug!("ping to {} failed", connection.sender.peer());
            }
        }
    }

    fn request_snapshot(&self) -> Option<(Peer, crate::network::sync::RequestKind, u32)> {
        self.sync
            .outstanding()
            .map(|r| (r.peer, r.kind, self.sync.next_filter_height()))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sync
            .outstanding()
            .map(|_| Instant::now() + self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::config::Network;
    use crate::network::message::ServiceFlags;
    use crate::watch::StaticWatchList;
    use futures::StreamExt;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    fn test_config(peers: Vec<String>) -> NodeConfig {
        NodeConfig {
            network: Network::Regtest,
            peers,
            request_timeout_secs: 1,
            max_request_retries: 0,
            reconnect_attempts: 1,
            reconnect_delay_secs: 1,
            ..NodeConfig::default()
        }
    }

    fn test_node(peers: Vec<String>) -> Node {
        let chain = Arc::new(MemoryChain::new(Network::Regtest.genesis_header()));
        let watch = Arc::new(StaticWatchList::new(vec![b"script".to_vec()]));
        Node::new(test_config(peers), chain, watch, SyncMode::Neutrino)
    }

    /// Accepts one connection, completes the handshake with the given
    /// service bits, records every command received, and never answers
    /// data requests.
    async fn silent_peer(
        listener: TcpListener,
        services: ServiceFlags,
        seen: Arc<Mutex<Vec<String>>>,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new(Network::Regtest.magic()));

        while let Some(Ok(message)) = framed.next().await {
            seen.lock().unwrap().push(message.command().to_string());
            match message {
                ProtocolMessage::Version(_) => {
                    let version = VersionMessage::new(
                        70016,
                        services,
                        "127.0.0.1:0".parse().unwrap(),
                        0,
                        "/silent:0.1/",
                    );
                    framed.send(ProtocolMessage::Version(version)).await.unwrap();
                    framed.send(ProtocolMessage::Verack).await.unwrap();
                }
                ProtocolMessage::Ping(nonce) => {
                    framed.send(ProtocolMessage::Pong(nonce)).await.unwrap();
                }
                _ => {}
            }
        }
    }

    async fn wait_until<F>(mut check: F, timeout: Duration)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !check() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn start_requires_peers() {
        let mut node = test_node(vec![]);
        assert!(matches!(node.start().await, Err(NodeError::NoPeers)));
    }

    #[tokio::test]
    async fn start_twice_is_an_error_and_stop_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(silent_peer(
            listener,
            ServiceFlags::NODE_COMPACT_FILTERS,
            Arc::new(Mutex::new(Vec::new())),
        ));

        let mut node = test_node(vec![addr.to_string()]);
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        node.stop().await;
        assert!(!node.is_running());
        node.stop().await;
    }

    #[tokio::test]
    async fn send_before_start_is_an_error() {
        let node = test_node(vec!["127.0.0.1:1".to_string()]);
        let peer = Peer::new("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            node.send(peer, ProtocolMessage::Ping(1)).await,
            Err(NodeError::NotStarted)
        ));
        assert!(matches!(
            node.broadcast_transaction(vec![1]).await,
            Err(NodeError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn peer_without_required_services_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(silent_peer(listener, ServiceFlags::NODE_NETWORK, seen.clone()));

        let mut node = test_node(vec![addr.to_string()]);
        node.start().await.unwrap();

        // The handshake completes, then the node notices the missing
        // NODE_COMPACT_FILTERS bit and hangs up without requesting anything.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(node.connected_peer_count().await, 0);
        assert!(!seen.lock().unwrap().iter().any(|c| c == "getheaders"));

        node.stop().await;
    }

    /// Handshakes, then floods `addr` gossip instead of ever answering the
    /// data request it received.
    async fn chatty_peer(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new(Network::Regtest.magic()));

        while let Some(Ok(message)) = framed.next().await {
            match message {
                ProtocolMessage::Version(_) => {
                    let version = VersionMessage::new(
                        70016,
                        ServiceFlags::NODE_COMPACT_FILTERS,
                        "127.0.0.1:0".parse().unwrap(),
                        0,
                        "/chatty:0.1/",
                    );
                    framed.send(ProtocolMessage::Version(version)).await.unwrap();
                    framed.send(ProtocolMessage::Verack).await.unwrap();
                }
                ProtocolMessage::GetHeaders(_) => break,
                _ => {}
            }
        }
        loop {
            if framed.send(ProtocolMessage::Addr(vec![])).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn gossip_from_the_serving_peer_does_not_hold_off_the_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(chatty_peer(listener));

        let disconnects = Arc::new(Mutex::new(0usize));
        let counter = disconnects.clone();
        let mut node = test_node(vec![addr.to_string()]);
        node.add_callbacks(NodeCallbacks::new().on_peer_disconnected(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        node.start().await.unwrap();

        // The addr flood arrives faster than the 1 s request timeout; the
        // unanswered getheaders must still time the peer out.
        let fired = disconnects.clone();
        wait_until(
            move || *fired.lock().unwrap() >= 1,
            Duration::from_secs(5),
        )
        .await;

        node.stop().await;
    }

    #[tokio::test]
    async fn pre_handshake_drops_spend_the_redial_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(Mutex::new(0usize));
        let counter = accepts.clone();
        tokio::spawn(async move {
            // Accept and hang up before any handshake.
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                *counter.lock().unwrap() += 1;
                drop(stream);
            }
        });

        let mut config = test_config(vec![addr.to_string()]);
        config.reconnect_attempts = 2;
        let chain = Arc::new(MemoryChain::new(Network::Regtest.genesis_header()));
        let watch = Arc::new(StaticWatchList::new(vec![]));
        let mut node = Node::new(config, chain, watch, SyncMode::Neutrino);
        node.start().await.unwrap();

        let dialed = accepts.clone();
        wait_until(
            move || *dialed.lock().unwrap() >= 2,
            Duration::from_secs(5),
        )
        .await;

        // The budget is spent; the supervisor must not dial again.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*accepts.lock().unwrap(), 2);

        node.stop().await;
    }

    #[tokio::test]
    async fn failover_skips_connections_already_being_torn_down() {
        let chain = Arc::new(MemoryChain::new(Network::Regtest.genesis_header()));
        let watch = Arc::new(StaticWatchList::new(vec![]));
        let connections = Connections::default();

        // A handshaked peer the loop has already cancelled but whose task
        // has not unwound yet.
        let dying_peer = Peer::new("127.0.0.1:1".parse().unwrap());
        let (dying_tx, _dying_rx) = mpsc::channel(8);
        let dying_sender = PeerMessageSender::new(dying_peer, dying_tx);
        dying_sender.mark_handshaked();
        let dying_cancel = CancellationToken::new();
        dying_cancel.cancel();
        connections
            .insert(
                dying_peer,
                PeerConnection {
                    sender: dying_sender.clone(),
                    cancel: dying_cancel,
                },
            )
            .await;

        let live_peer = Peer::new("127.0.0.2:1".parse().unwrap());
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let live_sender = PeerMessageSender::new(live_peer, live_tx);
        live_sender.mark_handshaked();
        connections
            .insert(
                live_peer,
                PeerConnection {
                    sender: live_sender,
                    cancel: CancellationToken::new(),
                },
            )
            .await;

        let mut sync = SyncManager::new(chain, watch, SyncMode::Neutrino, 70016);
        sync.begin(&dying_sender).await.unwrap();

        let (_events_tx, events_rx) = mpsc::channel(8);
        let mut event_loop = EventLoop {
            sync,
            callbacks: NodeCallbacks::new(),
            connections,
            events: events_rx,
            cancel: CancellationToken::new(),
            request_timeout: Duration::from_secs(1),
            max_request_retries: 0,
            ping_interval: Duration::from_secs(120),
        };

        event_loop.failover().await;
        assert_eq!(
            event_loop.sync.outstanding().map(|r| r.peer),
            Some(live_peer)
        );
        assert!(matches!(
            live_rx.recv().await,
            Some(ProtocolMessage::GetHeaders(_))
        ));
    }

    #[tokio::test]
    async fn timed_out_request_fails_over_to_another_peer() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec![
            first.local_addr().unwrap().to_string(),
            second.local_addr().unwrap().to_string(),
        ];

        let seen_first = Arc::new(Mutex::new(Vec::new()));
        let seen_second = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(silent_peer(
            first,
            ServiceFlags::NODE_COMPACT_FILTERS,
            seen_first.clone(),
        ));
        tokio::spawn(silent_peer(
            second,
            ServiceFlags::NODE_COMPACT_FILTERS,
            seen_second.clone(),
        ));

        let disconnects = Arc::new(Mutex::new(0usize));
        let counter = disconnects.clone();
        let mut node = test_node(addrs);
        node.add_callbacks(NodeCallbacks::new().on_peer_disconnected(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        node.start().await.unwrap();

        // Neither peer ever answers getheaders: the first serving peer must
        // time out and the request must move to the other one.
        let (a, b) = (seen_first.clone(), seen_second.clone());
        wait_until(
            move || {
                let got = |seen: &Arc<Mutex<Vec<String>>>| {
                    seen.lock().unwrap().iter().any(|c| c == "getheaders")
                };
                got(&a) && got(&b)
            },
            Duration::from_secs(10),
        )
        .await;
        assert!(*disconnects.lock().unwrap() >= 1);

        node.stop().await;
    }
}
