//! Peer connection state machine
//!
//! Each remote peer is driven by a [`PeerMessageReceiver`] that owns the
//! inbound half of the connection: it reassembles frames from raw stream
//! bytes, enforces the version/verack handshake, and turns every decoded
//! message into [`Reaction`]s for the connection task to act on. The state
//! machine is deliberately synchronous and I/O-free so it can be tested
//! without sockets.
//!
//! The outbound half is a [`PeerMessageSender`]: a cheap clonable handle that
//! refuses to queue application messages until the handshake completed.

use crate::network::codec::{FrameCodec, FramingError};
use crate::network::message::{ProtocolMessage, VersionMessage};
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

/// Identity of a remote peer: the dialed address plus an optional
/// persistent id assigned by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub address: SocketAddr,
    pub id: Option<u64>,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self { address, id: None }
    }

    pub fn with_id(address: SocketAddr, id: u64) -> Self {
        Self {
            address,
            id: Some(id),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}#{id}", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No TCP connection yet.
    Preconnection,
    /// TCP established, local `version` not sent.
    Connected,
    /// Local `version` sent, waiting for the remote `version`/`verack` pair.
    Handshaking,
    /// Handshake complete in both directions.
    Handshaked,
    /// Terminal.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("framing error from {peer}: {source}")]
    Framing {
        peer: Peer,
        #[source]
        source: FramingError,
    },
    #[error("peer {peer} sent '{command}' in state {state:?}")]
    ProtocolViolation {
        peer: Peer,
        command: String,
        state: ConnectionState,
    },
    #[error("connection to {0} failed: {1}")]
    ConnectionFailed(Peer, #[source] std::io::Error),
    #[error("i/o error on {peer}: {source}")]
    Io {
        peer: Peer,
        #[source]
        source: std::io::Error,
    },
    #[error("peer {0} disconnected")]
    Disconnected(Peer),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot send to {0}: handshake not complete")]
    NotHandshaked(Peer),
    #[error("connection to {0} is closed")]
    Closed(Peer),
}

/// What the connection task should do with a decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Write this message back to the peer.
    Reply(ProtocolMessage),
    /// The handshake just completed; the remote `version` is attached.
    HandshakeComplete(VersionMessage),
    /// Hand the message to the node event loop.
    Forward(ProtocolMessage),
}

/// Inbound state machine for one peer.
pub struct PeerMessageReceiver {
    peer: Peer,
    state: ConnectionState,
    codec: FrameCodec,
    buffer: BytesMut,
    remote_version: Option<VersionMessage>,
    verack_seen: bool,
}

impl PeerMessageReceiver {
    pub fn new(peer: Peer, magic: [u8; 4]) -> Self {
        Self {
            peer,
            state: ConnectionState::Preconnection,
            codec: FrameCodec::new(magic),
            buffer: BytesMut::new(),
            remote_version: None,
            verack_seen: false,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The remote `version` message, available once the handshake completed.
    pub fn remote_version(&self) -> Option<&VersionMessage> {
        self.remote_version.as_ref()
    }

    /// The TCP connection is up.
    pub fn connection_established(&mut self) {
        if self.state == ConnectionState::Preconnection {
            self.state = ConnectionState::Connected;
        }
    }

    /// The local `version` message went out; handshake replies may now arrive.
    pub fn version_sent(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Handshaking;
        }
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Feed raw bytes from the stream and collect reactions for every
    /// complete frame. Frames may span calls or arrive several per call.
    ///
    /// A framing error or protocol violation moves the state machine to
    /// `Disconnected`; the caller is expected to drop the connection.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<Reaction>, PeerError> {
        self.buffer.extend_from_slice(bytes);

        let mut reactions = Vec::new();
        loop {
            let message = match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(reactions),
                Err(source) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(PeerError::Framing {
                        peer: self.peer,
                        source,
                    });
                }
            };
            self.handle(message, &mut reactions)?;
        }
    }

    fn handle(
        &mut self,
        message: ProtocolMessage,
        reactions: &mut Vec<Reaction>,
    ) -> Result<(), PeerError> {
        // Commands outside the catalogue are never fatal, whatever the state.
        if let ProtocolMessage::Unknown { command, payload } = &message {
            log::debug!(
                "unknown command '{}' ({} bytes) from {}",
                command,
                payload.len(),
                self.peer
            );
            // After the handshake the node may still care (block data comes
            // back under an uncatalogued command); before it, drop silently.
            if self.state == ConnectionState::Handshaked {
                reactions.push(Reaction::Forward(message));
            }
            return Ok(());
        }

        match self.state {
            ConnectionState::Handshaking => self.handle_handshaking(message, reactions),
            ConnectionState::Handshaked => {
                self.handle_established(message, reactions);
                Ok(())
            }
            state => {
                self.state = ConnectionState::Disconnected;
                Err(PeerError::ProtocolViolation {
                    peer: self.peer,
                    command: message.command().to_string(),
                    state,
                })
            }
        }
    }

    fn handle_handshaking(
        &mut self,
        message: ProtocolMessage,
        reactions: &mut Vec<Reaction>,
    ) -> Result<(), PeerError> {
        match message {
            ProtocolMessage::Version(version) => {
                log::debug!(
                    "peer {} is {} (services {:?}, height {})",
                    self.peer,
                    version.user_agent,
                    version.services,
                    version.start_height
                );
                self.remote_version = Some(version);
                reactions.push(Reaction::Reply(ProtocolMessage::Verack));
                self.maybe_complete(reactions);
                Ok(())
            }
            ProtocolMessage::Verack => {
                self.verack_seen = true;
                self.maybe_complete(reactions);
                Ok(())
            }
            other => {
                // A known message before the handshake finished is a
                // violation; tear the connection down.
                self.state = ConnectionState::Disconnected;
                Err(PeerError::ProtocolViolation {
                    peer: self.peer,
                    command: other.command().to_string(),
                    state: ConnectionState::Handshaking,
                })
            }
        }
    }

    fn maybe_complete(&mut self, reactions: &mut Vec<Reaction>) {
        // `version` and `verack` may arrive in either order; the handshake
        // completes once both are in.
        if self.verack_seen {
            if let Some(version) = self.remote_version.clone() {
                self.state = ConnectionState::Handshaked;
                reactions.push(Reaction::HandshakeComplete(version));
            }
        }
    }

    fn handle_established(&mut self, message: ProtocolMessage, reactions: &mut Vec<Reaction>) {
        match message {
            // Keepalive is answered here; the node never sees it.
            ProtocolMessage::Ping(nonce) => {
                reactions.push(Reaction::Reply(ProtocolMessage::Pong(nonce)));
            }
            ProtocolMessage::Version(_) | ProtocolMessage::Verack => {
                log::debug!("ignoring duplicate handshake message from {}", self.peer);
            }
            other => reactions.push(Reaction::Forward(other)),
        }
    }
}

/// Outbound handle for one peer.
///
/// Messages are queued onto the connection's writer task. Application
/// messages are rejected until [`PeerMessageSender::mark_handshaked`] is
/// called; `version`/`verack` always pass.
#[derive(Clone)]
pub struct PeerMessageSender {
    peer: Peer,
    queue: mpsc::Sender<ProtocolMessage>,
    handshaked: Arc<AtomicBool>,
}

impl PeerMessageSender {
    pub fn new(peer: Peer, queue: mpsc::Sender<ProtocolMessage>) -> Self {
        Self {
            peer,
            queue,
            handshaked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    pub fn mark_handshaked(&self) {
        self.handshaked.store(true, Ordering::Release);
    }

    pub async fn send(&self, message: ProtocolMessage) -> Result<(), SendError> {
        if !message.is_handshake_message() && !self.is_handshaked() {
            return Err(SendError::NotHandshaked(self.peer));
        }
        self.queue
            .send(message)
            .await
            .map_err(|_| SendError::Closed(self.peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BlockHash;
    use crate::network::message::{GetHeadersMessage, ServiceFlags};
    use tokio_util::codec::Encoder;

    const MAGIC: [u8; 4] = [0xFA, 0xBF, 0xB5, 0xDA];

    fn peer() -> Peer {
        Peer::new("127.0.0.1:18444".parse().unwrap())
    }

    fn frame(message: ProtocolMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(MAGIC).encode(message, &mut buf).unwrap();
        buf
    }

    fn remote_version() -> VersionMessage {
        VersionMessage::new(
            70016,
            ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_COMPACT_FILTERS,
            "127.0.0.1:0".parse().unwrap(),
            100,
            "/peer:1.0/",
        )
    }

    fn handshaking_receiver() -> PeerMessageReceiver {
        let mut receiver = PeerMessageReceiver::new(peer(), MAGIC);
        receiver.connection_established();
        receiver.version_sent();
        receiver
    }

    #[test]
    fn handshake_version_then_verack() {
        let mut receiver = handshaking_receiver();

        let reactions = receiver.receive(&frame(ProtocolMessage::Version(remote_version()))).unwrap();
        assert_eq!(reactions, vec![Reaction::Reply(ProtocolMessage::Verack)]);
        assert_eq!(receiver.state(), ConnectionState::Handshaking);

        let reactions = receiver.receive(&frame(ProtocolMessage::Verack)).unwrap();
        assert!(matches!(reactions.as_slice(), [Reaction::HandshakeComplete(_)]));
        assert_eq!(receiver.state(), ConnectionState::Handshaked);
    }

    #[test]
    fn handshake_verack_then_version() {
        let mut receiver = handshaking_receiver();

        assert!(receiver.receive(&frame(ProtocolMessage::Verack)).unwrap().is_empty());

        let reactions = receiver.receive(&frame(ProtocolMessage::Version(remote_version()))).unwrap();
        assert!(matches!(
            reactions.as_slice(),
            [Reaction::Reply(ProtocolMessage::Verack), Reaction::HandshakeComplete(_)]
        ));
        assert_eq!(receiver.state(), ConnectionState::Handshaked);
    }

    #[test]
    fn chain_message_during_handshake_is_a_violation() {
        let mut receiver = handshaking_receiver();
        let message = ProtocolMessage::GetHeaders(GetHeadersMessage {
            version: 70016,
            locator: vec![],
            stop_hash: BlockHash::ZERO,
        });

        let err = receiver.receive(&frame(message)).unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation { .. }));
        assert_eq!(receiver.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unknown_command_during_handshake_is_tolerated() {
        let mut receiver = handshaking_receiver();
        let message = ProtocolMessage::Unknown {
            command: "sendaddrv2".to_string(),
            payload: vec![],
        };

        assert!(receiver.receive(&frame(message)).unwrap().is_empty());
        assert_eq!(receiver.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let mut receiver = handshaking_receiver();
        let bytes = frame(ProtocolMessage::Version(remote_version()));

        let (a, b) = bytes.split_at(10);
        assert!(receiver.receive(a).unwrap().is_empty());
        let reactions = receiver.receive(b).unwrap();
        assert_eq!(reactions, vec![Reaction::Reply(ProtocolMessage::Verack)]);
    }

    #[test]
    fn ping_is_answered_after_handshake() {
        let mut receiver = handshaking_receiver();
        receiver.receive(&frame(ProtocolMessage::Version(remote_version()))).unwrap();
        receiver.receive(&frame(ProtocolMessage::Verack)).unwrap();

        let reactions = receiver.receive(&frame(ProtocolMessage::Ping(77))).unwrap();
        assert_eq!(reactions, vec![Reaction::Reply(ProtocolMessage::Pong(77))]);
    }

    #[test]
    fn corrupt_frame_disconnects() {
        let mut receiver = handshaking_receiver();
        let mut bytes = frame(ProtocolMessage::Verack);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        // Corrupting the last byte of verack corrupts the checksum field
        // itself since verack has no payload.
        assert!(matches!(
            receiver.receive(&bytes),
            Err(PeerError::Framing { .. })
        ));
        assert_eq!(receiver.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn sender_gates_on_handshake() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = PeerMessageSender::new(peer(), tx);

        let err = sender.send(ProtocolMessage::Ping(1)).await.unwrap_err();
        assert!(matches!(err, SendError::NotHandshaked(_)));

        // Handshake traffic always passes.
        sender.send(ProtocolMessage::Verack).await.unwrap();
        assert_eq!(rx.recv().await, Some(ProtocolMessage::Verack));

        sender.mark_handshaked();
        sender.send(ProtocolMessage::Ping(1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(ProtocolMessage::Ping(1)));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = PeerMessageSender::new(peer(), tx);
        sender.mark_handshaked();
        assert!(matches!(
            sender.send(ProtocolMessage::Ping(9)).await,
            Err(SendError::Closed(_))
        ));
    }
}
