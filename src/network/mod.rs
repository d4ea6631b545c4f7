//! P2P networking
//!
//! Layered bottom-up: [`codec`] frames messages, [`message`] models them,
//! [`peer`] runs the per-connection handshake state machine, [`sync`]
//! decides what to request next, and [`node`] ties it all together around
//! one event loop. [`callbacks`] is the application-facing surface.

pub mod callbacks;
pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod sync;

pub use callbacks::NodeCallbacks;
pub use codec::{FrameCodec, FramingError, MAX_MESSAGE_SIZE};
pub use message::{ProtocolMessage, ServiceFlags, TxMessage, VersionMessage};
pub use node::{Node, NodeError, PeerEvent};
pub use peer::{ConnectionState, Peer, PeerError, PeerMessageReceiver, PeerMessageSender};
pub use sync::{SyncManager, SyncMode};
