//! Transport abstraction layer for hubcall.
//!
//! Two levels of abstraction live here:
//!
//! - [`Transport`] and [`Connection`] move raw bytes over one
//!   connection-oriented protocol (WebSocket today).
//! - [`Messenger`] is what the invocation layer consumes: a node-addressed,
//!   hub-and-spoke view of the network. A messenger knows its own
//!   [`Node`], the server node, and delivers everything that happens on the
//!   network as a single ordered stream of [`TransportEvent`]s.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket transport and messengers via
//!   `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{Delivery, MemoryMessenger, MemoryNetwork};
#[cfg(feature = "websocket")]
pub use websocket::{
    WebSocketClientMessenger, WebSocketConnection, WebSocketServerMessenger,
    WebSocketTransport,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Address of a participant in the distributed session.
///
/// Nodes are identified by a name that is unique within one network. The
/// server assigns the final name during the handshake, so two clients
/// asking for the same name still end up distinct.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Node(String);

impl Node {
    /// Creates a node from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the node's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened on the network, as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived from `from`.
    ///
    /// Messages from one node are delivered in the order that node sent them.
    Message { from: Node, data: Vec<u8> },

    /// The link to a single peer is gone. Only the server sees this for
    /// individual spokes; a spoke losing the server gets [`Invalid`](Self::Invalid).
    PeerRemoved(Node),

    /// The messenger as a whole is no longer usable.
    Invalid { reason: String },
}

/// Receiving half of a messenger's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Node-addressed messaging in a hub-and-spoke topology.
///
/// `send` never blocks: implementations enqueue the bytes and deliver them
/// in the background, which lets the invocation layer send from its
/// delivery task and from blocking worker threads alike.
pub trait Messenger: Send + Sync + 'static {
    /// Queues `data` for delivery to `to`.
    fn send(&self, to: &Node, data: Vec<u8>) -> Result<(), TransportError>;

    /// The node this messenger speaks for.
    fn local_node(&self) -> &Node;

    /// The node acting as server (hub) for this network.
    fn server_node(&self) -> &Node;

    /// Whether this messenger is the server.
    fn is_server(&self) -> bool {
        self.local_node() == self.server_node()
    }

    /// Hands out the event stream. Can only be called once.
    fn subscribe(&self) -> Result<EventReceiver, TransportError>;

    /// Drops the link to `node`. A spoke disconnecting the server
    /// invalidates itself.
    fn disconnect(&self, node: &Node) -> Result<(), TransportError>;
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
