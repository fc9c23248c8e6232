use crate::Node;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// There is no link from this node to the target node.
    ///
    /// In a hub-and-spoke network a spoke only has a link to the server,
    /// and the server only has links to currently connected spokes.
    #[error("no link to node {0}")]
    UnknownPeer(Node),

    /// The event stream was already handed out to another subscriber.
    #[error("messenger events already subscribed")]
    AlreadySubscribed,

    /// The node-naming handshake failed or was malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}
