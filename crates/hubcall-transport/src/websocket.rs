//! WebSocket transport and messengers using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] / [`WebSocketConnection`] implement the
//! byte-level [`Transport`] / [`Connection`] traits. On top of them,
//! [`WebSocketServerMessenger`] and [`WebSocketClientMessenger`] implement
//! the node-level [`Messenger`] for a hub-and-spoke session: clients only
//! ever talk to the server.
//!
//! Naming handshake, once per connection:
//!
//! ```text
//! client → server   "<requested name>"
//! server → client   "<assigned name>\n<server name>"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{
    Connection, ConnectionId, EventReceiver, Messenger, Node, Transport,
    TransportError, TransportEvent,
};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long either side waits for the naming handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| {
                TransportError::AcceptFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                ))
            })?;

        let conn = WebSocketConnection::from_stream(ws);
        tracing::debug!(id = %conn.id, %addr, "accepted WebSocket connection");
        Ok(conn)
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A single WebSocket connection.
///
/// The stream is split so a task blocked in [`recv`](Connection::recv)
/// never holds up a concurrent [`send`](Connection::send).
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WebSocketConnection {
    fn from_stream(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Opens a client connection to `ws://{addr}`.
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .map_err(|e| {
                TransportError::ConnectionClosed(format!("connect to {addr} failed: {e}"))
            })?;
        let conn = Self::from_stream(ws);
        tracing::debug!(id = %conn.id, addr, "opened WebSocket connection");
        Ok(conn)
    }
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let msg = Message::Binary(data.to_vec().into());
        self.sink.lock().await.send(msg).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        loop {
            let msg = self.stream.lock().await.next().await;
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Messengers
// ---------------------------------------------------------------------------

type PeerTable = Arc<StdMutex<HashMap<Node, mpsc::UnboundedSender<Vec<u8>>>>>;

fn lock_peers(peers: &PeerTable) -> MutexGuard<'_, HashMap<Node, mpsc::UnboundedSender<Vec<u8>>>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn recv_handshake(conn: &WebSocketConnection) -> Result<String, TransportError> {
    let data = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(TransportError::Handshake(
                "connection closed before handshake".into(),
            ));
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(TransportError::Handshake("handshake timed out".into())),
    };
    String::from_utf8(data)
        .map_err(|_| TransportError::Handshake("handshake is not valid UTF-8".into()))
}

fn validate_name(name: &str) -> Result<(), TransportError> {
    if name.is_empty() || name.contains('\n') {
        return Err(TransportError::Handshake(format!("invalid node name {name:?}")));
    }
    Ok(())
}

/// `requested` if nobody holds it, otherwise the first of `requested-2`,
/// `requested-3`, ... that is free.
fn free_name(requested: &str, taken: impl Fn(&Node) -> bool) -> Node {
    let node = Node::new(requested);
    if !taken(&node) {
        return node;
    }
    (2u64..)
        .map(|suffix| Node::new(format!("{requested}-{suffix}")))
        .find(|candidate| !taken(candidate))
        .unwrap_or(node)
}

/// Spawns the task that drains a link's outbound queue onto the socket.
/// Dropping every sender of the queue closes the connection.
fn spawn_writer(
    conn: Arc<WebSocketConnection>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = outbound.recv().await {
            if let Err(e) = conn.send(&data).await {
                tracing::debug!(id = %conn.id(), error = %e, "send failed, closing writer");
                break;
            }
        }
        let _ = conn.close().await;
    })
}

/// Server side of a WebSocket hub-and-spoke session.
pub struct WebSocketServerMessenger {
    local: Node,
    local_addr: SocketAddr,
    peers: PeerTable,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events: StdMutex<Option<EventReceiver>>,
    accept_task: JoinHandle<()>,
}

impl WebSocketServerMessenger {
    /// Binds to `addr` and starts accepting clients, acting as server `name`.
    pub async fn bind(addr: &str, name: &str) -> Result<Self, TransportError> {
        validate_name(name)?;
        let mut transport = WebSocketTransport::bind(addr).await?;
        let local_addr = transport.local_addr().map_err(TransportError::AcceptFailed)?;
        let local = Node::new(name);
        let peers: PeerTable = Arc::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let accept_task = {
            let local = local.clone();
            let peers = Arc::clone(&peers);
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match transport.accept().await {
                        Ok(conn) => {
                            tokio::spawn(serve_client(
                                conn,
                                local.clone(),
                                Arc::clone(&peers),
                                events_tx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
            })
        };

        tracing::info!(node = %local, %local_addr, "server messenger running");
        Ok(Self {
            local,
            local_addr,
            peers,
            events_tx,
            events: StdMutex::new(Some(events_rx)),
            accept_task,
        })
    }

    /// The socket address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Currently connected spokes.
    pub fn peers(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = lock_peers(&self.peers).keys().cloned().collect();
        nodes.sort();
        nodes
    }
}

impl Drop for WebSocketServerMessenger {
    fn drop(&mut self) {
        self.accept_task.abort();
        lock_peers(&self.peers).clear();
    }
}

/// Runs one client link from handshake to close.
async fn serve_client(
    conn: WebSocketConnection,
    server: Node,
    peers: PeerTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let conn = Arc::new(conn);
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let node = match register_client(&conn, &server, &peers, out_tx).await {
        Ok(node) => node,
        Err(e) => {
            tracing::debug!(id = %conn.id(), error = %e, "client handshake failed");
            let _ = conn.close().await;
            return;
        }
    };
    tracing::info!(%node, id = %conn.id(), "client joined");

    let writer = spawn_writer(Arc::clone(&conn), out_rx);

    loop {
        match conn.recv().await {
            Ok(Some(data)) => {
                let event = TransportEvent::Message {
                    from: node.clone(),
                    data,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(%node, "client closed connection");
                break;
            }
            Err(e) => {
                tracing::debug!(%node, error = %e, "client recv error");
                break;
            }
        }
    }

    // A link removed through `disconnect` has already been reported.
    let removed = lock_peers(&peers).remove(&node).is_some();
    if removed {
        let _ = events.send(TransportEvent::PeerRemoved(node));
    }
    writer.abort();
}

/// Reads the requested name, assigns a unique one and registers the link.
async fn register_client(
    conn: &WebSocketConnection,
    server: &Node,
    peers: &PeerTable,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<Node, TransportError> {
    let requested = recv_handshake(conn).await?;
    validate_name(&requested)?;

    let node = {
        let mut table = lock_peers(peers);
        let node = free_name(&requested, |candidate| {
            table.contains_key(candidate) || candidate == server
        });
        table.insert(node.clone(), outbound);
        node
    };

    let reply = format!("{node}\n{server}");
    if let Err(e) = conn.send(reply.as_bytes()).await {
        lock_peers(peers).remove(&node);
        return Err(e);
    }
    Ok(node)
}

impl Messenger for WebSocketServerMessenger {
    fn send(&self, to: &Node, data: Vec<u8>) -> Result<(), TransportError> {
        let table = lock_peers(&self.peers);
        let link = table
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        link.send(data)
            .map_err(|_| TransportError::ConnectionClosed(format!("link to {to} closed")))
    }

    fn local_node(&self) -> &Node {
        &self.local
    }

    fn server_node(&self) -> &Node {
        &self.local
    }

    fn subscribe(&self) -> Result<EventReceiver, TransportError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    fn disconnect(&self, node: &Node) -> Result<(), TransportError> {
        // Dropping the sender ends the writer, which closes the socket.
        let removed = lock_peers(&self.peers).remove(node);
        if removed.is_none() {
            return Err(TransportError::UnknownPeer(node.clone()));
        }
        tracing::info!(%node, "disconnecting client");
        let _ = self.events_tx.send(TransportEvent::PeerRemoved(node.clone()));
        Ok(())
    }
}

/// Client side of a WebSocket hub-and-spoke session.
pub struct WebSocketClientMessenger {
    local: Node,
    server: Node,
    outbound: Arc<StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    events: StdMutex<Option<EventReceiver>>,
    reader: JoinHandle<()>,
}

impl WebSocketClientMessenger {
    /// Connects to the server at `addr`, asking to be called `name`.
    ///
    /// The server may assign a different name if `name` is taken; check
    /// [`local_node`](Messenger::local_node) afterwards.
    pub async fn connect(addr: &str, name: &str) -> Result<Self, TransportError> {
        validate_name(name)?;
        let conn = Arc::new(WebSocketConnection::connect(addr).await?);
        conn.send(name.as_bytes()).await?;

        let reply = recv_handshake(&conn).await?;
        let (assigned, server) = reply
            .split_once('\n')
            .ok_or_else(|| TransportError::Handshake(format!("malformed reply {reply:?}")))?;
        let local = Node::new(assigned);
        let server = Node::new(server);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(StdMutex::new(Some(out_tx)));

        let writer = spawn_writer(Arc::clone(&conn), out_rx);
        let reader = {
            let server = server.clone();
            let outbound = Arc::clone(&outbound);
            tokio::spawn(async move {
                let reason = loop {
                    match conn.recv().await {
                        Ok(Some(data)) => {
                            let event = TransportEvent::Message {
                                from: server.clone(),
                                data,
                            };
                            if events_tx.send(event).is_err() {
                                break "messenger dropped".to_string();
                            }
                        }
                        Ok(None) => break format!("server {server} closed the connection"),
                        Err(e) => break format!("lost server {server}: {e}"),
                    }
                };
                tracing::info!(%reason, "client link ended");
                outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
                let _ = events_tx.send(TransportEvent::Invalid { reason });
                writer.abort();
            })
        };

        tracing::info!(node = %local, %server, "client messenger connected");
        Ok(Self {
            local,
            server,
            outbound,
            events: StdMutex::new(Some(events_rx)),
            reader,
        })
    }
}

impl Drop for WebSocketClientMessenger {
    fn drop(&mut self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.reader.abort();
    }
}

impl Messenger for WebSocketClientMessenger {
    fn send(&self, to: &Node, data: Vec<u8>) -> Result<(), TransportError> {
        if to != &self.server {
            return Err(TransportError::UnknownPeer(to.clone()));
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let link = outbound
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionClosed("link to server closed".into()))?;
        link.send(data)
            .map_err(|_| TransportError::ConnectionClosed("link to server closed".into()))
    }

    fn local_node(&self) -> &Node {
        &self.local
    }

    fn server_node(&self) -> &Node {
        &self.server
    }

    fn subscribe(&self) -> Result<EventReceiver, TransportError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    fn disconnect(&self, node: &Node) -> Result<(), TransportError> {
        if node != &self.server {
            return Err(TransportError::UnknownPeer(node.clone()));
        }
        // The reader reports `Invalid` once the socket is closed.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_free_name_keeps_an_unused_name() {
        assert_eq!(free_name("alice", |_| false), Node::new("alice"));
    }

    #[test]
    fn test_free_name_skips_every_taken_suffix() {
        let taken: HashSet<Node> = ["a", "a-2", "a-3", "a-5"].into_iter().map(Node::new).collect();
        assert_eq!(free_name("a", |n| taken.contains(n)), Node::new("a-4"));
    }
}
