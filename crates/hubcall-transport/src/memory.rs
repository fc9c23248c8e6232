//! In-process hub-and-spoke network.
//!
//! `MemoryNetwork` connects one server and any number of clients inside a
//! single process. It enforces the same topology as the WebSocket
//! messengers (spokes can only reach the server) and keeps a log of every
//! delivery so tests can assert exactly what crossed the "wire".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{EventReceiver, Messenger, Node, TransportError, TransportEvent};

/// One message that was handed to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: Node,
    pub to: Node,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    server: Option<Node>,
    /// Event sinks of every node that is currently linked.
    links: HashMap<Node, mpsc::UnboundedSender<TransportEvent>>,
    log: Vec<Delivery>,
}

/// A shared in-memory network. Cloning yields another handle to the same
/// network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Creates an empty network with no server.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the network as its server.
    ///
    /// # Errors
    /// [`TransportError::Handshake`] if a server is already present.
    pub fn server(&self, name: &str) -> Result<MemoryMessenger, TransportError> {
        let node = Node::new(name);
        let mut state = self.lock();
        if let Some(existing) = &state.server {
            return Err(TransportError::Handshake(format!(
                "network already has server {existing}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.server = Some(node.clone());
        state.links.insert(node.clone(), tx);
        tracing::debug!(%node, "memory server joined");

        Ok(MemoryMessenger {
            local: node.clone(),
            server: node,
            network: self.clone(),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Joins the network as a client of the current server.
    ///
    /// # Errors
    /// - [`TransportError::ConnectionClosed`] if there is no live server.
    /// - [`TransportError::Handshake`] if the name is already in use.
    pub fn client(&self, name: &str) -> Result<MemoryMessenger, TransportError> {
        let node = Node::new(name);
        let mut state = self.lock();
        let server = match &state.server {
            Some(server) if state.links.contains_key(server) => server.clone(),
            _ => {
                return Err(TransportError::ConnectionClosed(
                    "network has no server".into(),
                ));
            }
        };
        if state.links.contains_key(&node) {
            return Err(TransportError::Handshake(format!(
                "node name {node} is already in use"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(node.clone(), tx);
        tracing::debug!(%node, %server, "memory client joined");

        Ok(MemoryMessenger {
            local: node,
            server,
            network: self.clone(),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Cuts `node` off the network.
    ///
    /// The node itself sees [`TransportEvent::Invalid`]. When a client is
    /// cut, the server sees [`TransportEvent::PeerRemoved`]; when the server
    /// is cut, every client is invalidated too.
    pub fn disconnect(&self, node: &Node) {
        let mut state = self.lock();
        let Some(tx) = state.links.remove(node) else {
            return;
        };
        let _ = tx.send(TransportEvent::Invalid {
            reason: format!("{node} disconnected"),
        });

        if state.server.as_ref() == Some(node) {
            for (client, tx) in state.links.drain() {
                tracing::debug!(%client, "server gone, invalidating client");
                let _ = tx.send(TransportEvent::Invalid {
                    reason: format!("lost server {node}"),
                });
            }
        } else if let Some(server) = state.server.clone() {
            if let Some(server_tx) = state.links.get(&server) {
                let _ = server_tx.send(TransportEvent::PeerRemoved(node.clone()));
            }
        }
        tracing::debug!(%node, "memory node disconnected");
    }

    /// Reports the messenger of `node` as invalid without touching any
    /// link. Messages it already queued stay queued; nothing it sends later
    /// is answered from its point of view.
    pub fn invalidate(&self, node: &Node) {
        let state = self.lock();
        if let Some(tx) = state.links.get(node) {
            let _ = tx.send(TransportEvent::Invalid {
                reason: format!("{node} invalidated"),
            });
        }
    }

    /// Every delivery accepted so far, oldest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().log.clone()
    }

    /// Forgets the delivery log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn deliver(&self, from: &Node, to: &Node, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.links.contains_key(from) {
            return Err(TransportError::ConnectionClosed(format!(
                "{from} is no longer linked"
            )));
        }
        let from_server = state.server.as_ref() == Some(from);
        let to_server = state.server.as_ref() == Some(to);
        if from == to || (!from_server && !to_server) {
            return Err(TransportError::UnknownPeer(to.clone()));
        }
        let tx = state
            .links
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        tx.send(TransportEvent::Message {
            from: from.clone(),
            data: data.clone(),
        })
        .map_err(|_| TransportError::ConnectionClosed(format!("{to} stopped listening")))?;

        state.log.push(Delivery {
            from: from.clone(),
            to: to.clone(),
            data,
        });
        Ok(())
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryMessenger {
    local: Node,
    server: Node,
    network: MemoryNetwork,
    events: Mutex<Option<EventReceiver>>,
}

impl MemoryMessenger {
    /// The network this messenger belongs to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Messenger for MemoryMessenger {
    fn send(&self, to: &Node, data: Vec<u8>) -> Result<(), TransportError> {
        self.network.deliver(&self.local, to, data)
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
        if self.is_server() && node != &self.local {
            self.network.disconnect(node);
            Ok(())
        } else if node == &self.server {
            self.network.disconnect(&self.local);
            Ok(())
        } else {
            Err(TransportError::UnknownPeer(node.clone()))
        }
    }
}
