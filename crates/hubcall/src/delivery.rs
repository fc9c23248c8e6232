//! The delivery task: one per messenger, handling inbound traffic in
//! arrival order.
//!
//! ```text
//! transport events ──┐
//!                    ├──▶ DeliveryTask ──▶ hub (server only)
//! loopback/commands ─┘         │
//!                              └──▶ WorkerPool ──▶ Endpoint::invoke_local
//! ```

use std::sync::Arc;

use hubcall_hub::{MessengerHub, Outbound};
use hubcall_protocol::{
    CallId, Codec, ErrorKind, MessengerMessage, RemoteMethodCall, RemoteMethodCallResults,
};
use hubcall_transport::{EventReceiver, Node, TransportEvent};
use tokio::sync::{mpsc, oneshot};

use crate::messenger::Shared;

/// Work for the delivery task that does not come from the transport.
pub(crate) enum Command {
    /// A message this node sent to itself.
    Loopback(MessengerMessage),
    /// Asks the hub which nodes own `name`.
    OwnersOf {
        name: String,
        reply: oneshot::Sender<Vec<Node>>,
    },
}

pub(crate) struct DeliveryTask<C: Codec> {
    shared: Arc<Shared<C>>,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
    hub: Option<MessengerHub>,
}

impl<C: Codec> DeliveryTask<C> {
    pub(crate) fn new(
        shared: Arc<Shared<C>>,
        events: EventReceiver,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let hub = shared
            .transport()
            .is_server()
            .then(|| MessengerHub::new(shared.local_node().clone()));
        Self {
            shared,
            events,
            commands,
            hub,
        }
    }

    /// Runs until the transport's event stream ends.
    pub(crate) async fn run(mut self) {
        tracing::debug!(node = %self.shared.local_node(), hub = self.hub.is_some(), "delivery task started");

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => self.on_command(command),
                event = self.events.recv() => match event {
                    Some(TransportEvent::Message { from, data }) => self.on_bytes(from, &data),
                    Some(TransportEvent::PeerRemoved(node)) => self.on_peer_removed(&node),
                    Some(TransportEvent::Invalid { reason }) => self.shared.invalidate(&reason),
                    None => {
                        self.shared.invalidate("transport event stream closed");
                        break;
                    }
                },
            }
        }

        tracing::debug!(node = %self.shared.local_node(), "delivery task stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Loopback(message) => {
                let local = self.shared.local_node().clone();
                self.dispatch(&local, message);
            }
            Command::OwnersOf { name, reply } => {
                let owners = self
                    .hub
                    .as_ref()
                    .map(|hub| hub.nodes_for(&name))
                    .unwrap_or_default();
                let _ = reply.send(owners);
            }
        }
    }

    fn on_bytes(&mut self, from: Node, data: &[u8]) {
        match self.shared.codec().decode::<MessengerMessage>(data) {
            Ok(message) => self.dispatch(&from, message),
            Err(e) => self.violation(&from, &format!("undecodable message: {e}")),
        }
    }

    fn on_peer_removed(&mut self, node: &Node) {
        if let Some(hub) = self.hub.as_mut() {
            let outbound = hub.node_removed(node);
            self.send_all(outbound);
        } else if node == self.shared.server_node() {
            self.shared.invalidate(&format!("lost server {node}"));
        } else {
            tracing::debug!(%node, "ignoring removal of a non-server peer");
        }
    }

    fn dispatch(&mut self, from: &Node, message: MessengerMessage) {
        tracing::debug!(%from, kind = message.kind(), "received");
        match message {
            MessengerMessage::SpokeInvoke {
                id,
                needs_reply,
                call,
                calling_node,
            } => {
                if from != self.shared.server_node() {
                    self.violation(from, "SpokeInvoke from a node that is not the server");
                    return;
                }
                self.on_spoke_invoke(id, needs_reply, call, calling_node);
            }
            MessengerMessage::HubInvocationResults { id, result } => {
                if from != self.shared.server_node() {
                    self.violation(from, "HubInvocationResults from a node that is not the server");
                    return;
                }
                if !self.shared.complete(&id, result) && !self.shared.is_invalid() {
                    self.violation(from, &format!("results for unknown call {id}"));
                }
            }
            hub_bound => {
                let Some(hub) = self.hub.as_mut() else {
                    self.violation(from, &format!("{} sent to a node without a hub", hub_bound.kind()));
                    return;
                };
                match hub.handle(from, hub_bound) {
                    Ok(outbound) => self.send_all(outbound),
                    Err(e) => self.violation(from, &e.to_string()),
                }
            }
        }
    }

    fn on_spoke_invoke(
        &self,
        id: Option<CallId>,
        needs_reply: bool,
        call: RemoteMethodCall,
        calling_node: Node,
    ) {
        let reply_id = match (needs_reply, id) {
            (true, Some(id)) => Some(id),
            (true, None) => {
                self.violation(self.shared.server_node(), "SpokeInvoke wants a reply but has no id");
                return;
            }
            (false, _) => None,
        };

        let Some(endpoint) = self.shared.endpoint(&call.remote_name) else {
            tracing::debug!(%call, "no local endpoint for spoke invoke");
            if let Some(id) = reply_id {
                let result = RemoteMethodCallResults::error(
                    ErrorKind::NotFound,
                    format!("{} has no implementor for {}", self.shared.local_node(), call.remote_name),
                );
                self.reply(id, result);
            }
            return;
        };

        // Numbers are taken here, in arrival order, before any worker runs.
        let number = endpoint.take_a_number();
        let shared = Arc::clone(&self.shared);
        let runner = Arc::clone(&endpoint);
        let job = move || {
            let results = runner.invoke_local(&call, number, &calling_node);
            if let Some(id) = reply_id {
                let result = single_result(results, &call);
                if let Err(e) = shared.send_to_server(MessengerMessage::SpokeInvocationResults { id, result }) {
                    tracing::warn!(%id, error = %e, "could not return spoke results");
                }
            }
        };
        if let Err(e) = self.shared.pool.execute(job) {
            tracing::warn!(error = %e, "dropping spoke invoke");
            tokio::task::spawn_blocking(move || endpoint.skip_number(number));
        }
    }

    fn reply(&self, id: CallId, result: RemoteMethodCallResults) {
        if let Err(e) = self
            .shared
            .send_to_server(MessengerMessage::SpokeInvocationResults { id, result })
        {
            tracing::warn!(%id, error = %e, "could not return spoke results");
        }
    }

    fn send_all(&self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            let kind = message.kind();
            if let Err(e) = self.shared.send(&to, message) {
                tracing::warn!(%to, kind, error = %e, "dropping hub message");
            }
        }
    }

    /// Logs a protocol violation and cuts the offending peer off. Registry
    /// state is left as it was.
    fn violation(&self, from: &Node, reason: &str) {
        tracing::error!(peer = %from, %reason, "protocol violation");
        if from == self.shared.local_node() {
            return;
        }
        if let Err(e) = self.shared.transport().disconnect(from) {
            tracing::warn!(peer = %from, error = %e, "could not disconnect peer");
        }
    }
}

/// A spoke answers for exactly one local implementor.
fn single_result(mut results: Vec<RemoteMethodCallResults>, call: &RemoteMethodCall) -> RemoteMethodCallResults {
    let count = results.len();
    match results.pop() {
        Some(result) if count == 1 => result,
        _ => RemoteMethodCallResults::error(
            ErrorKind::IllegalState,
            format!("expected one result for {call}, got {count}"),
        ),
    }
}
