//! The routing state machine.

use std::collections::{BTreeSet, HashMap};

use hubcall_protocol::{
    CallId, ErrorKind, MessengerMessage, RemoteMethodCall, RemoteMethodCallResults,
};
use hubcall_transport::Node;

use crate::HubError;

/// A message the hub wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Node,
    pub message: MessengerMessage,
}

impl Outbound {
    fn new(to: Node, message: MessengerMessage) -> Self {
        Self { to, message }
    }
}

/// A hub invoke whose spokes have not all answered yet.
#[derive(Debug, Clone)]
pub struct InvocationInProgress {
    caller: Node,
    waiting_on: BTreeSet<Node>,
    result: Option<RemoteMethodCallResults>,
}

impl InvocationInProgress {
    /// The node that will receive the final result.
    pub fn caller(&self) -> &Node {
        &self.caller
    }

    /// Spokes that still owe a result.
    pub fn waiting_on(&self) -> impl Iterator<Item = &Node> {
        self.waiting_on.iter()
    }

    /// Folds in one spoke's result. The first value wins; errors are only
    /// kept until a value shows up. Returns `true` once nobody is left.
    fn record(&mut self, from: &Node, result: RemoteMethodCallResults) -> bool {
        self.waiting_on.remove(from);
        let replace = match &self.result {
            None => true,
            Some(kept) => !kept.is_value() && result.is_value(),
        };
        if replace {
            self.result = Some(result);
        }
        self.waiting_on.is_empty()
    }
}

/// The server-side routing authority.
///
/// Knows which nodes host an implementor for which endpoint name, fans hub
/// invokes out to them, and collects their results. It never touches the
/// network: every handler returns the messages to send, in order.
///
/// ## Aggregation
///
/// A call that reaches several owners waits for all of them and returns
/// one result to the caller: the first value received, or the first error
/// if every owner failed.
#[derive(Debug)]
pub struct MessengerHub {
    server: Node,
    registry: HashMap<String, BTreeSet<Node>>,
    in_progress: HashMap<CallId, InvocationInProgress>,
}

impl MessengerHub {
    /// Creates a hub with an empty registry for the server `server`.
    pub fn new(server: Node) -> Self {
        Self {
            server,
            registry: HashMap::new(),
            in_progress: HashMap::new(),
        }
    }

    /// The node this hub runs on.
    pub fn server(&self) -> &Node {
        &self.server
    }

    /// Handles one message from `from`.
    ///
    /// # Errors
    /// A [`HubError`] when the message violates the protocol. Nothing is
    /// changed in that case.
    pub fn handle(&mut self, from: &Node, message: MessengerMessage) -> Result<Vec<Outbound>, HubError> {
        match message {
            MessengerMessage::HubInvoke {
                id,
                needs_reply,
                call,
            } => self.hub_invoke(from, id, needs_reply, call),
            MessengerMessage::SpokeInvocationResults { id, result } => {
                self.spoke_results(from, id, result)
            }
            MessengerMessage::HasEndPointImplementor { name } => {
                tracing::debug!(node = %from, %name, "node hosts endpoint");
                self.registry.entry(name).or_default().insert(from.clone());
                Ok(Vec::new())
            }
            MessengerMessage::NoLongerHasEndPointImplementor { name } => {
                tracing::debug!(node = %from, %name, "node dropped endpoint");
                if let Some(nodes) = self.registry.get_mut(&name) {
                    nodes.remove(from);
                    if nodes.is_empty() {
                        self.registry.remove(&name);
                    }
                }
                Ok(Vec::new())
            }
            other @ (MessengerMessage::SpokeInvoke { .. }
            | MessengerMessage::HubInvocationResults { .. }) => {
                Err(HubError::Misrouted { kind: other.kind() })
            }
        }
    }

    fn hub_invoke(
        &mut self,
        caller: &Node,
        id: Option<CallId>,
        needs_reply: bool,
        call: RemoteMethodCall,
    ) -> Result<Vec<Outbound>, HubError> {
        let reply_id = match (needs_reply, id) {
            (true, None) => {
                return Err(HubError::MissingCallId {
                    from: caller.clone(),
                });
            }
            (true, Some(id)) if self.in_progress.contains_key(&id) => {
                return Err(HubError::DuplicateInvocation(id));
            }
            (true, Some(id)) => Some(id),
            (false, _) => None,
        };

        // The caller has already run its own local implementors.
        let targets: BTreeSet<Node> = self
            .registry
            .get(&call.remote_name)
            .map(|nodes| nodes.iter().filter(|n| *n != caller).cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::debug!(%caller, %call, "no remote owner");
            return Ok(match reply_id {
                Some(id) => vec![Outbound::new(
                    caller.clone(),
                    MessengerMessage::HubInvocationResults {
                        id,
                        result: RemoteMethodCallResults::error(
                            ErrorKind::NotFound,
                            format!("no implementor for {}", call.remote_name),
                        ),
                    },
                )],
                None => Vec::new(),
            });
        }

        tracing::debug!(%caller, %call, targets = targets.len(), needs_reply, "fanning out");
        let outbound = targets
            .iter()
            .map(|target| {
                Outbound::new(
                    target.clone(),
                    MessengerMessage::SpokeInvoke {
                        id,
                        needs_reply,
                        call: call.clone(),
                        calling_node: caller.clone(),
                    },
                )
            })
            .collect();

        if let Some(id) = reply_id {
            self.in_progress.insert(
                id,
                InvocationInProgress {
                    caller: caller.clone(),
                    waiting_on: targets,
                    result: None,
                },
            );
        }
        Ok(outbound)
    }

    fn spoke_results(
        &mut self,
        from: &Node,
        id: CallId,
        result: RemoteMethodCallResults,
    ) -> Result<Vec<Outbound>, HubError> {
        let invocation = self
            .in_progress
            .get_mut(&id)
            .ok_or(HubError::UnknownInvocation(id))?;
        if !invocation.waiting_on.contains(from) {
            return Err(HubError::UnexpectedReply {
                id,
                from: from.clone(),
            });
        }
        Ok(self.record(id, from, result).into_iter().collect())
    }

    /// Records a result and, when it was the last one owed, removes the
    /// invocation and returns the reply for its caller.
    fn record(&mut self, id: CallId, from: &Node, result: RemoteMethodCallResults) -> Option<Outbound> {
        let done = self.in_progress.get_mut(&id)?.record(from, result);
        if !done {
            return None;
        }
        let invocation = self.in_progress.remove(&id)?;
        let result = invocation.result?;
        tracing::debug!(%id, caller = %invocation.caller, "invocation complete");
        Some(Outbound::new(
            invocation.caller,
            MessengerMessage::HubInvocationResults { id, result },
        ))
    }

    /// Forgets `node`: it no longer owns any endpoint, and every invocation
    /// still waiting on it gets a connection-lost result in its place.
    pub fn node_removed(&mut self, node: &Node) -> Vec<Outbound> {
        self.registry.retain(|_, nodes| {
            nodes.remove(node);
            !nodes.is_empty()
        });

        let mut stalled: Vec<CallId> = self
            .in_progress
            .iter()
            .filter(|(_, invocation)| invocation.waiting_on.contains(node))
            .map(|(id, _)| *id)
            .collect();
        stalled.sort_by_key(|id| id.sequence());

        tracing::info!(%node, stalled = stalled.len(), "node removed from hub");
        stalled
            .into_iter()
            .filter_map(|id| {
                let lost = RemoteMethodCallResults::error(
                    ErrorKind::ConnectionLost,
                    format!("lost connection to {node}"),
                );
                self.record(id, node, lost)
            })
            .collect()
    }

    /// Nodes currently hosting an implementor for `name`, sorted.
    pub fn nodes_for(&self, name: &str) -> Vec<Node> {
        self.registry
            .get(name)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of hub invokes still waiting on spokes.
    pub fn invocations_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    /// Looks up one invocation in progress.
    pub fn invocation(&self, id: &CallId) -> Option<&InvocationInProgress> {
        self.in_progress.get(id)
    }
}
