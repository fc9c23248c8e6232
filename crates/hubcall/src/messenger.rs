//! `UnifiedMessenger`: the façade tying endpoints, the hub, and the
//! transport together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hubcall_endpoint::{Endpoint, Implementor, provides};
use hubcall_protocol::{
    CallId, CallIdGenerator, Codec, ErrorKind, JsonCodec, MessengerMessage, RemoteMethodCall,
    RemoteMethodCallResults, RemoteName,
};
use hubcall_transport::{Messenger, Node};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::delivery::{Command, DeliveryTask};
use crate::{HubcallError, MessengerConfig, WorkerPool};

/// Calls waiting for a `HubInvocationResults`.
#[derive(Default)]
struct Pending {
    /// Set once the transport is gone; nothing new is registered after.
    invalid: bool,
    waiting: HashMap<CallId, oneshot::Sender<RemoteMethodCallResults>>,
}

/// State shared by the public handle, the delivery task, and workers.
pub(crate) struct Shared<C: Codec> {
    messenger: Arc<dyn Messenger>,
    codec: C,
    ids: CallIdGenerator,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    pending: Mutex<Pending>,
    commands: mpsc::UnboundedSender<Command>,
    pub(crate) pool: WorkerPool,
}

impl<C: Codec> Shared<C> {
    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    pub(crate) fn transport(&self) -> &dyn Messenger {
        self.messenger.as_ref()
    }

    pub(crate) fn local_node(&self) -> &Node {
        self.messenger.local_node()
    }

    pub(crate) fn server_node(&self) -> &Node {
        self.messenger.server_node()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints().get(name).cloned()
    }

    /// Sends `message` to `to`. Messages for the local node go through the
    /// delivery task's loopback queue instead of the transport.
    pub(crate) fn send(&self, to: &Node, message: MessengerMessage) -> Result<(), HubcallError> {
        tracing::debug!(%to, kind = message.kind(), "sending");
        if to == self.local_node() {
            return self
                .commands
                .send(Command::Loopback(message))
                .map_err(|_| HubcallError::ConnectionLost("messenger is shut down".into()));
        }
        let data = self.codec.encode(&message)?;
        self.messenger.send(to, data)?;
        Ok(())
    }

    pub(crate) fn send_to_server(&self, message: MessengerMessage) -> Result<(), HubcallError> {
        self.send(self.server_node(), message)
    }

    /// Registers a waiter for `id`, or `None` once the transport is invalid.
    fn register(&self, id: CallId) -> Option<oneshot::Receiver<RemoteMethodCallResults>> {
        let mut pending = self.pending();
        if pending.invalid {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.waiting.insert(id, tx);
        Some(rx)
    }

    fn forget(&self, id: &CallId) {
        self.pending().waiting.remove(id);
    }

    /// Hands `result` to the waiter for `id`. Returns `false` if nobody was
    /// waiting. A waiter that gave up is still a known id.
    pub(crate) fn complete(&self, id: &CallId, result: RemoteMethodCallResults) -> bool {
        let Some(tx) = self.pending().waiting.remove(id) else {
            return false;
        };
        if tx.send(result).is_err() {
            tracing::debug!(%id, "caller stopped waiting before the result arrived");
        }
        true
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.pending().invalid
    }

    /// Marks the transport as gone and completes every pending call with
    /// a connection-lost result.
    pub(crate) fn invalidate(&self, reason: &str) {
        let waiting = {
            let mut pending = self.pending();
            if pending.invalid {
                return;
            }
            pending.invalid = true;
            std::mem::take(&mut pending.waiting)
        };
        tracing::warn!(%reason, pending = waiting.len(), "messenger is no longer valid");
        for (_, tx) in waiting {
            let _ = tx.send(connection_lost(reason));
        }
    }
}

pub(crate) fn connection_lost(reason: &str) -> RemoteMethodCallResults {
    RemoteMethodCallResults::error(ErrorKind::ConnectionLost, reason)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`UnifiedMessenger`].
///
/// ```rust,no_run
/// # async fn run() -> Result<(), hubcall::HubcallError> {
/// use std::sync::Arc;
/// use hubcall::prelude::*;
///
/// let net = MemoryNetwork::new();
/// let host = UnifiedMessenger::builder(Arc::new(net.server("host")?))
///     .worker_count(4)
///     .start()?;
/// # Ok(())
/// # }
/// ```
pub struct UnifiedMessengerBuilder<C: Codec = JsonCodec> {
    messenger: Arc<dyn Messenger>,
    config: MessengerConfig,
    codec: C,
}

impl UnifiedMessengerBuilder<JsonCodec> {
    /// Creates a builder with default settings and the JSON codec.
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            config: MessengerConfig::default(),
            codec: JsonCodec,
        }
    }
}

impl<C: Codec> UnifiedMessengerBuilder<C> {
    /// Sets the number of workers running calls that arrive from the hub.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    /// Switches to another codec. Every node of a network must use the
    /// same one.
    pub fn codec<D: Codec>(self, codec: D) -> UnifiedMessengerBuilder<D> {
        UnifiedMessengerBuilder {
            messenger: self.messenger,
            config: self.config,
            codec,
        }
    }

    /// Subscribes to the transport and starts the delivery task.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// [`HubcallError::Transport`] if the transport's event stream was
    /// already taken.
    pub fn start(self) -> Result<UnifiedMessenger<C>, HubcallError> {
        let config = self.config.validated();
        let events = self.messenger.subscribe()?;
        let (commands, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            messenger: self.messenger,
            codec: self.codec,
            ids: CallIdGenerator::new(),
            endpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
            commands,
            pool: WorkerPool::new(config.worker_count),
        });

        tracing::info!(
            node = %shared.local_node(),
            server = %shared.server_node(),
            workers = config.worker_count,
            "messenger started"
        );
        let task = tokio::spawn(DeliveryTask::new(Arc::clone(&shared), events, command_rx).run());

        Ok(UnifiedMessenger { shared, task })
    }
}

// ---------------------------------------------------------------------------
// UnifiedMessenger
// ---------------------------------------------------------------------------

/// Location-transparent method invocation over a hub-and-spoke network.
///
/// Every node runs one. Calls to names with a local endpoint run in
/// process; everything else travels to the server's hub, which forwards
/// it to the nodes owning the name and routes the result back.
pub struct UnifiedMessenger<C: Codec = JsonCodec> {
    shared: Arc<Shared<C>>,
    task: JoinHandle<()>,
}

impl UnifiedMessenger<JsonCodec> {
    /// Creates a builder for a messenger on top of `messenger`.
    pub fn builder(messenger: Arc<dyn Messenger>) -> UnifiedMessengerBuilder<JsonCodec> {
        UnifiedMessengerBuilder::new(messenger)
    }
}

impl<C: Codec> UnifiedMessenger<C> {
    /// Calls `call.remote_name` and waits for the single result.
    ///
    /// With a local endpoint, the call runs here and nothing touches the
    /// network. Otherwise it goes through the hub. A lost transport is
    /// reported as a result of kind [`ErrorKind::ConnectionLost`], so this
    /// never waits on a connection that is already gone.
    ///
    /// # Errors
    /// - [`HubcallError::NotFound`] / [`HubcallError::TooManyImplementors`]
    ///   when a local endpoint yields zero or several results.
    /// - [`HubcallError::IllegalState`] if the pending call was dropped
    ///   without a result.
    pub async fn invoke_and_wait(&self, call: RemoteMethodCall) -> Result<RemoteMethodCallResults, HubcallError> {
        if let Some(endpoint) = self.shared.endpoint(&call.remote_name) {
            let name = call.remote_name.clone();
            let mut results = self.run_local(endpoint, call).await?;
            return match results.len() {
                0 => Err(HubcallError::NotFound(name)),
                1 => results
                    .pop()
                    .ok_or_else(|| HubcallError::IllegalState("result vanished".into())),
                count => Err(HubcallError::TooManyImplementors { name, count }),
            };
        }

        let id = self.shared.ids.next();
        let Some(rx) = self.shared.register(id) else {
            return Ok(connection_lost("transport is no longer valid"));
        };

        tracing::debug!(%id, call = %call, "invoking through hub");
        let message = MessengerMessage::HubInvoke {
            id: Some(id),
            needs_reply: true,
            call,
        };
        match self.shared.send_to_server(message) {
            Ok(()) => {}
            Err(e @ (HubcallError::Transport(_) | HubcallError::ConnectionLost(_))) => {
                self.shared.forget(&id);
                tracing::warn!(%id, error = %e, "could not reach the hub");
                return Ok(connection_lost(&e.to_string()));
            }
            Err(e) => {
                self.shared.forget(&id);
                return Err(e);
            }
        }

        rx.await
            .map_err(|_| HubcallError::IllegalState(format!("call {id} was dropped without a result")))
    }

    /// Fire-and-forget: sends the call to every remote owner through the
    /// hub, then runs it on local implementors, if any. Local failures are
    /// logged, not returned.
    ///
    /// # Errors
    /// [`HubcallError::Transport`] or [`HubcallError::Protocol`] if the
    /// call could not be handed to the hub. Local implementors still ran.
    pub async fn invoke(&self, call: RemoteMethodCall) -> Result<(), HubcallError> {
        let local = self.shared.endpoint(&call.remote_name);
        let sent = self.shared.send_to_server(MessengerMessage::HubInvoke {
            id: None,
            needs_reply: false,
            call: call.clone(),
        });

        if let Some(endpoint) = local {
            let shown = call.to_string();
            match self.run_local(endpoint, call).await {
                Ok(results) => {
                    for result in results {
                        if let RemoteMethodCallResults::Error(e) = result {
                            tracing::warn!(call = %shown, error = %e, "local implementor failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(call = %shown, error = %e, "local invocation failed"),
            }
        }
        sent
    }

    async fn run_local(
        &self,
        endpoint: Arc<Endpoint>,
        call: RemoteMethodCall,
    ) -> Result<Vec<RemoteMethodCallResults>, HubcallError> {
        let number = endpoint.take_a_number();
        let local = self.shared.local_node().clone();
        tokio::task::spawn_blocking(move || endpoint.invoke_local(&call, number, &local))
            .await
            .map_err(|e| HubcallError::IllegalState(format!("local invocation aborted: {e}")))
    }

    /// Registers `implementor` under `remote_name`.
    ///
    /// The first registration for a name creates its endpoint and announces
    /// it to the hub. `single_threaded` only matters for that first one.
    ///
    /// # Errors
    /// [`HubcallError::InvalidArgument`] (or [`HubcallError::Endpoint`],
    /// which has the same kind) if the implementor does not provide the
    /// required capability.
    pub fn add_implementor(
        &self,
        remote_name: &RemoteName,
        implementor: Arc<dyn Implementor>,
        single_threaded: bool,
    ) -> Result<(), HubcallError> {
        if !provides(implementor.as_ref(), &remote_name.capability) {
            return Err(HubcallError::InvalidArgument(format!(
                "implementor does not provide {} for {}",
                remote_name.capability.name, remote_name.name
            )));
        }

        let mut endpoints = self.shared.endpoints();
        if let Some(endpoint) = endpoints.get(&remote_name.name) {
            endpoint.add_implementor(implementor)?;
            tracing::debug!(
                name = %remote_name.name,
                implementors = endpoint.implementor_count(),
                "implementor added to existing endpoint"
            );
            return Ok(());
        }

        let endpoint = Arc::new(Endpoint::new(
            remote_name.name.clone(),
            remote_name.capability.clone(),
            single_threaded,
        ));
        endpoint.add_implementor(implementor)?;
        endpoints.insert(remote_name.name.clone(), endpoint);
        tracing::info!(name = %remote_name.name, single_threaded, "endpoint created");

        // Announced while the registry is locked, so the hub sees the
        // announcements for one name in the order they were decided.
        let announce = MessengerMessage::HasEndPointImplementor {
            name: remote_name.name.clone(),
        };
        if let Err(e) = self.shared.send_to_server(announce) {
            tracing::warn!(name = %remote_name.name, error = %e, "could not announce endpoint");
        }
        Ok(())
    }

    /// Removes `implementor` from the endpoint `name`. Removing the last
    /// one deletes the endpoint and tells the hub.
    ///
    /// # Errors
    /// - [`HubcallError::IllegalState`] if there is no endpoint `name`.
    /// - [`HubcallError::Endpoint`] (kind `InvalidArgument`) if the
    ///   implementor is not registered there.
    pub fn remove_implementor(&self, name: &str, implementor: &Arc<dyn Implementor>) -> Result<(), HubcallError> {
        let mut endpoints = self.shared.endpoints();
        let endpoint = endpoints
            .get(name)
            .ok_or_else(|| HubcallError::IllegalState(format!("no endpoint named {name}")))?;

        if !endpoint.remove_implementor(implementor)? {
            return Ok(());
        }
        endpoints.remove(name);
        tracing::info!(%name, "endpoint removed");

        let announce = MessengerMessage::NoLongerHasEndPointImplementor { name: name.to_string() };
        if let Err(e) = self.shared.send_to_server(announce) {
            tracing::warn!(%name, error = %e, "could not announce endpoint removal");
        }
        Ok(())
    }

    /// The only local implementor of `name`.
    ///
    /// # Errors
    /// [`HubcallError::NotFound`] if there is none,
    /// [`HubcallError::TooManyImplementors`] if there are several.
    pub fn get_implementor(&self, name: &str) -> Result<Arc<dyn Implementor>, HubcallError> {
        let endpoint = self
            .shared
            .endpoint(name)
            .ok_or_else(|| HubcallError::NotFound(name.to_string()))?;
        match endpoint.implementor_count() {
            1 => endpoint
                .first_implementor()
                .ok_or_else(|| HubcallError::NotFound(name.to_string())),
            0 => Err(HubcallError::NotFound(name.to_string())),
            count => Err(HubcallError::TooManyImplementors {
                name: name.to_string(),
                count,
            }),
        }
    }

    /// Number of local implementors registered under `name`.
    pub fn local_endpoint_count(&self, name: &str) -> usize {
        self.shared
            .endpoint(name)
            .map_or(0, |endpoint| endpoint.implementor_count())
    }

    pub fn local_node(&self) -> &Node {
        self.shared.local_node()
    }

    pub fn server_node(&self) -> &Node {
        self.shared.server_node()
    }

    pub fn is_server(&self) -> bool {
        self.shared.transport().is_server()
    }

    /// Whether the transport has been reported gone.
    pub fn is_invalid(&self) -> bool {
        self.shared.is_invalid()
    }

    /// Number of `invoke_and_wait` calls still waiting on the hub.
    pub fn pending_invocations(&self) -> usize {
        self.shared.pending().waiting.len()
    }

    /// Nodes the hub currently routes `name` to. Server only.
    ///
    /// # Errors
    /// [`HubcallError::IllegalState`] on a spoke, or once the messenger is
    /// shut down.
    pub async fn hub_owners(&self, name: &str) -> Result<Vec<Node>, HubcallError> {
        if !self.is_server() {
            return Err(HubcallError::IllegalState("only the server runs a hub".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::OwnersOf {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| HubcallError::IllegalState("messenger is shut down".into()))?;
        rx.await
            .map_err(|_| HubcallError::IllegalState("messenger is shut down".into()))
    }

    /// Stops the delivery task and the workers. Pending calls complete
    /// with a connection-lost result.
    pub fn shutdown(&self) {
        self.task.abort();
        self.shared.pool.shutdown();
        self.shared.invalidate("messenger shut down");
        tracing::info!(node = %self.local_node(), "messenger stopped");
    }
}

impl<C: Codec> Drop for UnifiedMessenger<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
