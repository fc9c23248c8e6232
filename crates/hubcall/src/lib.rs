//! # hubcall
//!
//! Location-transparent method calls between the nodes of a hub-and-spoke
//! network: a game host (the server) and its clients.
//!
//! Every node runs a [`UnifiedMessenger`] on top of a transport
//! [`Messenger`](hubcall_transport::Messenger). Objects register as
//! [`Implementor`]s under a name; any node can then call that name with
//! [`invoke`](UnifiedMessenger::invoke) (fire-and-forget, reaches every
//! owner) or [`invoke_and_wait`](UnifiedMessenger::invoke_and_wait)
//! (one result back). Calls are routed through the server's hub:
//!
//! ```text
//! caller ──HubInvoke──▶ server hub ──SpokeInvoke──▶ owner(s)
//! caller ◀──HubInvocationResults── server hub ◀──SpokeInvocationResults── owner(s)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hubcall::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), HubcallError> {
//! let net = MemoryNetwork::new();
//! let host = UnifiedMessenger::builder(Arc::new(net.server("host")?)).start()?;
//! let alice = UnifiedMessenger::builder(Arc::new(net.client("alice")?)).start()?;
//!
//! let clock = DispatchTable::new("Clock").method("now", Vec::<String>::new(), |_, _| Ok(json!(42)));
//! let name = RemoteName::new("clock", clock.capability().clone());
//! host.add_implementor(&name, Arc::new(clock), false)?;
//!
//! let now = alice.invoke_and_wait(RemoteMethodCall::new("clock", "now")).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod delivery;
mod error;
mod messenger;
mod pool;

pub use config::MessengerConfig;
pub use error::HubcallError;
pub use messenger::{UnifiedMessenger, UnifiedMessengerBuilder};
pub use pool::WorkerPool;

pub use hubcall_endpoint as endpoint;
pub use hubcall_hub as hub;
pub use hubcall_protocol as protocol;
pub use hubcall_transport as transport;

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber that prints to stderr, filtered by
/// `RUST_LOG` (default `info`). Does nothing if one is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Everything needed to register implementors and make calls.
pub mod prelude {
    pub use crate::{HubcallError, MessengerConfig, UnifiedMessenger, UnifiedMessengerBuilder};
    pub use hubcall_endpoint::{DispatchTable, Implementor, InvocationContext, decode_arg};
    pub use hubcall_protocol::{
        Capability, ErrorKind, JsonCodec, RemoteError, RemoteMethodCall, RemoteMethodCallResults,
        RemoteName,
    };
    pub use hubcall_transport::{MemoryNetwork, Messenger, Node};
}
