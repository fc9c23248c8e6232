//! Error types for the hub.

use hubcall_protocol::CallId;
use hubcall_transport::Node;

/// A message the hub refused. Every variant is a protocol violation by
/// `from`; the hub's state is unchanged when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A hub invoke wanted a reply but carried no id to reply to.
    #[error("{from} asked for a reply without a call id")]
    MissingCallId { from: Node },

    /// A hub invoke reused an id that is still in progress.
    #[error("call {0} is already in progress")]
    DuplicateInvocation(CallId),

    /// Spoke results for an id the hub is not tracking.
    #[error("no invocation in progress for {0}")]
    UnknownInvocation(CallId),

    /// Spoke results from a node the invocation is not waiting on.
    #[error("{from} sent results for {id} but was not asked")]
    UnexpectedReply { id: CallId, from: Node },

    /// A message that only ever travels from the server to a spoke.
    #[error("{kind} is never addressed to the hub")]
    Misrouted { kind: &'static str },
}
