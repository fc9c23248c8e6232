//! Unified error type for hubcall.

use hubcall_endpoint::EndpointError;
use hubcall_protocol::{ErrorKind, ProtocolError, RemoteError};
use hubcall_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The first five variants are the failures the messenger itself reports;
/// the rest wrap errors from the lower crates so `?` converts them
/// automatically. [`kind`](Self::kind) folds all of them onto the same
/// [`ErrorKind`] taxonomy that remote results use.
#[derive(Debug, thiserror::Error)]
pub enum HubcallError {
    /// No implementor is registered under the name.
    #[error("no implementor registered for {0}")]
    NotFound(String),

    /// More than one implementor where exactly one is needed.
    #[error("{name} has {count} implementors, expected exactly one")]
    TooManyImplementors { name: String, count: usize },

    /// The transport is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A capability mismatch or an unknown implementor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The messenger is in a state where the operation makes no sense.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A transport-level error (send, subscribe, disconnect).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An endpoint registration error.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// A remote call came back with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl HubcallError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TooManyImplementors { .. } => ErrorKind::TooManyImplementors,
            Self::ConnectionLost(_) | Self::Transport(_) => ErrorKind::ConnectionLost,
            Self::InvalidArgument(_) | Self::Endpoint(_) => ErrorKind::InvalidArgument,
            Self::IllegalState(_) | Self::Protocol(_) => ErrorKind::IllegalState,
            Self::Remote(e) => e.kind,
        }
    }
}
