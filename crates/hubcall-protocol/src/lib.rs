//! Wire protocol for hubcall.
//!
//! This crate defines the "language" that nodes speak to each other:
//!
//! - **Ids** ([`CallId`], [`CallIdGenerator`]) — globally unique call
//!   identifiers used to match replies to waiting callers.
//! - **Types** ([`Capability`], [`RemoteMethodCall`],
//!   [`RemoteMethodCallResults`], ...) — what is called and what came back.
//! - **Messages** ([`MessengerMessage`]) — the six wire messages.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how messages become bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (MessengerMessage) → Endpoint / Hub
//! ```

mod codec;
mod error;
mod ids;
mod messages;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use ids::{CallId, CallIdGenerator, ProcessToken};
pub use messages::MessengerMessage;
pub use types::{
    Capability, ErrorKind, MethodSignature, RemoteError, RemoteMethodCall,
    RemoteMethodCallResults, RemoteName,
};
