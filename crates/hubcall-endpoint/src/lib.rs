//! Local endpoints for hubcall.
//!
//! An [`Endpoint`] is the named place where local [`Implementor`]s are
//! registered. It owns the sequence numbers that order calls, and it is
//! where a call is finally executed, whether it was made on this node or
//! arrived from the hub.
//!
//! ```text
//! UnifiedMessenger → Endpoint::take_a_number → Endpoint::invoke_local → Implementor
//! ```

mod endpoint;
mod error;
mod implementor;

pub use endpoint::Endpoint;
pub use error::EndpointError;
pub use implementor::{DispatchTable, Implementor, InvocationContext, decode_arg, provides};
