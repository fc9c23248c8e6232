//! The hub: server-side routing for hubcall.
//!
//! Only the server runs a [`MessengerHub`]. It keeps the registry of which
//! nodes host which endpoint names and turns every hub-bound message into
//! the messages that must go out next:
//!
//! ```text
//! HubInvoke ──▶ SpokeInvoke × owners
//! SpokeInvocationResults × owners ──▶ HubInvocationResults
//! ```

mod error;
mod hub;

pub use error::HubError;
pub use hub::{InvocationInProgress, MessengerHub, Outbound};
