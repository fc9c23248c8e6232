//! The six messages of the hub-and-spoke invocation protocol.
//!
//! ```text
//!   caller ──HubInvoke──────────────▶ hub ──SpokeInvoke───────────▶ owner
//!   caller ◀──HubInvocationResults── hub ◀──SpokeInvocationResults── owner
//!   owner  ──HasEndPointImplementor / NoLongerHasEndPointImplementor──▶ hub
//! ```

use hubcall_transport::Node;
use serde::{Deserialize, Serialize};

use crate::{CallId, RemoteMethodCall, RemoteMethodCallResults};

/// Everything the invocation layer sends over the transport.
///
/// Internally tagged, so a spoke invoke looks like
/// `{ "type": "SpokeInvoke", "id": ..., "needs_reply": true, ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessengerMessage {
    /// Node → server: run `call` on whoever owns its endpoint.
    /// `id` is absent when no reply is wanted.
    HubInvoke {
        id: Option<CallId>,
        needs_reply: bool,
        call: RemoteMethodCall,
    },

    /// Server → owner: run `call` locally on behalf of `calling_node`.
    SpokeInvoke {
        id: Option<CallId>,
        needs_reply: bool,
        call: RemoteMethodCall,
        calling_node: Node,
    },

    /// Server → caller: the final result of a hub invoke.
    HubInvocationResults {
        id: CallId,
        result: RemoteMethodCallResults,
    },

    /// Owner → server: one owner's result of a spoke invoke.
    SpokeInvocationResults {
        id: CallId,
        result: RemoteMethodCallResults,
    },

    /// Node → server: the sender now hosts an implementor for `name`.
    HasEndPointImplementor { name: String },

    /// Node → server: the sender no longer hosts any implementor for `name`.
    NoLongerHasEndPointImplementor { name: String },
}

impl MessengerMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HubInvoke { .. } => "HubInvoke",
            Self::SpokeInvoke { .. } => "SpokeInvoke",
            Self::HubInvocationResults { .. } => "HubInvocationResults",
            Self::SpokeInvocationResults { .. } => "SpokeInvocationResults",
            Self::HasEndPointImplementor { .. } => "HasEndPointImplementor",
            Self::NoLongerHasEndPointImplementor { .. } => {
                "NoLongerHasEndPointImplementor"
            }
        }
    }

    /// Whether this message is addressed to the hub (server role).
    pub fn is_for_hub(&self) -> bool {
        matches!(
            self,
            Self::HubInvoke { .. }
                | Self::SpokeInvocationResults { .. }
                | Self::HasEndPointImplementor { .. }
                | Self::NoLongerHasEndPointImplementor { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ErrorKind, ProcessToken};

    fn id() -> CallId {
        CallId::new(ProcessToken::from_bytes([3; 16]), 11)
    }

    #[test]
    fn test_hub_invoke_json_format() {
        let msg = MessengerMessage::HubInvoke {
            id: None,
            needs_reply: false,
            call: RemoteMethodCall::new("chat", "say").arg("string", "hi"),
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "HubInvoke");
        assert!(json["id"].is_null());
        assert_eq!(json["needs_reply"], false);
        assert_eq!(json["call"]["remote_name"], "chat");
        assert_eq!(json["call"]["args"], json!(["hi"]));
    }

    #[test]
    fn test_spoke_invoke_carries_calling_node() {
        let msg = MessengerMessage::SpokeInvoke {
            id: Some(id()),
            needs_reply: true,
            call: RemoteMethodCall::new("chat", "say"),
            calling_node: Node::new("alice"),
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "SpokeInvoke");
        assert_eq!(json["calling_node"], "alice");
        assert_eq!(json["id"]["sequence"], 11);
    }

    #[test]
    fn test_results_round_trip_through_json() {
        let msg = MessengerMessage::SpokeInvocationResults {
            id: id(),
            result: RemoteMethodCallResults::error(ErrorKind::NotFound, "no chat"),
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: MessengerMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_announcement_json_format() {
        let msg = MessengerMessage::NoLongerHasEndPointImplementor { name: "chat".into() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "NoLongerHasEndPointImplementor", "name": "chat" })
        );
    }

    #[test]
    fn test_hub_bound_messages() {
        let has = MessengerMessage::HasEndPointImplementor { name: "x".into() };
        let results = MessengerMessage::HubInvocationResults {
            id: id(),
            result: RemoteMethodCallResults::Value(json!(null)),
        };
        assert!(has.is_for_hub());
        assert!(!results.is_for_hub());
        assert_eq!(results.kind(), "HubInvocationResults");
    }

    #[test]
    fn test_unknown_message_type_fails_to_decode() {
        let unknown = r#"{"type": "Steal", "name": "chat"}"#;
        let result: Result<MessengerMessage, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }
}
