//! Events pushed to dashboard subscribers over the websocket channel.
//!
//! `BufferEngine` emits one of these after every committed phase transition
//! and after every `total_input_tokens` update; `dashboard::ws` coalesces
//! bursts of `StateUpdate` per conversation (latest wins) before forwarding
//! to subscribers, on a short flush interval.

use crate::store::ConversationSummary;
use serde::{Deserialize, Serialize};

/// Frames sent from server to dashboard client over `WS /dashboard/ws`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum DashboardEvent {
    /// Sent once, immediately after a client subscribes.
    #[serde(rename = "initial_state")]
    InitialState { conversations: Vec<ConversationSummary> },

    /// A conversation's observable state changed.
    #[serde(rename = "state_update")]
    StateUpdate { conversation: ConversationSummary },

    /// Forwarding a request to upstream failed.
    #[serde(rename = "api_error")]
    ApiError { conv_id: String, status: Option<u16>, message: String },
}

/// Commands the dashboard client may send back over the same channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardCommand {
    #[serde(rename = "reset_conversation")]
    ResetConversation { conv_id: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_update_serializes_with_type_tag() {
        let event = DashboardEvent::ApiError {
            conv_id: "abc".to_string(),
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "api_error");
        assert_eq!(json["status"], 502);
    }

    #[test]
    fn reset_conversation_command_deserializes() {
        let raw = r#"{"type":"reset_conversation","conv_id":"abc123"}"#;
        let cmd: DashboardCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            DashboardCommand::ResetConversation { conv_id } => assert_eq!(conv_id.as_deref(), Some("abc123")),
        }
    }
}
