//! Consumer WebSocket frame schema.
//!
//! Inbound frames are what clients may send (participant-only unless noted);
//! outbound frames are everything the broker pushes. Both are tagged on
//! `type` so unknown frames fail schema validation instead of parsing into
//! something half-right.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::{ConsumerIdentity, PermissionBehavior, PermissionMode, SessionState, SessionStatus};
use crate::unified::UnifiedMessage;

/// Close code for an oversize consumer frame.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
/// Close code when authentication fails.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code when the target session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    UserMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<Value>>,
    },
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Interrupt,
    SlashCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: PermissionMode,
    },
    /// Always rejected: the adapter is fixed for the session's lifetime.
    SetAdapter {
        #[serde(default)]
        adapter: Option<String>,
    },
}

impl InboundFrame {
    /// Stable name used for RBAC decisions and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::PermissionResponse { .. } => "permission_response",
            Self::Interrupt => "interrupt",
            Self::SlashCommand { .. } => "slash_command",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetAdapter { .. } => "set_adapter",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// First frame after auth.
    Identity {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "displayName")]
        display_name: String,
        role: String,
    },
    SessionInit {
        session: SessionState,
    },
    MessageHistory {
        messages: Vec<UnifiedMessage>,
    },
    CapabilitiesReady {
        #[serde(default)]
        commands: Vec<Value>,
        #[serde(default)]
        models: Vec<Value>,
        #[serde(default)]
        account: Option<Value>,
        #[serde(default)]
        skills: Vec<Value>,
    },
    StatusChange {
        status: Option<SessionStatus>,
    },
    CliConnected,
    CliDisconnected,
    PermissionRequest {
        request: UnifiedMessage,
    },
    PermissionCancelled {
        request_id: String,
    },
    Assistant {
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    /// A user message echoed by the backend (peer consumers see each other's
    /// prompts through this).
    UserMessage {
        message: UnifiedMessage,
    },
    StreamEvent {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    Result {
        data: Value,
    },
    ToolProgress {
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    ToolUseSummary {
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    SlashCommandResult {
        command: String,
        content: String,
        /// `emulated` (broker-answered), `pty` or `cli` (backend echo).
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    SlashCommandError {
        command: String,
        error: String,
    },
    AuthStatus {
        #[serde(rename = "isAuthenticating")]
        is_authenticating: bool,
        #[serde(default)]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Presence {
        consumers: Vec<ConsumerIdentity>,
    },
    Error {
        message: String,
    },
}

impl OutboundFrame {
    pub fn identity(id: &ConsumerIdentity) -> Self {
        Self::Identity {
            user_id: id.user_id.clone(),
            display_name: id.display_name.clone(),
            role: match id.role {
                crate::state::ConsumerRole::Participant => "participant".into(),
                crate::state::ConsumerRole::Observer => "observer".into(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_user_message_parses() {
        let frame: InboundFrame =
            serde_json::from_value(json!({"type": "user_message", "content": "Hello"})).unwrap();
        assert_eq!(
            frame,
            InboundFrame::UserMessage {
                content: "Hello".into(),
                images: None
            }
        );
        assert_eq!(frame.kind(), "user_message");
    }

    #[test]
    fn inbound_unknown_type_is_schema_error() {
        let parsed = serde_json::from_value::<InboundFrame>(json!({"type": "subscribe"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn inbound_permission_response_parses() {
        let frame: InboundFrame = serde_json::from_value(json!({
            "type": "permission_response",
            "request_id": "p1",
            "behavior": "deny"
        }))
        .unwrap();
        match frame {
            InboundFrame::PermissionResponse {
                request_id,
                behavior,
                ..
            } => {
                assert_eq!(request_id, "p1");
                assert_eq!(behavior, PermissionBehavior::Deny);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn outbound_frames_use_wire_names() {
        let v = serde_json::to_value(OutboundFrame::CliDisconnected).unwrap();
        assert_eq!(v, json!({"type": "cli_disconnected"}));

        let v = serde_json::to_value(OutboundFrame::SlashCommandResult {
            command: "/context".into(),
            content: "ctx".into(),
            source: "pty".into(),
            request_id: Some("r1".into()),
        })
        .unwrap();
        assert_eq!(v["type"], "slash_command_result");
        assert_eq!(v["source"], "pty");
        assert_eq!(v["request_id"], "r1");
    }

    #[test]
    fn identity_frame_shape() {
        let id = ConsumerIdentity::anonymous(1);
        let v = serde_json::to_value(OutboundFrame::identity(&id)).unwrap();
        assert_eq!(v["type"], "identity");
        assert_eq!(v["userId"], "anonymous-1");
        assert_eq!(v["displayName"], "User 1");
        assert_eq!(v["role"], "participant");
    }

    #[test]
    fn tool_progress_flattens_payload() {
        let mut data = Map::new();
        data.insert("tool_use_id".into(), json!("tu_1"));
        data.insert("progress".into(), json!(0.5));
        let v = serde_json::to_value(OutboundFrame::ToolProgress { data }).unwrap();
        assert_eq!(v["type"], "tool_progress");
        assert_eq!(v["tool_use_id"], "tu_1");
        assert_eq!(v["progress"], 0.5);
    }
}
