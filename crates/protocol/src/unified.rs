//! The uniform internal message envelope.
//!
//! Every backend's native wire format is translated into [`UnifiedMessage`]
//! at the adapter boundary; the broker core never inspects raw backend JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message kind — the broker's tagged union of everything a backend or
/// consumer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UserMessage,
    Assistant,
    StreamEvent,
    Result,
    PermissionRequest,
    PermissionResponse,
    PermissionCancelled,
    ToolProgress,
    ToolUseSummary,
    ConfigurationChange,
    SessionInit,
    StatusChange,
    AuthStatus,
    Interrupt,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::Assistant => "assistant",
            Self::StreamEvent => "stream_event",
            Self::Result => "result",
            Self::PermissionRequest => "permission_request",
            Self::PermissionResponse => "permission_response",
            Self::PermissionCancelled => "permission_cancelled",
            Self::ToolProgress => "tool_progress",
            Self::ToolUseSummary => "tool_use_summary",
            Self::ConfigurationChange => "configuration_change",
            Self::SessionInit => "session_init",
            Self::StatusChange => "status_change",
            Self::AuthStatus => "auth_status",
            Self::Interrupt => "interrupt",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single ordered content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: Value,
    },
}

/// The broker-internal, protocol-agnostic message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Trace ids, request ids, model usage, subtype markers — bounded string
    /// keys, arbitrary JSON values.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl UnifiedMessage {
    pub fn new(kind: MessageKind, role: Role) -> Self {
        Self {
            kind,
            role,
            content: Vec::new(),
            metadata: Map::new(),
            id: None,
        }
    }

    /// A plain text user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::UserMessage, Role::User);
        msg.content.push(ContentBlock::Text { text: text.into() });
        msg
    }

    pub fn interrupt() -> Self {
        Self::new(MessageKind::Interrupt, Role::User)
    }

    /// A `configuration_change` envelope with the given subtype and fields.
    pub fn configuration_change(
        subtype: &str,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let mut msg = Self::new(MessageKind::ConfigurationChange, Role::User);
        msg.metadata
            .insert("subtype".into(), Value::String(subtype.into()));
        for (k, v) in fields {
            msg.metadata.insert(k, v);
        }
        msg
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenated text of all `text` content blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// A metadata value as `&str`, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Whether this message represents a visible event that belongs in the
    /// session's replayable history.
    pub fn is_visible(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Assistant
                | MessageKind::UserMessage
                | MessageKind::Result
                | MessageKind::ToolProgress
                | MessageKind::ToolUseSummary
                | MessageKind::PermissionRequest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_serializes_snake_case() {
        let msg = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "permission_request");
        assert_eq!(v["role"], "assistant");
    }

    #[test]
    fn user_text_round_trips() {
        let msg = UnifiedMessage::user_text("Hello");
        let json = serde_json::to_string(&msg).unwrap();
        let back: UnifiedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.text(), "Hello");
    }

    #[test]
    fn content_blocks_are_tagged() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        };
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["name"], "Bash");
    }

    #[test]
    fn text_concatenates_only_text_blocks() {
        let mut msg = UnifiedMessage::new(MessageKind::Assistant, Role::Assistant);
        msg.content.push(ContentBlock::Text { text: "a".into() });
        msg.content.push(ContentBlock::Thinking {
            thinking: "hmm".into(),
        });
        msg.content.push(ContentBlock::Text { text: "b".into() });
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn visibility() {
        assert!(UnifiedMessage::new(MessageKind::Assistant, Role::Assistant).is_visible());
        assert!(UnifiedMessage::new(MessageKind::Result, Role::System).is_visible());
        assert!(!UnifiedMessage::new(MessageKind::StreamEvent, Role::Assistant).is_visible());
        assert!(!UnifiedMessage::new(MessageKind::StatusChange, Role::System).is_visible());
    }

    #[test]
    fn configuration_change_carries_subtype() {
        let msg = UnifiedMessage::configuration_change(
            "set_model",
            [("model".to_string(), json!("opus"))],
        );
        assert_eq!(msg.meta_str("subtype"), Some("set_model"));
        assert_eq!(msg.meta_str("model"), Some("opus"));
    }
}
