//! Persisted records: the serialized projection of a session, the launcher's
//! per-session process record, and pending permission entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::SessionState;
use crate::unified::UnifiedMessage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A pending permission request, keyed by `request_id` in the session.
///
/// `method` remembers the backend-specific request method so the eventual
/// response can be shaped to match (different backends expect different
/// decision vocabularies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub request_id: String,
    #[serde(default)]
    pub method: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// The original unified message, replayed to late-joining participants.
    pub request: UnifiedMessage,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The durable subset of a session, written as `<uuid>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: Uuid,
    pub state: SessionState,
    #[serde(default)]
    pub message_history: Vec<UnifiedMessage>,
    #[serde(default)]
    pub pending_messages: Vec<UnifiedMessage>,
    /// Ordered `(request_id, record)` tuples.
    #[serde(default)]
    pub pending_permissions: Vec<(String, PermissionRecord)>,
    #[serde(default)]
    pub archived: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launcher record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Starting,
    Connected,
    Exited,
    Archived,
}

/// Per-session process record owned by the launcher and persisted in
/// `launcher.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherRecord {
    pub session_id: Uuid,
    #[serde(default)]
    pub pid: Option<u32>,
    pub state: LaunchState,
    #[serde(default)]
    pub cwd: Option<String>,
    /// The backend's own session id, used for `--resume` style relaunches.
    #[serde(default)]
    pub backend_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub adapter_name: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub name: String,
}

impl LauncherRecord {
    pub fn new(session_id: Uuid, adapter_name: impl Into<String>, cwd: Option<String>) -> Self {
        Self {
            session_id,
            pid: None,
            state: LaunchState::Starting,
            cwd,
            backend_session_id: None,
            created_at: Utc::now(),
            adapter_name: adapter_name.into(),
            archived: false,
            name: String::new(),
        }
    }
}
