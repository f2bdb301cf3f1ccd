//! Permission protocol helpers.
//!
//! Backends surface tool-use approval requests in different native shapes;
//! the translator flattens them into `permission_request` messages whose
//! metadata carries `request_id`, `tool_name`, `input`, and the originating
//! `method`. The method decides the decision vocabulary of the response.

use bc_protocol::{
    MessageKind, PermissionBehavior, PermissionRecord, Role, UnifiedMessage,
};
use serde_json::Value;

/// Extract a pending-permission record from a translated backend message.
/// Returns `None` when the message is not a permission request or lacks a
/// request id.
pub fn record_from_message(msg: &UnifiedMessage) -> Option<PermissionRecord> {
    if msg.kind != MessageKind::PermissionRequest {
        return None;
    }
    let request_id = msg.meta_str("request_id")?.to_owned();
    Some(PermissionRecord {
        request_id,
        method: msg.meta_str("method").map(str::to_owned),
        tool_name: msg.meta_str("tool_name").unwrap_or("unknown").to_owned(),
        input: msg.metadata.get("input").cloned().unwrap_or(Value::Null),
        description: msg.meta_str("description").map(str::to_owned),
        tool_use_id: msg.meta_str("tool_use_id").map(str::to_owned),
        agent_id: msg.meta_str("agent_id").map(str::to_owned),
        request: msg.clone(),
    })
}

/// The decision string a given backend method expects.
pub fn decision_for(method: Option<&str>, behavior: PermissionBehavior) -> &'static str {
    match method {
        Some("item/commandExecution/requestApproval") => match behavior {
            PermissionBehavior::Allow => "accept",
            PermissionBehavior::Deny => "decline",
        },
        Some("execCommandApproval") => match behavior {
            PermissionBehavior::Allow => "approved",
            PermissionBehavior::Deny => "denied",
        },
        _ => match behavior {
            PermissionBehavior::Allow => "allow",
            PermissionBehavior::Deny => "deny",
        },
    }
}

/// Build the unified response the translator will shape into the backend's
/// native reply. Numeric-looking request ids are also carried as a JSON-RPC
/// id so JSON-RPC backends can target the original request.
pub fn response_message(
    record: &PermissionRecord,
    behavior: PermissionBehavior,
    note: Option<String>,
) -> UnifiedMessage {
    let mut msg = UnifiedMessage::new(MessageKind::PermissionResponse, Role::User);
    msg.metadata.insert(
        "request_id".into(),
        Value::String(record.request_id.clone()),
    );
    msg.metadata.insert(
        "behavior".into(),
        Value::String(
            match behavior {
                PermissionBehavior::Allow => "allow",
                PermissionBehavior::Deny => "deny",
            }
            .into(),
        ),
    );
    msg.metadata.insert(
        "decision".into(),
        Value::String(decision_for(record.method.as_deref(), behavior).into()),
    );
    if let Some(method) = &record.method {
        msg.metadata
            .insert("method".into(), Value::String(method.clone()));
    }
    if let Ok(numeric) = record.request_id.parse::<i64>() {
        msg.metadata.insert("jsonrpc_id".into(), numeric.into());
    }
    if let Some(note) = note {
        msg.metadata.insert("message".into(), Value::String(note));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn permission_request(request_id: &str, method: Option<&str>) -> UnifiedMessage {
        let mut msg = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        msg.metadata
            .insert("request_id".into(), json!(request_id));
        msg.metadata.insert("tool_name".into(), json!("Bash"));
        msg.metadata
            .insert("input".into(), json!({"command": "rm -rf /"}));
        if let Some(method) = method {
            msg.metadata.insert("method".into(), json!(method));
        }
        msg
    }

    #[test]
    fn record_extraction() {
        let msg = permission_request("p1", Some("can_use_tool"));
        let record = record_from_message(&msg).unwrap();
        assert_eq!(record.request_id, "p1");
        assert_eq!(record.tool_name, "Bash");
        assert_eq!(record.method.as_deref(), Some("can_use_tool"));
        assert_eq!(record.input["command"], "rm -rf /");
        assert_eq!(record.request, msg);
    }

    #[test]
    fn non_permission_messages_yield_none() {
        assert!(record_from_message(&UnifiedMessage::user_text("hi")).is_none());
        // Missing request_id.
        let msg = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        assert!(record_from_message(&msg).is_none());
    }

    #[test]
    fn decision_vocabulary_follows_method() {
        assert_eq!(
            decision_for(
                Some("item/commandExecution/requestApproval"),
                PermissionBehavior::Allow
            ),
            "accept"
        );
        assert_eq!(
            decision_for(
                Some("item/commandExecution/requestApproval"),
                PermissionBehavior::Deny
            ),
            "decline"
        );
        assert_eq!(
            decision_for(Some("execCommandApproval"), PermissionBehavior::Allow),
            "approved"
        );
        assert_eq!(
            decision_for(Some("execCommandApproval"), PermissionBehavior::Deny),
            "denied"
        );
        assert_eq!(decision_for(None, PermissionBehavior::Deny), "deny");
        assert_eq!(
            decision_for(Some("can_use_tool"), PermissionBehavior::Allow),
            "allow"
        );
    }

    #[test]
    fn numeric_request_id_carries_jsonrpc_id() {
        let msg = permission_request("42", None);
        let record = record_from_message(&msg).unwrap();
        let resp = response_message(&record, PermissionBehavior::Deny, None);
        assert_eq!(resp.meta_u64("jsonrpc_id"), Some(42));
        assert_eq!(resp.meta_str("decision"), Some("deny"));

        let msg = permission_request("req-abc", None);
        let record = record_from_message(&msg).unwrap();
        let resp = response_message(&record, PermissionBehavior::Allow, None);
        assert!(resp.metadata.get("jsonrpc_id").is_none());
    }

    #[test]
    fn response_carries_note_and_method() {
        let msg = permission_request("p1", Some("execCommandApproval"));
        let record = record_from_message(&msg).unwrap();
        let resp = response_message(
            &record,
            PermissionBehavior::Deny,
            Some("not on my machine".into()),
        );
        assert_eq!(resp.kind, MessageKind::PermissionResponse);
        assert_eq!(resp.meta_str("behavior"), Some("deny"));
        assert_eq!(resp.meta_str("decision"), Some("denied"));
        assert_eq!(resp.meta_str("method"), Some("execCommandApproval"));
        assert_eq!(resp.meta_str("message"), Some("not on my machine"));
    }
}
