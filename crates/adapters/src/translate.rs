//! The translator seam.
//!
//! A translator is a stateless pure-function pair: every inbound native
//! message maps to exactly one [`UnifiedMessage`] (possibly `unknown`) or to
//! `None` (silently dropped, e.g. keep-alives); every outbound unified
//! message maps to exactly one native value or to `None`. Any per-request
//! state belongs to the session handle, never here.

use bc_protocol::{MessageKind, Role, UnifiedMessage};
use serde_json::Value;

pub trait Translator: Send + Sync {
    fn translate_inbound(&self, native: &Value) -> Option<UnifiedMessage>;
    fn translate_outbound(&self, msg: &UnifiedMessage) -> Option<Value>;
}

/// The trivial dialect: the wire already speaks the unified schema (NDJSON
/// of serialized `UnifiedMessage`s). Keep-alives are dropped; anything that
/// fails schema validation becomes `unknown` with the raw payload attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct CarrierTranslator;

impl Translator for CarrierTranslator {
    fn translate_inbound(&self, native: &Value) -> Option<UnifiedMessage> {
        let kind = native.get("type").and_then(Value::as_str);
        if matches!(kind, Some("keep_alive") | Some("ping")) {
            return None;
        }
        match serde_json::from_value::<UnifiedMessage>(native.clone()) {
            Ok(msg) => Some(msg),
            Err(_) => {
                let mut msg = UnifiedMessage::new(MessageKind::Unknown, Role::System);
                if let Value::Object(fields) = native {
                    for (k, v) in fields {
                        msg.metadata.insert(k.clone(), v.clone());
                    }
                }
                Some(msg)
            }
        }
    }

    fn translate_outbound(&self, msg: &UnifiedMessage) -> Option<Value> {
        serde_json::to_value(msg).ok()
    }
}
