//! Wire tracing toggle.
//!
//! `BEAMCODE_TRACE=1|true|yes|on` enables the tracer, `BEAMCODE_TRACE_LEVEL`
//! picks how much payload is kept (`headers|full|smart`), and
//! `BEAMCODE_TRACE_SENSITIVE=1` keeps payloads that may contain user content.
//! When the toggle is off every emit is a no-op.

use serde::Serialize;

/// How much of each traced message is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    /// Message kind + ids only.
    Headers,
    /// Entire payloads.
    Full,
    /// Payloads, truncated to a sane preview length.
    Smart,
}

impl TraceLevel {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Self::Full,
            "smart" => Self::Smart,
            _ => Self::Headers,
        }
    }
}

/// Structured trace events emitted across the broker crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    BackendConnected {
        session_id: String,
        adapter: String,
    },
    BackendDisconnected {
        session_id: String,
        reason: String,
    },
    MessageRouted {
        session_id: String,
        direction: &'static str,
        kind: String,
        payload: Option<String>,
    },
    PermissionPending {
        session_id: String,
        request_id: String,
        tool_name: String,
    },
    PermissionResolved {
        session_id: String,
        request_id: String,
        behavior: String,
    },
    SpawnAttempt {
        session_id: String,
        command: String,
        attempt_ok: bool,
    },
    BreakerTransition {
        from: String,
        to: String,
    },
    SessionPersisted {
        session_id: String,
        sync: bool,
    },
    ConsumerJoined {
        session_id: String,
        user_id: String,
        role: String,
    },
    ConsumerLeft {
        session_id: String,
        user_id: String,
    },
}

/// Environment-driven tracer. Cheap to clone, no-op unless enabled.
#[derive(Debug, Clone, Copy)]
pub struct Tracer {
    enabled: bool,
    level: TraceLevel,
    sensitive: bool,
}

const SMART_PREVIEW_CHARS: usize = 400;

impl Tracer {
    pub fn from_env() -> Self {
        let enabled = std::env::var("BEAMCODE_TRACE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let level = std::env::var("BEAMCODE_TRACE_LEVEL")
            .map(|v| TraceLevel::parse(&v))
            .unwrap_or(TraceLevel::Headers);
        let sensitive = std::env::var("BEAMCODE_TRACE_SENSITIVE")
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        Self {
            enabled,
            level,
            sensitive,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            level: TraceLevel::Headers,
            sensitive: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    /// Shape a payload according to the configured level. `None` when the
    /// level or the sensitive flag says to drop it.
    pub fn payload(&self, raw: &str, is_sensitive: bool) -> Option<String> {
        if !self.enabled || (is_sensitive && !self.sensitive) {
            return None;
        }
        match self.level {
            TraceLevel::Headers => None,
            TraceLevel::Full => Some(raw.to_owned()),
            TraceLevel::Smart => {
                if raw.len() <= SMART_PREVIEW_CHARS {
                    Some(raw.to_owned())
                } else {
                    let mut end = SMART_PREVIEW_CHARS;
                    while end < raw.len() && !raw.is_char_boundary(end) {
                        end += 1;
                    }
                    Some(format!("{}…[{} bytes]", &raw[..end], raw.len()))
                }
            }
        }
    }

    pub fn emit(&self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        let json = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(trace_event = %json, "bc_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer(level: TraceLevel, sensitive: bool) -> Tracer {
        Tracer {
            enabled: true,
            level,
            sensitive,
        }
    }

    #[test]
    fn disabled_tracer_drops_payloads() {
        let t = Tracer::disabled();
        assert!(t.payload("hello", false).is_none());
    }

    #[test]
    fn headers_level_drops_payloads() {
        let t = tracer(TraceLevel::Headers, true);
        assert!(t.payload("hello", false).is_none());
    }

    #[test]
    fn full_level_keeps_everything() {
        let t = tracer(TraceLevel::Full, false);
        assert_eq!(t.payload("hello", false).as_deref(), Some("hello"));
    }

    #[test]
    fn smart_level_truncates_long_payloads() {
        let t = tracer(TraceLevel::Smart, false);
        let long = "x".repeat(1000);
        let preview = t.payload(&long, false).unwrap();
        assert!(preview.len() < long.len());
        assert!(preview.contains("1000 bytes"));
    }

    #[test]
    fn sensitive_payload_needs_flag() {
        let t = tracer(TraceLevel::Full, false);
        assert!(t.payload("secret", true).is_none());
        let t = tracer(TraceLevel::Full, true);
        assert_eq!(t.payload("secret", true).as_deref(), Some("secret"));
    }

    #[test]
    fn level_parse() {
        assert_eq!(TraceLevel::parse("full"), TraceLevel::Full);
        assert_eq!(TraceLevel::parse("SMART"), TraceLevel::Smart);
        assert_eq!(TraceLevel::parse("anything"), TraceLevel::Headers);
    }
}
