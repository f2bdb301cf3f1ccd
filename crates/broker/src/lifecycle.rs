//! Backend lifecycle half of the session bridge: connect, disconnect, the
//! stream consume loop, pending-message flush, and passthrough interception.

use std::sync::Arc;

use bc_domain::trace::TraceEvent;
use bc_domain::Result;
use bc_protocol::{OutboundFrame, UnifiedMessage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Availability, ConnectOptions};
use crate::bridge::SessionBridge;
use crate::broadcast;
use crate::events::BrokerEvent;
use crate::store::Session;

impl SessionBridge {
    /// Attach (or replace) the session's backend. Replacement closes the
    /// prior handle and aborts its consume loop first, silently.
    pub async fn connect_backend(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        if session.has_backend() {
            self.teardown_backend(session, false).await;
        }

        let adapter_name = session.adapter_name().ok_or_else(|| {
            bc_domain::Error::Adapter {
                adapter: "?".into(),
                message: "session has no adapter assigned".into(),
            }
        })?;
        let adapter = self.resolver.resolve(&adapter_name).ok_or_else(|| {
            bc_domain::Error::Adapter {
                adapter: adapter_name.clone(),
                message: "unknown adapter".into(),
            }
        })?;

        let opts = ConnectOptions {
            session_id: session.id,
            cwd: session.state.read().cwd.clone(),
            resume: session.backend_session_id.lock().clone(),
            adapter_options: Default::default(),
        };
        // Adapter connect failures propagate to the caller.
        let handle = adapter.connect(opts).await?;

        let source = match adapter.capabilities().availability {
            Availability::Local => "pty",
            Availability::Remote => "cli",
        };
        handle.set_passthrough_handler(Some(passthrough_handler(session.clone(), source)));

        let abort = CancellationToken::new();
        let messages = handle.take_messages();
        *session.backend.write() = Some(handle.clone());
        *session.backend_abort.lock() = Some(abort.clone());

        broadcast::broadcast(session, &OutboundFrame::CliConnected);
        self.events.emit(BrokerEvent::BackendConnected {
            session_id: session.id,
        });
        self.tracer.emit(TraceEvent::BackendConnected {
            session_id: session.id.to_string(),
            adapter: adapter_name.clone(),
        });
        tracing::info!(session_id = %session.id, adapter = %adapter_name, "backend connected");

        // First connect consumes the pre-connect UX slot.
        session.queued_message.lock().take();

        self.flush_pending(session);

        match messages {
            Some(rx) => self.spawn_consume_loop(session.clone(), rx, abort),
            None => tracing::warn!(
                session_id = %session.id,
                "backend stream already taken; skipping consume loop"
            ),
        }
        Ok(())
    }

    /// Drain `pending_messages` in queue order. A send failure surfaces an
    /// error event, puts the message back at the front, and stops the flush.
    pub(crate) fn flush_pending(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(handle) = session.backend_handle() else {
            return;
        };
        loop {
            let Some(msg) = session.pending_messages.lock().pop_front() else {
                break;
            };
            if let Err(e) = handle.send(msg.clone()) {
                tracing::error!(session_id = %session.id, error = %e, "pending flush failed");
                session.pending_messages.lock().push_front(msg);
                self.events.emit(BrokerEvent::SessionError {
                    session_id: session.id,
                    source: "flushPending",
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    /// Deliver one message to the backend. With no backend attached this
    /// warns and returns — callers queue beforehand when that matters.
    pub fn send_to_backend(self: &Arc<Self>, session: &Arc<Session>, msg: UnifiedMessage) {
        let Some(handle) = session.backend_handle() else {
            tracing::warn!(
                session_id = %session.id,
                kind = msg.kind.as_str(),
                "send_to_backend with no backend attached"
            );
            return;
        };
        if let Err(e) = handle.send(msg) {
            tracing::error!(session_id = %session.id, error = %e, "backend send failed");
            self.events.emit(BrokerEvent::SessionError {
                session_id: session.id,
                source: "sendToBackend",
                message: e.to_string(),
            });
        }
    }

    /// Graceful disconnect: abort the consume loop, close the handle, cancel
    /// pending permissions, notify consumers. No-op without a backend.
    pub async fn disconnect_backend(
        self: &Arc<Self>,
        session: &Arc<Session>,
        code: Option<u16>,
        reason: &str,
    ) {
        if !session.has_backend() {
            return;
        }
        self.teardown_backend(session, true).await;
        self.events.emit(BrokerEvent::BackendDisconnected {
            session_id: session.id,
            code,
            reason: reason.to_owned(),
        });
        self.tracer.emit(TraceEvent::BackendDisconnected {
            session_id: session.id.to_string(),
            reason: reason.to_owned(),
        });
        broadcast::broadcast(session, &OutboundFrame::CliDisconnected);
    }

    /// Shared teardown: abort, close, clear, cancel permissions.
    /// `announce` is false on the silent replace path.
    async fn teardown_backend(self: &Arc<Self>, session: &Arc<Session>, announce: bool) {
        if let Some(abort) = session.backend_abort.lock().take() {
            abort.cancel();
        }
        let handle = session.backend.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.cancel_pending_permissions(session, announce);
    }

    /// Every pending permission dies with the backend; participants get a
    /// `permission_cancelled` for each.
    pub(crate) fn cancel_pending_permissions(&self, session: &Arc<Session>, announce: bool) {
        let cancelled: Vec<(String, _)> =
            session.pending_permissions.lock().drain(..).collect();
        if cancelled.is_empty() {
            return;
        }
        tracing::info!(
            session_id = %session.id,
            cancelled = cancelled.len(),
            "cancelled pending permissions on backend disconnect"
        );
        if announce {
            for (request_id, _) in cancelled {
                broadcast::broadcast_to_participants(
                    session,
                    &OutboundFrame::PermissionCancelled { request_id },
                );
            }
        }
    }

    /// Consume the backend stream, routing each message until the stream
    /// ends, errors, or the abort token fires.
    fn spawn_consume_loop(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut rx: tokio::sync::mpsc::Receiver<UnifiedMessage>,
        abort: CancellationToken,
    ) {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = abort.cancelled() => return,
                    msg = rx.recv() => msg,
                };
                match msg {
                    Some(msg) => bridge.route_unified_message(&session, msg).await,
                    None => break,
                }
            }

            // Stream ended without an explicit close: unexpected disconnect.
            if let Some(token) = session.backend_abort.lock().take() {
                token.cancel();
            }
            let handle = session.backend.write().take();
            if let Some(handle) = handle {
                handle.close().await;
            }
            bridge.cancel_pending_permissions(&session, true);
            broadcast::broadcast(&session, &OutboundFrame::CliDisconnected);
            bridge.events.emit(BrokerEvent::BackendDisconnected {
                session_id: session.id,
                code: None,
                reason: "stream ended".into(),
            });
            tracing::warn!(session_id = %session.id, "backend stream ended unexpectedly");
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Passthrough interception
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the handler installed on backend sessions that echo user messages:
/// the oldest pending passthrough consumes the next echo and rewrites it as
/// a `slash_command_result`.
fn passthrough_handler(
    session: Arc<Session>,
    source: &'static str,
) -> crate::adapter::PassthroughHandler {
    Box::new(move |msg| {
        let pending = session.pending_passthroughs.lock().pop_front();
        let Some(pending) = pending else {
            return false;
        };
        let content = strip_command_output_tags(&echo_text(msg));
        broadcast::broadcast(
            &session,
            &OutboundFrame::SlashCommandResult {
                command: pending.command,
                content,
                source: source.into(),
                request_id: pending.request_id,
            },
        );
        true
    })
}

/// Flatten a user echo into plain text: content blocks are concatenated;
/// otherwise a raw `content` metadata value is used (`.text` for objects,
/// empty for null).
fn echo_text(msg: &UnifiedMessage) -> String {
    if !msg.content.is_empty() {
        return msg.text();
    }
    match msg.metadata.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.as_str(),
                Value::Object(o) => o.get("text").and_then(Value::as_str).unwrap_or(""),
                _ => "",
            })
            .collect(),
        Some(Value::Object(o)) => o
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned(),
        _ => String::new(),
    }
}

/// CLIs wrap local command output in sentinel tags; strip them.
fn strip_command_output_tags(text: &str) -> String {
    let mut out = text.trim().to_owned();
    for tag in ["local-command-stdout", "local-command-stderr"] {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        if out.starts_with(&open) && out.ends_with(&close) {
            out = out[open.len()..out.len() - close.len()].trim().to_owned();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_local_command_stdout_wrapper() {
        assert_eq!(
            strip_command_output_tags("<local-command-stdout>ctx output</local-command-stdout>"),
            "ctx output"
        );
        assert_eq!(strip_command_output_tags("plain"), "plain");
    }

    #[test]
    fn echo_text_prefers_content_blocks() {
        let msg = UnifiedMessage::user_text("from blocks");
        assert_eq!(echo_text(&msg), "from blocks");
    }

    #[test]
    fn echo_text_handles_raw_metadata_shapes() {
        let mut msg = UnifiedMessage::new(
            bc_protocol::MessageKind::UserMessage,
            bc_protocol::Role::User,
        );
        msg.metadata
            .insert("content".into(), serde_json::json!("raw string"));
        assert_eq!(echo_text(&msg), "raw string");

        msg.metadata.insert(
            "content".into(),
            serde_json::json!([{ "type": "text", "text": "a" }, "b", 7]),
        );
        assert_eq!(echo_text(&msg), "ab");

        msg.metadata
            .insert("content".into(), serde_json::json!({ "text": "obj" }));
        assert_eq!(echo_text(&msg), "obj");

        msg.metadata
            .insert("content".into(), serde_json::json!({ "text": 42 }));
        assert_eq!(echo_text(&msg), "");

        msg.metadata.insert("content".into(), Value::Null);
        assert_eq!(echo_text(&msg), "");
    }
}
