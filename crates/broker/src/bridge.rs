//! Session bridge: per-session routing between consumers and the backend.
//!
//! Consumer → backend routing lives in [`SessionBridge::route_consumer_message`];
//! backend → consumer routing in [`SessionBridge::route_unified_message`]. The
//! backend lifecycle half of the bridge (connect/disconnect/consume loop) is
//! in `lifecycle.rs`; the consumer transport half in `transport.rs`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bc_domain::config::BrokerConfig;
use bc_domain::trace::TraceEvent;
use bc_domain::Tracer;
use bc_protocol::{
    CapabilitiesSnapshot, ContentBlock, InboundFrame, MessageKind, OutboundFrame,
    PermissionBehavior, PermissionMode, SessionStatus, UnifiedMessage,
};
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::AdapterResolver;
use crate::broadcast::{self, SinkId};
use crate::commands::CommandCategory;
use crate::events::{BrokerEvent, EventBus};
use crate::gate::ConsumerGate;
use crate::permissions;
use crate::persist::FileStore;
use crate::store::{PendingPassthrough, Session, SessionStore};

pub struct SessionBridge {
    pub(crate) store: Arc<SessionStore>,
    pub(crate) gate: Arc<ConsumerGate>,
    pub(crate) resolver: Arc<AdapterResolver>,
    pub(crate) files: FileStore,
    pub(crate) events: EventBus,
    pub(crate) config: BrokerConfig,
    pub(crate) tracer: Tracer,
}

impl SessionBridge {
    pub fn new(
        store: Arc<SessionStore>,
        gate: Arc<ConsumerGate>,
        resolver: Arc<AdapterResolver>,
        files: FileStore,
        events: EventBus,
        config: BrokerConfig,
        tracer: Tracer,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gate,
            resolver,
            files,
            events,
            config,
            tracer,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.store.get(id)
    }

    pub fn get_or_create(&self, id: Uuid) -> Arc<Session> {
        self.store.get_or_create(id)
    }

    pub(crate) fn schedule_save(&self, session: &Session) {
        self.files.save(session.to_persisted());
    }

    /// Tear a session down: backend, consumer sockets, store entry, storage.
    /// A missing id is a no-op.
    pub async fn close_session(self: &Arc<Self>, id: &Uuid) -> bool {
        let Some(session) = self.store.get(id) else {
            return false;
        };
        self.disconnect_backend(&session, None, "session closed").await;

        let seats: Vec<_> = {
            let consumers = session.consumers.read();
            consumers.values().map(|s| s.sink.clone()).collect()
        };
        for sink in seats {
            sink.close(1000, "session closed");
        }
        session.consumers.write().clear();
        session.rate_limiters.lock().clear();

        self.store.remove(id);
        self.files.remove(id);
        self.events.emit(BrokerEvent::SessionClosed { session_id: *id });
        tracing::info!(session_id = %id, "session closed");
        true
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Consumer → backend
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn route_consumer_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        sink_id: SinkId,
        frame: InboundFrame,
    ) {
        match frame {
            InboundFrame::UserMessage { content, images } => {
                let mut msg = UnifiedMessage::user_text(&content);
                if let Some(images) = images {
                    for source in images {
                        msg.content.push(ContentBlock::Image { source });
                    }
                }
                {
                    let mut first = session.first_user_message.lock();
                    if first.is_none() {
                        *first = Some(content);
                    }
                }
                self.forward_or_queue(session, msg);
                self.schedule_save(session);
            }

            InboundFrame::PermissionResponse {
                request_id,
                behavior,
                message,
            } => {
                self.resolve_permission(session, &request_id, behavior, message);
                self.schedule_save(session);
            }

            InboundFrame::Interrupt => {
                self.forward_or_queue(session, UnifiedMessage::interrupt());
            }

            InboundFrame::SetModel { model } => {
                // Eager optimistic update; the backend echo overwrites later.
                session.state.write().model = Some(model.clone());
                let msg = UnifiedMessage::configuration_change(
                    "set_model",
                    [("model".to_string(), Value::String(model))],
                );
                self.forward_or_queue(session, msg);
                self.schedule_save(session);
            }

            InboundFrame::SetPermissionMode { mode } => {
                session.state.write().permission_mode = mode;
                let msg = UnifiedMessage::configuration_change(
                    "set_permission_mode",
                    [(
                        "mode".to_string(),
                        serde_json::to_value(mode).unwrap_or(Value::Null),
                    )],
                );
                self.forward_or_queue(session, msg);
                self.schedule_save(session);
            }

            InboundFrame::SetAdapter { .. } => {
                self.reply(
                    session,
                    sink_id,
                    &OutboundFrame::error("Adapter cannot be changed mid-session"),
                );
            }

            InboundFrame::SlashCommand {
                command,
                request_id,
            } => {
                self.handle_slash_command(session, sink_id, command, request_id);
            }
        }
    }

    /// Deliver toward the backend, or queue in `pending_messages` while no
    /// backend is attached.
    pub(crate) fn forward_or_queue(self: &Arc<Self>, session: &Arc<Session>, msg: UnifiedMessage) {
        if session.has_backend() {
            self.send_to_backend(session, msg);
        } else {
            if msg.kind == MessageKind::UserMessage {
                // Pre-connect UX slot: late joiners see the latest queued prompt.
                *session.queued_message.lock() = Some(msg.clone());
            }
            session.pending_messages.lock().push_back(msg);
        }
    }

    fn resolve_permission(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request_id: &str,
        behavior: PermissionBehavior,
        note: Option<String>,
    ) {
        // Unknown (already handled or expired) → drop silently.
        let Some(record) = session.take_permission(request_id) else {
            tracing::debug!(
                session_id = %session.id,
                request_id,
                "permission response for unknown request dropped"
            );
            return;
        };
        self.tracer.emit(TraceEvent::PermissionResolved {
            session_id: session.id.to_string(),
            request_id: request_id.to_owned(),
            behavior: format!("{behavior:?}").to_lowercase(),
        });
        let response = permissions::response_message(&record, behavior, note);
        self.forward_or_queue(session, response);
    }

    fn handle_slash_command(
        self: &Arc<Self>,
        session: &Arc<Session>,
        sink_id: SinkId,
        command: String,
        request_id: Option<String>,
    ) {
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or(command.as_str())
            .to_owned();
        let category = session
            .commands
            .lock()
            .lookup(&name)
            .map(|spec| spec.category);

        match category {
            Some(CommandCategory::ConsumerLocal) => {
                let content = if name == "/clear" {
                    session.history.write().clear();
                    "Conversation cleared".to_owned()
                } else {
                    session.commands.lock().help_text()
                };
                self.reply(
                    session,
                    sink_id,
                    &OutboundFrame::SlashCommandResult {
                        command: name,
                        content,
                        source: "emulated".into(),
                        request_id,
                    },
                );
            }
            Some(CommandCategory::Relay) => {
                let state = session.state_snapshot();
                let rendered = session.commands.lock().render_relay(&name, &state);
                match rendered {
                    Some(content) => self.reply(
                        session,
                        sink_id,
                        &OutboundFrame::SlashCommandResult {
                            command: name,
                            content,
                            source: "emulated".into(),
                            request_id,
                        },
                    ),
                    None => self.reply(
                        session,
                        sink_id,
                        &OutboundFrame::SlashCommandError {
                            command: name,
                            error: "command could not be rendered".into(),
                        },
                    ),
                }
            }
            Some(CommandCategory::Passthrough) => {
                session
                    .pending_passthroughs
                    .lock()
                    .push_back(PendingPassthrough {
                        command: name,
                        request_id,
                    });
                self.forward_or_queue(session, UnifiedMessage::user_text(&command));
            }
            None => {
                // Unknown commands go to the backend, which reports them.
                self.forward_or_queue(session, UnifiedMessage::user_text(&command));
            }
        }
    }

    pub(crate) fn reply(&self, session: &Session, sink_id: SinkId, frame: &OutboundFrame) {
        let consumers = session.consumers.read();
        if let Some(seat) = consumers.get(&sink_id) {
            broadcast::send_to(&seat.sink, frame);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Backend → consumer
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn route_unified_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        msg: UnifiedMessage,
    ) {
        session.touch();
        self.tracer.emit(TraceEvent::MessageRouted {
            session_id: session.id.to_string(),
            direction: "inbound",
            kind: msg.kind.as_str().to_owned(),
            payload: None,
        });

        match msg.kind {
            MessageKind::SessionInit => self.on_session_init(session, &msg),
            MessageKind::StreamEvent => self.on_stream_event(session, &msg),
            MessageKind::Result => self.on_result(session, &msg),
            MessageKind::PermissionRequest => self.on_permission_request(session, &msg),
            MessageKind::StatusChange => self.on_status_change(session, &msg),
            MessageKind::AuthStatus => self.on_auth_status(session, &msg),
            MessageKind::ConfigurationChange => self.on_configuration_echo(session, &msg),
            MessageKind::Assistant => {
                session.push_history(msg.clone());
                let frame = OutboundFrame::Assistant {
                    message: serde_json::to_value(&msg).unwrap_or(Value::Null),
                    parent_tool_use_id: msg.meta_str("parent_tool_use_id").map(str::to_owned),
                };
                broadcast::broadcast(session, &frame);
            }
            MessageKind::UserMessage => {
                // A user echo that was not consumed by a passthrough.
                session.push_history(msg.clone());
                broadcast::broadcast(session, &OutboundFrame::UserMessage { message: msg });
            }
            MessageKind::ToolProgress => {
                session.push_history(msg.clone());
                broadcast::broadcast(
                    session,
                    &OutboundFrame::ToolProgress {
                        data: msg.metadata.clone(),
                    },
                );
            }
            MessageKind::ToolUseSummary => {
                session.push_history(msg.clone());
                broadcast::broadcast(
                    session,
                    &OutboundFrame::ToolUseSummary {
                        data: msg.metadata.clone(),
                    },
                );
            }
            MessageKind::Unknown => self.on_unknown(session, &msg),
            MessageKind::PermissionResponse
            | MessageKind::PermissionCancelled
            | MessageKind::Interrupt => {
                tracing::debug!(
                    session_id = %session.id,
                    kind = msg.kind.as_str(),
                    "ignoring consumer-direction message from backend"
                );
            }
        }
        self.schedule_save(session);
    }

    fn on_session_init(self: &Arc<Self>, session: &Arc<Session>, msg: &UnifiedMessage) {
        let slash_commands: Vec<String> = msg
            .metadata
            .get("slash_commands")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let skills: Vec<Value> = msg
            .metadata
            .get("skills")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        {
            let mut state = session.state.write();
            if let Some(model) = msg.meta_str("model") {
                state.model = Some(model.to_owned());
            }
            if let Some(cwd) = msg.meta_str("cwd") {
                state.cwd = Some(cwd.to_owned());
            }
            if let Some(tools) = msg.metadata.get("tools").and_then(Value::as_array) {
                state.tools = tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
            }
            if let Some(mode) = msg.metadata.get("permissionMode") {
                if let Ok(mode) = serde_json::from_value::<PermissionMode>(mode.clone()) {
                    state.permission_mode = mode;
                }
            }
            if let Some(servers) = msg.metadata.get("mcp_servers").and_then(Value::as_array) {
                state.mcp_servers = servers.clone();
            }
            state.slash_commands = slash_commands.clone();
            state.skills = skills.clone();
        }

        // Built-ins preserved, dynamic layer reseeded from this init.
        {
            let mut commands = session.commands.lock();
            let skill_names = skills
                .iter()
                .filter_map(|s| s.get("name").and_then(Value::as_str))
                .map(str::to_owned);
            commands.reseed(slash_commands.into_iter().chain(skill_names));
        }

        if let Some(backend_session_id) = msg.meta_str("session_id") {
            *session.backend_session_id.lock() = Some(backend_session_id.to_owned());
            self.events.emit(BrokerEvent::BackendSessionId {
                session_id: session.id,
                backend_session_id: backend_session_id.to_owned(),
            });
        }

        if !session.initialize_requested.swap(true, Ordering::AcqRel) {
            self.request_capabilities(session);
        }

        broadcast::broadcast(
            session,
            &OutboundFrame::SessionInit {
                session: session.state_snapshot(),
            },
        );
    }

    /// Issue the initialize handshake toward the backend and arm the
    /// capabilities timeout. Backends without a raw control channel get the
    /// emulated fallback immediately.
    fn request_capabilities(self: &Arc<Self>, session: &Arc<Session>) {
        let sent = match session.backend_handle() {
            Some(handle) => handle
                .send_raw(r#"{"type":"control_request","request":{"subtype":"initialize"}}"#)
                .is_ok(),
            None => false,
        };
        if !sent {
            self.emit_capabilities_fallback(session);
            return;
        }

        let bridge = self.clone();
        let session = session.clone();
        let timeout = std::time::Duration::from_millis(bridge.config.initialize_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let resolved = session.state.read().capabilities.is_some();
            if !resolved {
                bridge
                    .events
                    .emit(BrokerEvent::CapabilitiesTimeout { session_id: session.id });
                bridge.emit_capabilities_fallback(&session);
            }
        });
    }

    /// Capabilities derived from what the init already told us.
    fn emit_capabilities_fallback(&self, session: &Arc<Session>) {
        let state = session.state_snapshot();
        if state.capabilities.is_some() {
            return;
        }
        let commands: Vec<Value> = state
            .slash_commands
            .iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        let snapshot = CapabilitiesSnapshot {
            commands: commands.clone(),
            models: Vec::new(),
            account: None,
            skills: state.skills.clone(),
        };
        session.state.write().capabilities = Some(snapshot);
        broadcast::broadcast(
            session,
            &OutboundFrame::CapabilitiesReady {
                commands,
                models: Vec::new(),
                account: None,
                skills: state.skills,
            },
        );
    }

    fn on_stream_event(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let event = msg.metadata.get("event").cloned().unwrap_or(Value::Null);
        let is_message_start = event
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t == "message_start")
            .unwrap_or(false);
        if is_message_start {
            session.state.write().status = Some(SessionStatus::Running);
            broadcast::broadcast(
                session,
                &OutboundFrame::StatusChange {
                    status: Some(SessionStatus::Running),
                },
            );
        }
        broadcast::broadcast(
            session,
            &OutboundFrame::StreamEvent {
                event,
                parent_tool_use_id: msg.meta_str("parent_tool_use_id").map(str::to_owned),
            },
        );
    }

    fn on_result(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        session.push_history(msg.clone());
        {
            let mut state = session.state.write();
            let usage = &mut state.usage;
            if let Some(cost) = msg.metadata.get("total_cost_usd").and_then(Value::as_f64) {
                usage.total_cost_usd += cost;
            }
            usage.input_tokens += msg.meta_u64("input_tokens").unwrap_or(0);
            usage.output_tokens += msg.meta_u64("output_tokens").unwrap_or(0);
            usage.duration_ms += msg.meta_u64("duration_ms").unwrap_or(0);
            usage.lines_added += msg.meta_u64("lines_added").unwrap_or(0);
            usage.lines_removed += msg.meta_u64("lines_removed").unwrap_or(0);
            usage.num_turns = msg.meta_u64("num_turns").unwrap_or(usage.num_turns + 1);
            state.status = Some(SessionStatus::Idle);
        }

        if msg.meta_u64("num_turns") == Some(1)
            && !session.first_turn_emitted.swap(true, Ordering::AcqRel)
        {
            self.events.emit(BrokerEvent::FirstTurnCompleted {
                session_id: session.id,
                first_user_message: session.first_user_message.lock().clone(),
            });
        }

        broadcast::broadcast(
            session,
            &OutboundFrame::Result {
                data: Value::Object(msg.metadata.clone()),
            },
        );
        broadcast::broadcast(
            session,
            &OutboundFrame::StatusChange {
                status: Some(SessionStatus::Idle),
            },
        );
    }

    fn on_permission_request(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let Some(record) = permissions::record_from_message(msg) else {
            tracing::warn!(session_id = %session.id, "permission request without request_id");
            return;
        };
        self.tracer.emit(TraceEvent::PermissionPending {
            session_id: session.id.to_string(),
            request_id: record.request_id.clone(),
            tool_name: record.tool_name.clone(),
        });
        session.push_history(msg.clone());
        session.store_permission(record);
        broadcast::broadcast_to_participants(
            session,
            &OutboundFrame::PermissionRequest {
                request: msg.clone(),
            },
        );
    }

    fn on_status_change(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let status = msg
            .metadata
            .get("status")
            .and_then(|v| serde_json::from_value::<SessionStatus>(v.clone()).ok());
        {
            let mut state = session.state.write();
            state.status = status;
            if let Some(mode) = msg.metadata.get("permissionMode") {
                if let Ok(mode) = serde_json::from_value::<PermissionMode>(mode.clone()) {
                    state.permission_mode = mode;
                }
            }
        }
        broadcast::broadcast(session, &OutboundFrame::StatusChange { status });
    }

    fn on_auth_status(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let value = Value::Object(msg.metadata.clone());
        *session.last_auth_status.lock() = Some(value);
        broadcast::broadcast(
            session,
            &OutboundFrame::AuthStatus {
                is_authenticating: msg
                    .metadata
                    .get("isAuthenticating")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                output: msg.meta_str("output").map(str::to_owned),
                error: msg.meta_str("error").map(str::to_owned),
            },
        );
    }

    /// The backend echoing a configuration change overwrites the eager
    /// consumer-side update.
    fn on_configuration_echo(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let mut state = session.state.write();
        match msg.meta_str("subtype") {
            Some("set_model") => {
                if let Some(model) = msg.meta_str("model") {
                    state.model = Some(model.to_owned());
                }
            }
            Some("set_permission_mode") => {
                if let Some(mode) = msg.metadata.get("mode") {
                    if let Ok(mode) = serde_json::from_value::<PermissionMode>(mode.clone()) {
                        state.permission_mode = mode;
                    }
                }
            }
            _ => {}
        }
    }

    /// `unknown` messages may still carry a capabilities control response.
    fn on_unknown(&self, session: &Arc<Session>, msg: &UnifiedMessage) {
        let Some(response) = msg
            .metadata
            .get("control_response")
            .and_then(|v| v.get("response"))
        else {
            tracing::debug!(session_id = %session.id, "dropping unknown backend message");
            return;
        };
        let commands: Vec<Value> = response
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let models: Vec<Value> = response
            .get("models")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let account = response.get("account").cloned();
        let skills: Vec<Value> = response
            .get("skills")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        session.commands.lock().enrich(&commands);
        session.state.write().capabilities = Some(CapabilitiesSnapshot {
            commands: commands.clone(),
            models: models.clone(),
            account: account.clone(),
            skills: skills.clone(),
        });
        broadcast::broadcast(
            session,
            &OutboundFrame::CapabilitiesReady {
                commands,
                models,
                account,
                skills,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BackendSession, OutboundPayload};
    use crate::gate::{AuthContext, TokenBucket};
    use crate::testutil::{harness, harness_with_config, mock_session, RecordingSink};
    use bc_protocol::{ConsumerRole, MessageKind, Role};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn auth_ctx(session_id: Uuid) -> AuthContext {
        AuthContext {
            session_id,
            token: None,
            remote_addr: None,
        }
    }

    // ── Scenario 1: anonymous open + replay ───────────────────────────

    #[tokio::test]
    async fn anonymous_open_replays_in_order() {
        let h = harness();
        let session = mock_session(&h);
        session.push_history(UnifiedMessage::new(MessageKind::Assistant, Role::Assistant));

        let mut events = h.events.subscribe();
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;

        assert_eq!(
            sink.frame_types(),
            vec![
                "identity",
                "session_init",
                "message_history",
                "presence",
                "cli_disconnected"
            ]
        );
        let identity = &sink.frames()[0];
        assert_eq!(identity["userId"], "anonymous-1");
        assert_eq!(identity["displayName"], "User 1");
        assert_eq!(identity["role"], "participant");
        let history = &sink.frames()[2];
        assert_eq!(history["messages"].as_array().unwrap().len(), 1);

        // backend:relaunch_needed emitted once with the session id.
        let mut relaunches = 0;
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::BackendRelaunchNeeded { session_id } = event {
                assert_eq!(session_id, session.id);
                relaunches += 1;
            }
        }
        assert_eq!(relaunches, 1);
    }

    #[tokio::test]
    async fn second_consumer_gets_next_anonymous_identity() {
        let h = harness();
        let session = mock_session(&h);
        let a = RecordingSink::new(1);
        let b = RecordingSink::new(2);
        h.bridge.handle_consumer_open(a, auth_ctx(session.id)).await;
        h.bridge
            .handle_consumer_open(b.clone(), auth_ctx(session.id))
            .await;
        assert_eq!(b.frames()[0]["userId"], "anonymous-2");
        assert_eq!(session.consumer_count(), 2);
    }

    // ── Scenario 2: pre-connect queue flush ───────────────────────────

    #[tokio::test]
    async fn pre_connect_queue_flushes_on_connect() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;

        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "user_message", "content": "Hello"}).to_string(),
            )
            .await;
        assert_eq!(session.pending_messages.lock().len(), 1);
        assert!(session.queued_message.lock().is_some());

        h.bridge.connect_backend(&session).await.unwrap();
        let mut ep = h.adapter.take_endpoints(&session.id).unwrap();

        let delivered = ep.outbound_rx.try_recv().unwrap();
        match delivered {
            OutboundPayload::Unified(msg) => {
                assert_eq!(msg.kind, MessageKind::UserMessage);
                assert_eq!(msg.text(), "Hello");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(ep.outbound_rx.try_recv().is_err(), "exactly one message");
        assert!(session.pending_messages.lock().is_empty());
        assert!(session.queued_message.lock().is_none());
        assert!(sink.frame_types().contains(&"cli_connected".to_string()));
    }

    // ── Scenario 3: passthrough interception ──────────────────────────

    #[tokio::test]
    async fn passthrough_echo_becomes_slash_command_result() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge.connect_backend(&session).await.unwrap();
        let mut ep = h.adapter.take_endpoints(&session.id).unwrap();

        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "slash_command", "command": "/context", "request_id": "r1"})
                    .to_string(),
            )
            .await;

        // The command is forwarded to the backend as a user message.
        match ep.outbound_rx.try_recv().unwrap() {
            OutboundPayload::Unified(msg) => assert_eq!(msg.text(), "/context"),
            other => panic!("unexpected payload: {other:?}"),
        }

        // Backend echoes the user message wrapping local command output.
        let mut echo = UnifiedMessage::new(MessageKind::UserMessage, Role::User);
        echo.metadata.insert(
            "content".into(),
            json!("<local-command-stdout>ctx output</local-command-stdout>"),
        );
        assert!(ep.inbound.deliver(echo).await);

        wait_until(|| {
            sink.frame_types()
                .contains(&"slash_command_result".to_string())
        })
        .await;
        let result = sink
            .frames()
            .into_iter()
            .find(|f| f["type"] == "slash_command_result")
            .unwrap();
        assert_eq!(result["command"], "/context");
        assert_eq!(result["request_id"], "r1");
        assert_eq!(result["content"], "ctx output");
        assert_eq!(result["source"], "pty");

        // The raw echo is not broadcast or retained.
        assert!(!sink.frame_types().contains(&"user_message".to_string()));
        assert!(session.history.read().is_empty());

        // A second echo is a regular message again.
        let mut second = UnifiedMessage::user_text("regular follow-up");
        second.role = Role::User;
        assert!(ep.inbound.deliver(second).await);
        wait_until(|| sink.frame_types().contains(&"user_message".to_string())).await;
        assert_eq!(session.history.read().len(), 1);
    }

    // ── Scenario 4: permission deny ───────────────────────────────────

    #[tokio::test]
    async fn permission_deny_round_trip() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge.connect_backend(&session).await.unwrap();
        let mut ep = h.adapter.take_endpoints(&session.id).unwrap();

        let mut request = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        request.metadata.insert("request_id".into(), json!("p1"));
        request.metadata.insert("tool_name".into(), json!("Bash"));
        request
            .metadata
            .insert("input".into(), json!({"command": "rm -rf /"}));
        assert!(ep.inbound.deliver(request).await);

        wait_until(|| session.pending_permission("p1").is_some()).await;
        wait_until(|| {
            sink.frame_types()
                .contains(&"permission_request".to_string())
        })
        .await;

        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "permission_response", "request_id": "p1", "behavior": "deny"})
                    .to_string(),
            )
            .await;

        assert!(session.pending_permission("p1").is_none());
        match ep.outbound_rx.try_recv().unwrap() {
            OutboundPayload::Unified(msg) => {
                assert_eq!(msg.kind, MessageKind::PermissionResponse);
                assert_eq!(msg.meta_str("request_id"), Some("p1"));
                assert_eq!(msg.meta_str("decision"), Some("deny"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // A duplicate response is dropped silently: nothing further on p1.
        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "permission_response", "request_id": "p1", "behavior": "deny"})
                    .to_string(),
            )
            .await;
        assert!(ep.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn permission_requests_go_to_participants_only() {
        let h = harness();
        let session = mock_session(&h);
        let participant = RecordingSink::new(1);
        let observer = RecordingSink::new(2);
        session.add_consumer(participant.clone(), bc_protocol::ConsumerIdentity::anonymous(1));
        session.add_consumer(
            observer.clone(),
            bc_protocol::ConsumerIdentity {
                user_id: "obs".into(),
                display_name: "Observer".into(),
                role: ConsumerRole::Observer,
            },
        );

        let mut request = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        request.metadata.insert("request_id".into(), json!("p9"));
        h.bridge.route_unified_message(&session, request).await;

        assert!(participant
            .frame_types()
            .contains(&"permission_request".to_string()));
        assert!(observer.frames().is_empty());
    }

    // ── Scenario 5: oversize close ────────────────────────────────────

    #[tokio::test]
    async fn oversize_frame_closes_with_1009() {
        let mut config = BrokerConfig::default();
        config.max_consumer_message_size = 1024;
        let h = harness_with_config(config);
        let session = mock_session(&h);
        let victim = RecordingSink::new(1);
        let sibling = RecordingSink::new(2);
        h.bridge
            .handle_consumer_open(victim.clone(), auth_ctx(session.id))
            .await;
        h.bridge
            .handle_consumer_open(sibling.clone(), auth_ctx(session.id))
            .await;

        // Exactly at the limit: accepted.
        let base = json!({"type": "user_message", "content": ""}).to_string();
        let pad = 1024 - base.len();
        let exact = json!({"type": "user_message", "content": "a".repeat(pad)}).to_string();
        assert_eq!(exact.len(), 1024);
        h.bridge
            .handle_consumer_message(session.id, 1, &exact)
            .await;
        assert!(victim.closed_with().is_none());
        assert_eq!(session.pending_messages.lock().len(), 1);

        // One over: closed with 1009, sibling unaffected.
        let over = json!({"type": "user_message", "content": "a".repeat(pad + 1)}).to_string();
        assert_eq!(over.len(), 1025);
        h.bridge.handle_consumer_message(session.id, 1, &over).await;
        assert_eq!(
            victim.closed_with(),
            Some((1009, "Message Too Big".to_string()))
        );
        assert!(sibling.closed_with().is_none());
        assert!(h.bridge.session(&session.id).is_some());
    }

    // ── Routing details ───────────────────────────────────────────────

    #[tokio::test]
    async fn observers_get_error_replies_on_writes() {
        let h = harness();
        let session = mock_session(&h);
        let observer = RecordingSink::new(5);
        session.add_consumer(
            observer.clone(),
            bc_protocol::ConsumerIdentity {
                user_id: "obs".into(),
                display_name: "Observer".into(),
                role: ConsumerRole::Observer,
            },
        );

        h.bridge
            .handle_consumer_message(
                session.id,
                5,
                &json!({"type": "user_message", "content": "hi"}).to_string(),
            )
            .await;
        assert_eq!(observer.frame_types(), vec!["error"]);
        assert!(session.pending_messages.lock().is_empty());
        // RBAC denial never closes the socket.
        assert!(observer.closed_with().is_none());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        let before = sink.frames().len();

        h.bridge
            .handle_consumer_message(session.id, 1, "{ not json")
            .await;
        h.bridge
            .handle_consumer_message(session.id, 1, &json!({"type": "subscribe"}).to_string())
            .await;
        // Unknown session id: silently dropped.
        h.bridge
            .handle_consumer_message(Uuid::new_v4(), 1, &json!({"type": "interrupt"}).to_string())
            .await;

        assert_eq!(sink.frames().len(), before);
        assert!(sink.closed_with().is_none());
    }

    #[tokio::test]
    async fn rate_limited_messages_get_error_reply() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        // Swap in an exhausted bucket.
        session.rate_limiters.lock().insert(
            1,
            TokenBucket::new(1, 60_000, chrono::Utc::now().timestamp_millis()),
        );

        let mut events = h.events.subscribe();
        let frame = json!({"type": "interrupt"}).to_string();
        h.bridge.handle_consumer_message(session.id, 1, &frame).await;
        h.bridge.handle_consumer_message(session.id, 1, &frame).await;

        let errors: Vec<_> = sink
            .frames()
            .into_iter()
            .filter(|f| f["type"] == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["message"], "Rate limit exceeded");

        let mut limited = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BrokerEvent::RateLimitExceeded { .. }) {
                limited = true;
            }
        }
        assert!(limited);
    }

    #[tokio::test]
    async fn set_adapter_is_rejected() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "set_adapter", "adapter": "codex"}).to_string(),
            )
            .await;
        let error = sink
            .frames()
            .into_iter()
            .find(|f| f["type"] == "error")
            .unwrap();
        assert_eq!(error["message"], "Adapter cannot be changed mid-session");
    }

    #[tokio::test]
    async fn set_model_updates_state_eagerly_and_queues() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink, auth_ctx(session.id))
            .await;
        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "set_model", "model": "opus"}).to_string(),
            )
            .await;

        assert_eq!(session.state.read().model.as_deref(), Some("opus"));
        let pending = session.pending_messages.lock();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MessageKind::ConfigurationChange);
        assert_eq!(pending[0].meta_str("subtype"), Some("set_model"));
    }

    #[tokio::test]
    async fn backend_config_echo_overwrites_model() {
        let h = harness();
        let session = mock_session(&h);
        session.state.write().model = Some("optimistic".into());
        let echo = UnifiedMessage::configuration_change(
            "set_model",
            [("model".to_string(), json!("actual"))],
        );
        h.bridge.route_unified_message(&session, echo).await;
        assert_eq!(session.state.read().model.as_deref(), Some("actual"));
    }

    #[tokio::test]
    async fn consumer_local_and_relay_commands_are_emulated() {
        let h = harness();
        let session = mock_session(&h);
        session.state.write().model = Some("opus".into());
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;

        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "slash_command", "command": "/help", "request_id": "h1"})
                    .to_string(),
            )
            .await;
        h.bridge
            .handle_consumer_message(
                session.id,
                1,
                &json!({"type": "slash_command", "command": "/model"}).to_string(),
            )
            .await;

        let results: Vec<_> = sink
            .frames()
            .into_iter()
            .filter(|f| f["type"] == "slash_command_result")
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["command"], "/help");
        assert_eq!(results[0]["source"], "emulated");
        assert_eq!(results[0]["request_id"], "h1");
        assert!(results[0]["content"].as_str().unwrap().contains("/model"));
        assert_eq!(results[1]["content"], "Model: opus");
        // Emulated commands never reach the pending queue.
        assert!(session.pending_messages.lock().is_empty());
    }

    #[tokio::test]
    async fn session_init_reseeds_commands_and_broadcasts() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;

        let mut init = UnifiedMessage::new(MessageKind::SessionInit, Role::System);
        init.metadata.insert("model".into(), json!("opus"));
        init.metadata.insert("cwd".into(), json!("/work"));
        init.metadata
            .insert("session_id".into(), json!("backend-77"));
        init.metadata
            .insert("slash_commands".into(), json!(["/commit", "/review"]));
        init.metadata
            .insert("skills".into(), json!([{"name": "deploy"}]));
        let mut events = h.events.subscribe();
        h.bridge.route_unified_message(&session, init).await;

        assert_eq!(session.state.read().model.as_deref(), Some("opus"));
        assert_eq!(
            *session.backend_session_id.lock(),
            Some("backend-77".to_string())
        );
        {
            let commands = session.commands.lock();
            assert!(commands.lookup("/commit").is_some());
            assert!(commands.lookup("/deploy").is_some());
            assert!(commands.lookup("/help").is_some());
        }
        assert!(sink.frame_types().contains(&"session_init".to_string()));

        let mut saw_backend_id = false;
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::BackendSessionId {
                backend_session_id, ..
            } = event
            {
                assert_eq!(backend_session_id, "backend-77");
                saw_backend_id = true;
            }
        }
        assert!(saw_backend_id);
    }

    #[tokio::test]
    async fn result_rolls_up_usage_and_emits_first_turn_once() {
        let h = harness();
        let session = mock_session(&h);
        *session.first_user_message.lock() = Some("Hello".into());
        let mut events = h.events.subscribe();

        let mut result = UnifiedMessage::new(MessageKind::Result, Role::System);
        result.metadata.insert("num_turns".into(), json!(1));
        result.metadata.insert("input_tokens".into(), json!(100));
        result.metadata.insert("output_tokens".into(), json!(40));
        result
            .metadata
            .insert("total_cost_usd".into(), json!(0.25));
        h.bridge
            .route_unified_message(&session, result.clone())
            .await;
        h.bridge.route_unified_message(&session, result).await;

        let state = session.state_snapshot();
        assert_eq!(state.usage.input_tokens, 200);
        assert_eq!(state.usage.output_tokens, 80);
        assert!((state.usage.total_cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(state.status, Some(bc_protocol::SessionStatus::Idle));

        let mut first_turns = 0;
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::FirstTurnCompleted {
                first_user_message, ..
            } = event
            {
                assert_eq!(first_user_message.as_deref(), Some("Hello"));
                first_turns += 1;
            }
        }
        assert_eq!(first_turns, 1);
    }

    #[tokio::test]
    async fn stream_message_start_flips_status_to_running() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;

        let mut stream = UnifiedMessage::new(MessageKind::StreamEvent, Role::Assistant);
        stream
            .metadata
            .insert("event".into(), json!({"type": "message_start"}));
        h.bridge.route_unified_message(&session, stream).await;

        assert_eq!(
            session.state.read().status,
            Some(bc_protocol::SessionStatus::Running)
        );
        let types = sink.frame_types();
        assert!(types.contains(&"status_change".to_string()));
        assert!(types.contains(&"stream_event".to_string()));
        // Stream events are not history.
        assert!(session.history.read().is_empty());
    }

    #[tokio::test]
    async fn capabilities_control_response_enriches_and_broadcasts() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        session.commands.lock().reseed(["commit"]);

        let mut msg = UnifiedMessage::new(MessageKind::Unknown, Role::System);
        msg.metadata.insert(
            "control_response".into(),
            json!({
                "subtype": "success",
                "response": {
                    "commands": [{"name": "/commit", "description": "Create a commit"}],
                    "models": [{"id": "opus"}],
                    "account": {"email": "dev@example.com"}
                }
            }),
        );
        h.bridge.route_unified_message(&session, msg).await;

        assert!(session.state.read().capabilities.is_some());
        assert_eq!(
            session.commands.lock().lookup("/commit").unwrap().description,
            "Create a commit"
        );
        let caps = sink
            .frames()
            .into_iter()
            .find(|f| f["type"] == "capabilities_ready")
            .unwrap();
        assert_eq!(caps["commands"][0]["name"], "/commit");
        assert_eq!(caps["account"]["email"], "dev@example.com");
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_replaces_prior_backend_silently() {
        let h = harness();
        let session = mock_session(&h);
        h.bridge.connect_backend(&session).await.unwrap();
        let first = h.adapter.take_endpoints(&session.id).unwrap();
        let first_handle = session.backend_handle().unwrap();

        h.bridge.connect_backend(&session).await.unwrap();
        assert!(first.closed.is_cancelled());
        assert!(first_handle.send(UnifiedMessage::user_text("x")).is_err());
        assert!(session.has_backend());
        assert_eq!(*h.adapter.connect_count.lock(), 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_permissions() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge.connect_backend(&session).await.unwrap();
        let _ep = h.adapter.take_endpoints(&session.id).unwrap();

        let mut request = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        request.metadata.insert("request_id".into(), json!("p1"));
        h.bridge.route_unified_message(&session, request).await;
        assert!(session.pending_permission("p1").is_some());

        h.bridge
            .disconnect_backend(&session, Some(1000), "going away")
            .await;

        assert!(!session.has_backend());
        assert!(session.pending_permission("p1").is_none());
        let cancelled = sink
            .frames()
            .into_iter()
            .find(|f| f["type"] == "permission_cancelled")
            .unwrap();
        assert_eq!(cancelled["request_id"], "p1");
        assert!(sink.frame_types().contains(&"cli_disconnected".to_string()));

        // Idempotent with no backend attached.
        h.bridge.disconnect_backend(&session, None, "again").await;
    }

    #[tokio::test]
    async fn stream_end_is_treated_as_disconnect() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge.connect_backend(&session).await.unwrap();
        let ep = h.adapter.take_endpoints(&session.id).unwrap();
        let mut events = h.events.subscribe();

        // Dropping the endpoints drops the inbound sender: stream ends.
        drop(ep);
        wait_until(|| !session.has_backend()).await;
        assert!(sink.frame_types().contains(&"cli_disconnected".to_string()));

        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::BackendDisconnected { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec!["stream ended".to_string()]);
    }

    #[tokio::test]
    async fn send_to_backend_errors_surface_as_events() {
        let h = harness();
        let session = mock_session(&h);
        h.bridge.connect_backend(&session).await.unwrap();
        let handle = session.backend_handle().unwrap();
        handle.close().await;

        let mut events = h.events.subscribe();
        h.bridge
            .send_to_backend(&session, UnifiedMessage::user_text("after close"));
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::SessionError { source, .. } = event {
                assert_eq!(source, "sendToBackend");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let h = harness();
        let session = mock_session(&h);
        h.adapter.fail_next_connects();
        assert!(h.bridge.connect_backend(&session).await.is_err());
        assert!(!session.has_backend());
    }

    #[tokio::test]
    async fn close_session_tears_everything_down() {
        let h = harness();
        let session = mock_session(&h);
        let sink = RecordingSink::new(1);
        h.bridge
            .handle_consumer_open(sink.clone(), auth_ctx(session.id))
            .await;
        h.bridge.connect_backend(&session).await.unwrap();

        let mut events = h.events.subscribe();
        assert!(h.bridge.close_session(&session.id).await);
        assert!(h.bridge.session(&session.id).is_none());
        assert_eq!(sink.closed_with().map(|c| c.0), Some(1000));

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BrokerEvent::SessionClosed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);

        // Idempotent on a missing id.
        assert!(!h.bridge.close_session(&session.id).await);
    }

    #[tokio::test]
    async fn consumer_close_releases_seat_and_bucket() {
        let h = harness();
        let session = mock_session(&h);
        let a = RecordingSink::new(1);
        let b = RecordingSink::new(2);
        h.bridge.handle_consumer_open(a, auth_ctx(session.id)).await;
        h.bridge
            .handle_consumer_open(b.clone(), auth_ctx(session.id))
            .await;
        h.bridge
            .handle_consumer_message(session.id, 1, &json!({"type": "interrupt"}).to_string())
            .await;
        assert!(session.rate_limiters.lock().contains_key(&1));

        let mut events = h.events.subscribe();
        h.bridge.handle_consumer_close(session.id, 1);
        assert_eq!(session.consumer_count(), 1);
        assert!(!session.rate_limiters.lock().contains_key(&1));

        let mut saw = false;
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::ConsumerDisconnected {
                consumer_count,
                identity,
                ..
            } = event
            {
                assert_eq!(consumer_count, 1);
                assert!(identity.is_some());
                saw = true;
            }
        }
        assert!(saw);
        // The remaining consumer saw updated presence.
        let presence = b
            .frames()
            .into_iter()
            .filter(|f| f["type"] == "presence")
            .last()
            .unwrap();
        assert_eq!(presence["consumers"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_joiner_replays_pending_permissions_and_queued_message() {
        let h = harness();
        let session = mock_session(&h);
        let mut request = UnifiedMessage::new(MessageKind::PermissionRequest, Role::Assistant);
        request.metadata.insert("request_id".into(), json!("p1"));
        h.bridge.route_unified_message(&session, request).await;
        h.bridge
            .route_consumer_message(
                &session,
                99,
                InboundFrame::UserMessage {
                    content: "queued prompt".into(),
                    images: None,
                },
            )
            .await;

        let late = RecordingSink::new(7);
        h.bridge
            .handle_consumer_open(late.clone(), auth_ctx(session.id))
            .await;
        let types = late.frame_types();
        assert!(types.contains(&"permission_request".to_string()));
        assert!(types.contains(&"user_message".to_string()));
        // history contains the permission request for replay consistency.
        let history_frame = late
            .frames()
            .into_iter()
            .find(|f| f["type"] == "message_history")
            .unwrap();
        assert_eq!(history_frame["messages"].as_array().unwrap().len(), 1);
    }
}
