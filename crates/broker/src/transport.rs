//! Consumer transport half of the session bridge: socket open, inbound
//! frames, and close handling.

use std::sync::Arc;

use bc_domain::trace::TraceEvent;
use bc_protocol::{
    ConsumerIdentity, GitInfo, InboundFrame, OutboundFrame, CLOSE_AUTH_FAILED,
    CLOSE_MESSAGE_TOO_BIG, CLOSE_SESSION_NOT_FOUND,
};
use uuid::Uuid;

use crate::bridge::SessionBridge;
use crate::broadcast::{self, ConsumerSink, SinkId};
use crate::events::BrokerEvent;
use crate::gate::{AuthContext, AuthResult};
use crate::store::Session;

impl SessionBridge {
    /// A consumer socket opened for `ctx.session_id`. Authenticates (or
    /// assigns an anonymous identity) and runs the accept sequence.
    pub async fn handle_consumer_open(
        self: &Arc<Self>,
        sink: Arc<dyn ConsumerSink>,
        ctx: AuthContext,
    ) {
        let session = self.get_or_create(ctx.session_id);

        let identity = if self.gate.has_authenticator() {
            match self.gate.authenticate_async(sink.id(), &ctx).await {
                AuthResult::Granted(identity) => identity,
                AuthResult::Denied(reason) => {
                    tracing::warn!(session_id = %ctx.session_id, reason = %reason, "consumer rejected");
                    sink.close(CLOSE_AUTH_FAILED, "Authentication failed");
                    return;
                }
                AuthResult::Cancelled => return,
            }
        } else {
            ConsumerIdentity::anonymous(session.next_anonymous())
        };

        // The session may have been closed while auth was in flight.
        if self.session(&ctx.session_id).is_none() {
            sink.close(CLOSE_SESSION_NOT_FOUND, "Session not found");
            return;
        }

        self.accept_consumer(&session, sink, identity).await;
    }

    async fn accept_consumer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        sink: Arc<dyn ConsumerSink>,
        identity: ConsumerIdentity,
    ) {
        session.add_consumer(sink.clone(), identity.clone());
        session.touch();
        self.tracer.emit(TraceEvent::ConsumerJoined {
            session_id: session.id.to_string(),
            user_id: identity.user_id.clone(),
            role: if identity.is_participant() {
                "participant".into()
            } else {
                "observer".into()
            },
        });

        // 1. Identity is always the first frame.
        broadcast::send_to(&sink, &OutboundFrame::identity(&identity));

        // 2. Git info, best-effort, before the state snapshot goes out.
        self.resolve_git_info(session).await;

        // 3. State snapshot.
        broadcast::send_to(
            &sink,
            &OutboundFrame::SessionInit {
                session: session.state_snapshot(),
            },
        );

        // 4. History replay.
        let history = session.history.read().clone();
        if !history.is_empty() {
            broadcast::send_to(&sink, &OutboundFrame::MessageHistory { messages: history });
        }

        // 5. Capabilities, if the backend already reported them.
        if let Some(caps) = session.state.read().capabilities.clone() {
            broadcast::send_to(
                &sink,
                &OutboundFrame::CapabilitiesReady {
                    commands: caps.commands,
                    models: caps.models,
                    account: caps.account,
                    skills: caps.skills,
                },
            );
        }

        // 6. Participants see every pending permission.
        if identity.is_participant() {
            let pending: Vec<_> = session
                .pending_permissions
                .lock()
                .iter()
                .map(|(_, record)| record.request.clone())
                .collect();
            for request in pending {
                broadcast::send_to(&sink, &OutboundFrame::PermissionRequest { request });
            }
        }

        // 7. The queued pre-connect prompt, if any.
        if let Some(queued) = session.queued_message.lock().clone() {
            broadcast::send_to(&sink, &OutboundFrame::UserMessage { message: queued });
        }

        // 8. Presence + connected event.
        broadcast::broadcast(
            session,
            &OutboundFrame::Presence {
                consumers: session.identities(),
            },
        );
        self.events.emit(BrokerEvent::ConsumerConnected {
            session_id: session.id,
            consumer_count: session.consumer_count(),
        });

        // 9. Backend connectivity, and a relaunch nudge when it is gone.
        if session.has_backend() {
            broadcast::send_to(&sink, &OutboundFrame::CliConnected);
        } else {
            broadcast::send_to(&sink, &OutboundFrame::CliDisconnected);
            self.events.emit(BrokerEvent::BackendRelaunchNeeded {
                session_id: session.id,
            });
        }
    }

    /// One raw frame from a consumer socket.
    pub async fn handle_consumer_message(
        self: &Arc<Self>,
        session_id: Uuid,
        sink_id: SinkId,
        raw: &str,
    ) {
        // 1. Unknown session → drop silently.
        let Some(session) = self.session(&session_id) else {
            return;
        };

        // 2. Any traffic counts as activity.
        session.touch();

        // 3. Oversize closes the socket; exactly at the limit is accepted.
        if raw.len() > self.config.max_consumer_message_size {
            tracing::warn!(
                session_id = %session_id,
                bytes = raw.len(),
                max = self.config.max_consumer_message_size,
                "oversize consumer frame"
            );
            if let Some(seat) = session.consumers.read().get(&sink_id) {
                seat.sink.close(CLOSE_MESSAGE_TOO_BIG, "Message Too Big");
            }
            return;
        }

        // 4. Parse; malformed JSON never closes the socket.
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "unparseable consumer frame");
                return;
            }
        };

        // 5. Schema validation.
        let frame: InboundFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "invalid consumer frame");
                return;
            }
        };

        // 6. Identity — absent means we raced a close; drop.
        let Some(identity) = session.identity_of(sink_id) else {
            return;
        };

        // 7. RBAC.
        if let Err(reason) = self.gate.authorize(&identity, frame.kind()) {
            self.reply(&session, sink_id, &OutboundFrame::error(reason));
            return;
        }

        // 8. Rate limit.
        if !self.gate.check_rate_limit(&session, sink_id) {
            self.reply(
                &session,
                sink_id,
                &OutboundFrame::error("Rate limit exceeded"),
            );
            self.events.emit(BrokerEvent::RateLimitExceeded {
                session_id: session.id,
            });
            return;
        }

        self.events.emit(BrokerEvent::MessageInbound {
            session_id: session.id,
            kind: frame.kind(),
        });
        self.route_consumer_message(&session, sink_id, frame).await;
    }

    /// Consumer socket closed (or errored). Releases the seat, its rate
    /// bucket, and any in-flight auth.
    pub fn handle_consumer_close(self: &Arc<Self>, session_id: Uuid, sink_id: SinkId) {
        self.gate.cancel_pending_auth(sink_id);
        let Some(session) = self.session(&session_id) else {
            return;
        };
        let identity = session.remove_consumer(sink_id);
        if let Some(identity) = &identity {
            self.tracer.emit(TraceEvent::ConsumerLeft {
                session_id: session.id.to_string(),
                user_id: identity.user_id.clone(),
            });
        }
        broadcast::broadcast(
            &session,
            &OutboundFrame::Presence {
                consumers: session.identities(),
            },
        );
        self.events.emit(BrokerEvent::ConsumerDisconnected {
            session_id,
            consumer_count: session.consumer_count(),
            identity,
        });
    }

    /// Populate `state.git` from the session cwd, once, best-effort.
    async fn resolve_git_info(&self, session: &Arc<Session>) {
        if session.state.read().git.is_some() {
            return;
        }
        let Some(cwd) = session.state.read().cwd.clone() else {
            return;
        };
        let info = tokio::task::spawn_blocking(move || git_info_for(&cwd)).await;
        if let Ok(Some(info)) = info {
            session.state.write().git = Some(info);
        }
    }
}

fn git_info_for(cwd: &str) -> Option<GitInfo> {
    let branch = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(cwd)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())?;
    let dirty = std::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(cwd)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.is_empty());
    Some(GitInfo {
        branch: Some(branch),
        is_dirty: dirty,
        remote_url: None,
    })
}
