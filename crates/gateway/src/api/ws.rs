//! WebSocket endpoints.
//!
//! Flow for consumers:
//! 1. Client connects to `/v1/sessions/:id/ws?token=<pre-shared-token>`
//! 2. The broker sends `identity`, `session_init`, history, and pushes
//!    events; inbound frames are validated and routed per session
//!
//! `/v1/sessions/:id/backend` is the inverted endpoint a spawned CLI dials
//! into; the accepted socket is handed to the session's adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bc_broker::adapter::BackendWire;
use bc_broker::gate::AuthContext;
use bc_broker::{ConsumerSink, SinkId};
use bc_domain::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_sink_id() -> SinkId {
    NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Pre-shared token (`BEAMCODE_TOKEN`). Absent env → open access.
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SinkCommand {
    Text(String),
    Close(u16, String),
}

/// Bridges the broker's abstract consumer sink onto the socket's writer task.
struct AxumSink {
    id: SinkId,
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl ConsumerSink for AxumSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn send_text(&self, json: &str) -> Result<()> {
        self.tx
            .send(SinkCommand::Text(json.to_owned()))
            .map_err(|_| Error::Transport("consumer socket writer gone".into()))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SinkCommand::Close(code, reason.to_owned()));
    }
}

pub async fn consumer_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Ok(expected) = std::env::var("BEAMCODE_TOKEN") {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, &expected) {
            return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
        }
    }
    let Ok(session_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "invalid session id").into_response();
    };
    ws.on_upgrade(move |socket| handle_consumer_socket(socket, state, session_id))
        .into_response()
}

async fn handle_consumer_socket(socket: WebSocket, state: AppState, session_id: Uuid) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SinkCommand>();
    let sink_id = next_sink_id();
    let sink: Arc<dyn ConsumerSink> = Arc::new(AxumSink { id: sink_id, tx });

    // Writer task: forwards broker frames to the socket; a close command
    // terminates the connection with the given code.
    let writer = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SinkCommand::Text(json) => {
                    if ws_sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                SinkCommand::Close(code, reason) => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let bridge = state.manager.bridge().clone();
    bridge
        .handle_consumer_open(
            sink,
            AuthContext {
                session_id,
                token: None,
                remote_addr: None,
            },
        )
        .await;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                bridge
                    .handle_consumer_message(session_id, sink_id, &text)
                    .await;
            }
            Message::Close(_) => break,
            // axum answers WS-level pings automatically.
            _ => {}
        }
    }

    bridge.handle_consumer_close(session_id, sink_id);
    writer.abort();
    tracing::debug!(session_id = %session_id, sink_id, "consumer socket closed");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inverted backend endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn backend_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(session_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "invalid session id").into_response();
    };
    ws.on_upgrade(move |socket| handle_backend_socket(socket, state, session_id))
        .into_response()
}

async fn handle_backend_socket(socket: WebSocket, state: AppState, session_id: Uuid) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (to_cli_tx, mut to_cli_rx) = mpsc::channel::<String>(64);
    let (from_cli_tx, from_cli_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(text) = to_cli_rx.recv().await {
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    let accepted = state
        .manager
        .on_connection(
            session_id,
            BackendWire {
                tx: to_cli_tx,
                rx: from_cli_rx,
            },
        )
        .await;
    if !accepted {
        tracing::warn!(session_id = %session_id, "backend socket rejected");
        writer.abort();
        return;
    }

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if from_cli_tx.send(text).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    tracing::info!(session_id = %session_id, "backend socket closed");
}
