//! REST surface for session lifecycle.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub adapter: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub adapter: String,
    pub state: bc_protocol::LaunchState,
    pub pid: Option<u32>,
    pub name: String,
    pub archived: bool,
    pub cwd: Option<String>,
    pub consumer_count: usize,
    pub backend_connected: bool,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<SessionSummary> = state
        .manager
        .launcher()
        .list_sessions()
        .into_iter()
        .map(|record| {
            let live = state.manager.bridge().session(&record.session_id);
            SessionSummary {
                session_id: record.session_id,
                adapter: record.adapter_name,
                state: record.state,
                pid: record.pid,
                name: record.name,
                archived: record.archived,
                cwd: record.cwd,
                consumer_count: live.as_ref().map(|s| s.consumer_count()).unwrap_or(0),
                backend_connected: live.map(|s| s.has_backend()).unwrap_or(false),
            }
        })
        .collect();
    Json(json!({ "sessions": summaries }))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let outcome = state
        .manager
        .create_session(&req.adapter, req.cwd, req.name)
        .await;
    if outcome.ok {
        (
            StatusCode::CREATED,
            Json(json!({
                "session_id": outcome.session_id,
                "message": outcome.message,
            })),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": outcome.message })),
        )
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid session id" })),
        );
    };
    match state.manager.bridge().session(&id) {
        Some(session) => (
            StatusCode::OK,
            Json(json!({ "session": session.state_snapshot() })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        ),
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid session id" })),
        );
    };
    let outcome = state.manager.delete_session(&id).await;
    (
        StatusCode::OK,
        Json(json!({ "ok": outcome.ok, "message": outcome.message })),
    )
}
