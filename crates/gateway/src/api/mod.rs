use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod sessions;
pub mod ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/v1/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/v1/sessions/:id/ws", get(ws::consumer_ws))
        .route("/v1/sessions/:id/backend", get(ws::backend_ws))
        .route("/v1/health", get(sessions::health))
        .with_state(state)
}
