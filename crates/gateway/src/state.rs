use std::sync::Arc;

use bc_broker::SessionManager;
use bc_domain::Config;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
}
