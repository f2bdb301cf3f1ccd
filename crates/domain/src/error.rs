/// Shared error type used across all beamcode crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("backend session closed")]
    BackendClosed,

    #[error("backend does not accept raw payloads")]
    UnsupportedRaw,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("adapter {adapter}: {message}")]
    Adapter { adapter: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
