use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-backend adapter settings (key = adapter name: "claude", "codex", ...).
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3920,
            host: "127.0.0.1".into(),
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker behavior
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maximum size of a single consumer WebSocket frame in bytes.
    /// Frames above this close the socket with code 1009.
    #[serde(default = "d_1mb")]
    pub max_consumer_message_size: usize,
    /// Token bucket capacity per consumer socket.
    #[serde(default = "d_100")]
    pub rate_limit_capacity: u32,
    /// Bucket refill window: `rate_limit_capacity` tokens per this many ms.
    #[serde(default = "d_60000")]
    pub rate_limit_window_ms: u64,
    /// Timeout on the backend initialize handshake.
    #[serde(default = "d_10000")]
    pub initialize_timeout_ms: u64,
    /// Sessions with no backend, no consumers, and no activity for this long
    /// are reaped. `0` disables the reaper.
    #[serde(default)]
    pub idle_session_timeout_ms: u64,
    /// Grace period before the watchdog relaunches a session stuck in
    /// `starting`.
    #[serde(default = "d_15000")]
    pub reconnect_grace_period_ms: u64,
    /// Per-RPC timeout for JSON-RPC style request/response backends.
    #[serde(default = "d_30000")]
    pub rpc_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_consumer_message_size: 1024 * 1024,
            rate_limit_capacity: 100,
            rate_limit_window_ms: 60_000,
            initialize_timeout_ms: 10_000,
            idle_session_timeout_ms: 0,
            reconnect_grace_period_ms: 15_000,
            rpc_timeout_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process supervision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// SIGTERM → SIGKILL escalation grace.
    #[serde(default = "d_5000")]
    pub kill_grace_period_ms: u64,
    /// A child exiting non-zero within this window after spawn counts as a
    /// spawn failure for the circuit breaker.
    #[serde(default = "d_2000")]
    pub spawn_probation_ms: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_grace_period_ms: 5_000,
            spawn_probation_ms: 2_000,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Sliding-window circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "d_5u32")]
    pub failure_threshold: u32,
    #[serde(default = "d_60000")]
    pub window_ms: u64,
    #[serde(default = "d_30000")]
    pub recovery_time_ms: u64,
    #[serde(default = "d_2u32")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            recovery_time_ms: 30_000,
            success_threshold: 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `<uuid>.json` session files and `launcher.json`.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Debounce for coalesced session saves.
    #[serde(default = "d_500")]
    pub save_debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            save_debounce_ms: 500,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdapterConfig {
    /// Binary name or path for forward-launch backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Extra arguments appended to the built spawn command.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Listen port for app-server style backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    /// Fixed endpoint for remote WebSocket peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Default working directory when a session does not specify one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<PathBuf>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    3920
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3920".into(),
        "http://127.0.0.1:3920".into(),
    ]
}
fn d_1mb() -> usize {
    1024 * 1024
}
fn d_100() -> u32 {
    100
}
fn d_500() -> u64 {
    500
}
fn d_2000() -> u64 {
    2_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_15000() -> u64 {
    15_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_60000() -> u64 {
    60_000
}
fn d_2u32() -> u32 {
    2
}
fn d_5u32() -> u32 {
    5
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
