//! Per-backend launch profiles: the single source of truth for each
//! backend's CLI surface. `build_spawn_args` is pure so it can be tested
//! without spawning anything.

use bc_broker::launcher::{BackendProfile, LaunchMode};
use bc_broker::supervisor::SpawnSpec;
use bc_domain::config::AdapterConfig;
use bc_protocol::LauncherRecord;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// claude (sdk-url, CLI dials into the broker)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClaudeProfile {
    config: AdapterConfig,
    /// Base of the broker's backend WebSocket endpoint, e.g.
    /// `ws://127.0.0.1:3920/v1/sessions`.
    sdk_url_base: String,
}

impl ClaudeProfile {
    pub fn new(config: AdapterConfig, sdk_url_base: impl Into<String>) -> Self {
        Self {
            config,
            sdk_url_base: sdk_url_base.into(),
        }
    }
}

impl BackendProfile for ClaudeProfile {
    fn adapter_name(&self) -> &str {
        "claude"
    }

    fn launch_mode(&self) -> LaunchMode {
        LaunchMode::Forward
    }

    fn build_spawn_args(&self, record: &LauncherRecord) -> SpawnSpec {
        let binary = self.config.binary.clone().unwrap_or_else(|| "claude".into());
        let mut spec = SpawnSpec::new(binary);
        spec.args = vec![
            "--sdk-url".into(),
            format!("{}/{}/backend", self.sdk_url_base, record.session_id),
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
        ];
        if let Some(resume) = &record.backend_session_id {
            spec.args.push("--resume".into());
            spec.args.push(resume.clone());
        }
        spec.args.extend(self.config.extra_args.iter().cloned());
        spec.cwd = record
            .cwd
            .clone()
            .map(Into::into)
            .or_else(|| self.config.default_cwd.clone());
        spec
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// codex (app-server, broker dials out)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CodexProfile {
    config: AdapterConfig,
}

impl CodexProfile {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn base_port(&self) -> u16 {
        self.config.listen_port.unwrap_or(4500)
    }
}

/// Deterministic per-session listener port inside a 1000-port band above the
/// configured base, so concurrent sessions do not collide.
pub fn port_for_session(base: u16, session_id: &Uuid) -> u16 {
    let bytes = session_id.as_bytes();
    let offset = u16::from(bytes[0]) << 8 | u16::from(bytes[1]);
    base.saturating_add(offset % 1000)
}

impl BackendProfile for CodexProfile {
    fn adapter_name(&self) -> &str {
        "codex"
    }

    fn launch_mode(&self) -> LaunchMode {
        LaunchMode::Forward
    }

    fn build_spawn_args(&self, record: &LauncherRecord) -> SpawnSpec {
        let binary = self.config.binary.clone().unwrap_or_else(|| "codex".into());
        let port = port_for_session(self.base_port(), &record.session_id);
        let mut spec = SpawnSpec::new(binary);
        spec.args = vec![
            "app-server".into(),
            "--listen".into(),
            format!("ws://127.0.0.1:{port}"),
        ];
        spec.args.extend(self.config.extra_args.iter().cloned());
        spec.cwd = record
            .cwd
            .clone()
            .map(Into::into)
            .or_else(|| self.config.default_cwd.clone());
        spec
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// gemini (ACP over stdio)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GeminiProfile {
    config: AdapterConfig,
}

impl GeminiProfile {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }
}

impl BackendProfile for GeminiProfile {
    fn adapter_name(&self) -> &str {
        "gemini"
    }

    fn launch_mode(&self) -> LaunchMode {
        LaunchMode::Forward
    }

    fn build_spawn_args(&self, record: &LauncherRecord) -> SpawnSpec {
        let binary = self.config.binary.clone().unwrap_or_else(|| "gemini".into());
        let mut spec = SpawnSpec::new(binary);
        spec.args = vec!["--experimental-acp".into()];
        spec.args.extend(self.config.extra_args.iter().cloned());
        spec.cwd = record
            .cwd
            .clone()
            .map(Into::into)
            .or_else(|| self.config.default_cwd.clone());
        spec
    }
}
