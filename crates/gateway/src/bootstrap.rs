//! Assembles the broker stack: supervisor, launcher profiles, adapters,
//! gate, bridge, and the session manager.

use std::sync::Arc;

use bc_adapters::{
    AppServerAdapter, CarrierTranslator, ClaudeProfile, CodexProfile, GeminiProfile,
    SdkUrlAdapter, StdioAdapter,
};
use bc_broker::adapter::{Availability, BackendCapabilities};
use bc_broker::{
    AdapterResolver, ConsumerGate, EventBus, FileStore, ProcessSupervisor, SessionBridge,
    SessionLauncher, SessionManager, SessionStore,
};
use bc_domain::{Config, Result, Tracer};

pub fn build_manager(config: Arc<Config>) -> Result<Arc<SessionManager>> {
    let tracer = Tracer::from_env();
    let files = FileStore::open(
        &config.storage.state_path,
        config.storage.save_debounce_ms,
        tracer,
    )?;

    let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone(), tracer));
    let launcher = Arc::new(SessionLauncher::new(supervisor.clone(), files.clone()));
    let resolver = Arc::new(AdapterResolver::new());
    register_backends(&config, &supervisor, &launcher, &resolver);

    let events = EventBus::default();
    // No external authenticator wired in: sockets get anonymous identities.
    let gate = Arc::new(ConsumerGate::new(
        None,
        config.broker.rate_limit_capacity,
        config.broker.rate_limit_window_ms,
    ));
    let bridge = SessionBridge::new(
        Arc::new(SessionStore::new()),
        gate,
        resolver.clone(),
        files.clone(),
        events.clone(),
        config.broker.clone(),
        tracer,
    );

    Ok(SessionManager::new(
        config, bridge, launcher, resolver, events, files,
    ))
}

fn register_backends(
    config: &Config,
    supervisor: &Arc<ProcessSupervisor>,
    launcher: &Arc<SessionLauncher>,
    resolver: &Arc<AdapterResolver>,
) {
    let translator = Arc::new(CarrierTranslator);
    let adapter_config = |name: &str| config.adapters.get(name).cloned().unwrap_or_default();

    // claude: spawned CLI that dials back into our WebSocket server.
    let sdk_url_base = format!(
        "ws://{}:{}/v1/sessions",
        config.server.host, config.server.port
    );
    launcher.register_profile(Arc::new(ClaudeProfile::new(
        adapter_config("claude"),
        sdk_url_base,
    )));
    resolver.register(Arc::new(SdkUrlAdapter::new(
        "claude",
        translator.clone(),
        BackendCapabilities {
            availability: Availability::Local,
            ..Default::default()
        },
    )));

    // codex: spawned app-server the broker dials out to.
    let rpc_timeout = std::time::Duration::from_millis(config.broker.rpc_timeout_ms);
    let codex_config = adapter_config("codex");
    let codex_base_port = codex_config.listen_port.unwrap_or(4500);
    launcher.register_profile(Arc::new(CodexProfile::new(codex_config)));
    resolver.register(Arc::new(
        AppServerAdapter::new(
            "codex",
            translator.clone(),
            BackendCapabilities {
                availability: Availability::Local,
                ..Default::default()
            },
            Box::new(move |opts| {
                let port =
                    bc_adapters::profiles::port_for_session(codex_base_port, &opts.session_id);
                format!("ws://127.0.0.1:{port}")
            }),
        )
        .with_rpc_timeout(rpc_timeout),
    ));

    // gemini: ACP subprocess over stdio.
    launcher.register_profile(Arc::new(GeminiProfile::new(adapter_config("gemini"))));
    resolver.register(Arc::new(StdioAdapter::new(
        "gemini",
        supervisor.clone(),
        translator.clone(),
        BackendCapabilities {
            availability: Availability::Local,
            teams: false,
            ..Default::default()
        },
    )));

    // remote: an already-running WebSocket peer (no process supervision).
    if let Some(url) = config.adapters.get("remote").and_then(|r| r.url.clone()) {
        resolver.register(Arc::new(
            AppServerAdapter::new(
                "remote",
                translator,
                BackendCapabilities {
                    availability: Availability::Remote,
                    ..Default::default()
                },
                Box::new(move |_| url.clone()),
            )
            .with_rpc_timeout(rpc_timeout),
        ));
    }
}
