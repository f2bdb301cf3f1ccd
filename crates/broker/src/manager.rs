//! Top-level session manager: wires launcher and bridge together, runs the
//! reconnect watchdog and the idle reaper, and owns the relaunch dedup.
//!
//! The manager is the only component that observes the event bus; bridge and
//! launcher never hold a pointer back to it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bc_domain::Config;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{AdapterResolver, BackendWire};
use crate::bridge::SessionBridge;
use crate::events::{BrokerEvent, EventBus};
use crate::launcher::{LaunchOptions, SessionLauncher};
use crate::persist::FileStore;

/// Structured result of a top-level operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub ok: bool,
    pub message: String,
    pub session_id: Option<Uuid>,
}

impl OperationOutcome {
    fn ok(message: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            session_id,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            session_id: None,
        }
    }
}

pub struct SessionManager {
    config: Arc<Config>,
    bridge: Arc<SessionBridge>,
    launcher: Arc<SessionLauncher>,
    resolver: Arc<AdapterResolver>,
    events: EventBus,
    files: FileStore,
    /// Sessions with a relaunch in flight (dedup guard).
    relaunching: Mutex<HashSet<Uuid>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        bridge: Arc<SessionBridge>,
        launcher: Arc<SessionLauncher>,
        resolver: Arc<AdapterResolver>,
        events: EventBus,
        files: FileStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bridge,
            launcher,
            resolver,
            events,
            files,
            relaunching: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn bridge(&self) -> &Arc<SessionBridge> {
        &self.bridge
    }

    pub fn launcher(&self) -> &Arc<SessionLauncher> {
        &self.launcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Startup
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Restore persisted state and start the background watchdogs.
    pub fn start(self: &Arc<Self>) {
        self.restore();
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_event_pump());
        tasks.push(self.spawn_reconnect_watchdog());
        if let Some(reaper) = self.spawn_idle_reaper() {
            tasks.push(reaper);
        }
    }

    fn restore(self: &Arc<Self>) {
        self.launcher.restore_from_storage();
        let persisted = self.files.load_all();
        let restored = persisted.len();
        for snapshot in persisted {
            let id = snapshot.id;
            let session = self.bridge.get_or_create(id);
            session.apply_persisted(snapshot);
            if let Some(record) = self.launcher.get_session(&id) {
                *session.adapter_name.lock() = Some(record.adapter_name.clone());
                *session.backend_session_id.lock() = record.backend_session_id.clone();
                if record.cwd.is_some() && session.state.read().cwd.is_none() {
                    session.state.write().cwd = record.cwd;
                }
            }
        }
        if restored > 0 {
            tracing::info!(restored, "sessions restored from storage");
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Top-level operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn create_session(
        self: &Arc<Self>,
        adapter: &str,
        cwd: Option<String>,
        name: Option<String>,
    ) -> OperationOutcome {
        if self.resolver.resolve(adapter).is_none() {
            return OperationOutcome::fail(format!("unknown adapter: {adapter}"));
        }
        let record = match self.launcher.launch(&LaunchOptions {
            adapter: adapter.to_owned(),
            cwd: cwd.clone(),
            name,
        }) {
            Ok(record) => record,
            Err(e) => return OperationOutcome::fail(format!("launch failed: {e}")),
        };

        let session = self.bridge.get_or_create(record.session_id);
        *session.adapter_name.lock() = Some(adapter.to_owned());
        if cwd.is_some() {
            session.state.write().cwd = cwd;
        }
        self.project_breaker_state(&record.session_id);

        // Backend connection proceeds asynchronously; inverted adapters wait
        // for their CLI to dial in instead.
        self.spawn_connect_attempt(record.session_id, adapter);

        OperationOutcome::ok("session created", Some(record.session_id))
    }

    pub async fn close_session(self: &Arc<Self>, id: &Uuid) -> OperationOutcome {
        let existed = self.bridge.close_session(id).await;
        if let Err(e) = self.launcher.kill(id).await {
            tracing::warn!(session_id = %id, error = %e, "kill during close failed");
        }
        if existed {
            OperationOutcome::ok("session closed", Some(*id))
        } else {
            // Idempotent: closing a missing session succeeds quietly.
            OperationOutcome::ok("session was not open", Some(*id))
        }
    }

    pub async fn delete_session(self: &Arc<Self>, id: &Uuid) -> OperationOutcome {
        let outcome = self.close_session(id).await;
        self.launcher.remove_session(id);
        if outcome.ok {
            OperationOutcome::ok("session deleted", Some(*id))
        } else {
            outcome
        }
    }

    /// Shutdown: stop watchdogs, kill children, persist everything.
    pub async fn stop(self: &Arc<Self>) -> OperationOutcome {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for session in self.bridge.store().list() {
            self.bridge
                .disconnect_backend(&session, None, "broker shutting down")
                .await;
            if let Err(e) = self.files.save_sync(&session.to_persisted()) {
                tracing::error!(session_id = %session.id, error = %e, "shutdown save failed");
            }
        }
        self.launcher.kill_all().await;
        self.files.flush_pending();
        tracing::info!("session manager stopped");
        OperationOutcome::ok("stopped", None)
    }

    /// A backend CLI dialed into the broker's WebSocket server for
    /// `session_id`. Returns `false` when the socket should be closed.
    pub async fn on_connection(self: &Arc<Self>, session_id: Uuid, wire: BackendWire) -> bool {
        let Some(session) = self.bridge.session(&session_id) else {
            tracing::warn!(session_id = %session_id, "backend dialed in for unknown session");
            return false;
        };
        let Some(adapter_name) = session.adapter_name() else {
            return false;
        };
        let Some(adapter) = self.resolver.resolve(&adapter_name) else {
            return false;
        };
        if adapter.as_inverted().is_none() {
            tracing::warn!(
                session_id = %session_id,
                adapter = %adapter_name,
                "inbound backend socket for a non-inverted adapter"
            );
            return false;
        }

        if let Err(e) = self.bridge.connect_backend(&session).await {
            tracing::error!(session_id = %session_id, error = %e, "inverted connect failed");
            return false;
        }
        let Some(inverted) = adapter.as_inverted() else {
            return false;
        };
        inverted.deliver_socket(session_id, wire)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Watchdogs & event wiring
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.on_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event pump lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_event(self: &Arc<Self>, event: BrokerEvent) {
        match event {
            BrokerEvent::BackendSessionId {
                session_id,
                backend_session_id,
            } => {
                self.launcher
                    .set_backend_session_id(&session_id, backend_session_id);
            }
            BrokerEvent::BackendConnected { session_id } => {
                self.launcher.mark_connected(&session_id);
            }
            BrokerEvent::BackendRelaunchNeeded { session_id } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.relaunch_deduped(session_id).await;
                });
            }
            _ => {}
        }
    }

    /// At most one relaunch in flight per session; archived sessions are
    /// skipped entirely.
    pub async fn relaunch_deduped(self: &Arc<Self>, session_id: Uuid) {
        match self.launcher.get_session(&session_id) {
            Some(record) if record.archived => return,
            Some(_) => {}
            None => return,
        }
        if !self.relaunching.lock().insert(session_id) {
            return;
        }

        let result = self.do_relaunch(session_id).await;
        self.relaunching.lock().remove(&session_id);
        if let Err(e) = result {
            tracing::error!(session_id = %session_id, error = %e, "relaunch failed");
            // Breaker open: the process cannot come back, destroy the session.
            if matches!(e, bc_domain::Error::CircuitOpen) {
                self.close_session(&session_id).await;
            }
        }
    }

    async fn do_relaunch(self: &Arc<Self>, session_id: Uuid) -> bc_domain::Result<()> {
        let result = self.launcher.relaunch(&session_id).await;
        self.project_breaker_state(&session_id);
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if matches!(e, bc_domain::Error::CircuitOpen) {
                    self.events.emit(BrokerEvent::CircuitOpen { session_id });
                }
                return Err(e);
            }
        };
        let session = self.bridge.get_or_create(session_id);
        *session.adapter_name.lock() = Some(record.adapter_name.clone());
        *session.backend_session_id.lock() = record.backend_session_id.clone();

        // Non-inverted adapters: the broker initiates the connection.
        if let Some(adapter) = self.resolver.resolve(&record.adapter_name) {
            if adapter.as_inverted().is_none() {
                self.bridge.connect_backend(&session).await?;
            }
        }
        Ok(())
    }

    /// Keep the launcher's breaker state visible to consumers.
    fn project_breaker_state(&self, session_id: &Uuid) {
        if let Some(session) = self.bridge.session(session_id) {
            let snapshot = self.launcher.supervisor().breaker().snapshot();
            session.state.write().circuit_breaker = Some(snapshot);
        }
    }

    fn spawn_connect_attempt(self: &Arc<Self>, session_id: Uuid, adapter: &str) {
        let Some(adapter) = self.resolver.resolve(adapter) else {
            return;
        };
        if adapter.as_inverted().is_some() {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let Some(session) = manager.bridge.session(&session_id) else {
                return;
            };
            if let Err(e) = manager.bridge.connect_backend(&session).await {
                tracing::error!(session_id = %session_id, error = %e, "initial backend connect failed");
                manager.events.emit(BrokerEvent::SessionError {
                    session_id,
                    source: "connectBackend",
                    message: e.to_string(),
                });
            }
        });
    }

    /// Sessions stuck in `starting` after the grace period are relaunched.
    fn spawn_reconnect_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let grace = Duration::from_millis(self.config.broker.reconnect_grace_period_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for record in manager.launcher.starting_sessions() {
                tracing::warn!(
                    session_id = %record.session_id,
                    "session still starting after grace period; relaunching"
                );
                manager.relaunch_deduped(record.session_id).await;
            }
        })
    }

    /// Reap sessions with no backend, no consumers, and no recent activity.
    fn spawn_idle_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let timeout_ms = self.config.broker.idle_session_timeout_ms;
        if timeout_ms == 0 {
            return None;
        }
        let manager = self.clone();
        let interval = Duration::from_millis((timeout_ms / 10).max(1000));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                let idle: Vec<Uuid> = manager
                    .bridge
                    .store()
                    .list()
                    .into_iter()
                    .filter(|s| {
                        !s.has_backend()
                            && s.consumer_count() == 0
                            && now - s.last_activity() >= timeout_ms as i64
                    })
                    .map(|s| s.id)
                    .collect();
                for id in idle {
                    tracing::info!(session_id = %id, "reaping idle session");
                    manager.close_session(&id).await;
                }
            }
        }))
    }
}
