//! Shared helpers for in-crate tests: recording consumer sinks and a mock
//! backend adapter driven directly through its channel endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bc_domain::config::BrokerConfig;
use bc_domain::{Error, Result, Tracer};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::{
    AdapterResolver, BackendAdapter, BackendCapabilities, BackendSession, ChannelBackendSession,
    ConnectOptions, SessionEndpoints,
};
use crate::bridge::SessionBridge;
use crate::broadcast::{ConsumerSink, SinkId};
use crate::events::EventBus;
use crate::gate::ConsumerGate;
use crate::persist::FileStore;
use crate::store::SessionStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecordingSink {
    id: SinkId,
    frames: Mutex<Vec<Value>>,
    closed: Mutex<Option<(u16, String)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new(id: SinkId) -> Arc<Self> {
        Arc::new(Self {
            id,
            frames: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            fail: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().clone()
    }

    pub fn frame_types(&self) -> Vec<String> {
        self.frames()
            .iter()
            .filter_map(|f| f.get("type").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }

    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }

    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::Relaxed);
    }
}

impl ConsumerSink for RecordingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn send_text(&self, json: &str) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::Transport("sink unavailable".into()));
        }
        let value: Value = serde_json::from_str(json)?;
        self.frames.lock().push(value);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some((code, reason.to_owned()));
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Backend adapter whose sessions are plain channel pairs the test drives.
pub struct MockAdapter {
    endpoints: Mutex<HashMap<Uuid, SessionEndpoints>>,
    fail_connect: AtomicBool,
    pub connect_count: Mutex<u32>,
    pub connect_delay: Mutex<Option<std::time::Duration>>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            connect_count: Mutex::new(0),
            connect_delay: Mutex::new(None),
        })
    }

    /// Claim the backend-facing endpoints of a connected session.
    pub fn take_endpoints(&self, session_id: &Uuid) -> Option<SessionEndpoints> {
        self.endpoints.lock().remove(session_id)
    }

    pub fn fail_next_connects(&self) {
        self.fail_connect.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        *self.connect_count.lock() += 1;
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::Adapter {
                adapter: "mock".into(),
                message: "connect refused".into(),
            });
        }
        let (session, endpoints) = ChannelBackendSession::pair(true, true);
        self.endpoints.lock().insert(opts.session_id, endpoints);
        Ok(session)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BridgeHarness {
    pub bridge: Arc<SessionBridge>,
    pub adapter: Arc<MockAdapter>,
    pub events: EventBus,
    _dir: tempfile::TempDir,
}

pub fn harness() -> BridgeHarness {
    harness_with_config(BrokerConfig::default())
}

pub fn harness_with_config(config: BrokerConfig) -> BridgeHarness {
    let dir = tempfile::tempdir().unwrap();
    let files = FileStore::open(dir.path(), 10, Tracer::disabled()).unwrap();
    let adapter = MockAdapter::new();
    let resolver = Arc::new(AdapterResolver::new());
    resolver.register(adapter.clone());
    let events = EventBus::default();
    let gate = Arc::new(ConsumerGate::new(
        None,
        config.rate_limit_capacity,
        config.rate_limit_window_ms,
    ));
    let bridge = SessionBridge::new(
        Arc::new(SessionStore::new()),
        gate,
        resolver,
        files,
        events.clone(),
        config,
        Tracer::disabled(),
    );
    BridgeHarness {
        bridge,
        adapter,
        events,
        _dir: dir,
    }
}

/// Create a session wired to the mock adapter, without connecting.
pub fn mock_session(harness: &BridgeHarness) -> Arc<crate::store::Session> {
    let session = harness.bridge.get_or_create(Uuid::new_v4());
    *session.adapter_name.lock() = Some("mock".into());
    session
}
