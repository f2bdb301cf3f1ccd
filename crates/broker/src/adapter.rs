//! Backend adapter and backend session seams.
//!
//! An adapter is a factory: given connect options it yields a session handle
//! carrying a bidirectional stream of [`UnifiedMessage`]s. The broker core
//! only ever talks to these traits; per-backend wire formats live behind
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bc_domain::{Error, Result};
use bc_protocol::{MessageKind, UnifiedMessage};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities & options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Local,
    Remote,
}

/// What a backend advertises about itself.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    pub availability: Availability,
    pub teams: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub session_id: Uuid,
    pub cwd: Option<String>,
    /// The backend's own session id when resuming a prior conversation.
    pub resume: Option<String>,
    pub adapter_options: Map<String, Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decides whether a backend user-echo was consumed by a pending passthrough
/// slash command. Returns `true` when consumed.
pub type PassthroughHandler = Box<dyn Fn(&UnifiedMessage) -> bool + Send + Sync>;

/// A live bidirectional session with one backend.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Non-blocking enqueue toward the backend. Errors once closed.
    fn send(&self, msg: UnifiedMessage) -> Result<()>;

    /// Send a pre-serialized native payload. Backends that only accept
    /// translated messages return [`Error::UnsupportedRaw`].
    fn send_raw(&self, _text: &str) -> Result<()> {
        Err(Error::UnsupportedRaw)
    }

    /// The inbound stream. Single-subscriber: only the first call yields the
    /// receiver; it terminates when the backend ends.
    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>>;

    /// Install (or clear) the passthrough interceptor. Default: unsupported.
    fn set_passthrough_handler(&self, _handler: Option<PassthroughHandler>) -> bool {
        false
    }

    /// Idempotent. Terminates the stream and releases resources.
    async fn close(&self);
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> BackendCapabilities;
    async fn connect(&self, opts: ConnectOptions) -> Result<Arc<dyn BackendSession>>;

    /// Non-`None` for adapters whose CLI connects into the broker.
    fn as_inverted(&self) -> Option<&dyn InvertedConnectionAdapter> {
        None
    }
}

/// Raw text duplex handed to inverted adapters when their CLI dials in.
pub struct BackendWire {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

/// Adapters whose backend CLI connects *into* the broker (SDK-URL style).
pub trait InvertedConnectionAdapter: BackendAdapter {
    /// Hand the freshly-accepted socket to the adapter. `false` means the
    /// adapter was not expecting it and the caller should close the socket.
    fn deliver_socket(&self, session_id: Uuid, wire: BackendWire) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps adapter names to registered adapters.
#[derive(Default)]
pub struct AdapterResolver {
    adapters: Mutex<HashMap<String, Arc<dyn BackendAdapter>>>,
}

impl AdapterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn BackendAdapter>) {
        let name = adapter.name().to_owned();
        tracing::debug!(adapter = %name, "adapter registered");
        self.adapters.lock().insert(name, adapter);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel-backed session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound payloads toward the backend pump.
#[derive(Debug)]
pub enum OutboundPayload {
    Unified(UnifiedMessage),
    Raw(String),
}

/// The far side of a [`ChannelBackendSession`], owned by the adapter's pump
/// tasks (or by tests acting as the backend).
pub struct SessionEndpoints {
    /// Feed inbound messages here; the passthrough filter is applied.
    pub inbound: InboundGate,
    /// Drain outbound payloads to put on the wire.
    pub outbound_rx: mpsc::UnboundedReceiver<OutboundPayload>,
    /// Cancelled when the session closes.
    pub closed: CancellationToken,
}

/// Applies the installed passthrough handler before forwarding inbound
/// messages to the broker's consume loop.
#[derive(Clone)]
pub struct InboundGate {
    tx: mpsc::Sender<UnifiedMessage>,
    handler: Arc<Mutex<Option<PassthroughHandler>>>,
}

impl InboundGate {
    /// Forward a message unless a passthrough handler consumes it.
    /// Returns `false` once the broker side is gone.
    pub async fn deliver(&self, msg: UnifiedMessage) -> bool {
        if msg.kind == MessageKind::UserMessage {
            let consumed = {
                let handler = self.handler.lock();
                handler.as_ref().map(|h| h(&msg)).unwrap_or(false)
            };
            if consumed {
                return true;
            }
        }
        self.tx.send(msg).await.is_ok()
    }
}

/// Shared concrete session used by every adapter in-tree: an unbounded
/// outbound queue (send never blocks) and a bounded inbound stream.
pub struct ChannelBackendSession {
    outbound: mpsc::UnboundedSender<OutboundPayload>,
    inbound_rx: Mutex<Option<mpsc::Receiver<UnifiedMessage>>>,
    handler: Arc<Mutex<Option<PassthroughHandler>>>,
    closed: CancellationToken,
    supports_raw: bool,
    supports_passthrough: bool,
    close_flag: AtomicBool,
}

impl ChannelBackendSession {
    /// Build a session plus its backend-facing endpoints.
    pub fn pair(supports_raw: bool, supports_passthrough: bool) -> (Arc<Self>, SessionEndpoints) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let handler: Arc<Mutex<Option<PassthroughHandler>>> = Arc::new(Mutex::new(None));
        let closed = CancellationToken::new();

        let session = Arc::new(Self {
            outbound: outbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            handler: handler.clone(),
            closed: closed.clone(),
            supports_raw,
            supports_passthrough,
            close_flag: AtomicBool::new(false),
        });
        let endpoints = SessionEndpoints {
            inbound: InboundGate {
                tx: inbound_tx,
                handler,
            },
            outbound_rx,
            closed,
        };
        (session, endpoints)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.close_flag.load(Ordering::Acquire) {
            Err(Error::BackendClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackendSession for ChannelBackendSession {
    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        self.ensure_open()?;
        self.outbound
            .send(OutboundPayload::Unified(msg))
            .map_err(|_| Error::BackendClosed)
    }

    fn send_raw(&self, text: &str) -> Result<()> {
        if !self.supports_raw {
            return Err(Error::UnsupportedRaw);
        }
        self.ensure_open()?;
        self.outbound
            .send(OutboundPayload::Raw(text.to_owned()))
            .map_err(|_| Error::BackendClosed)
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<UnifiedMessage>> {
        self.inbound_rx.lock().take()
    }

    fn set_passthrough_handler(&self, handler: Option<PassthroughHandler>) -> bool {
        if !self.supports_passthrough {
            return false;
        }
        *self.handler.lock() = handler;
        true
    }

    async fn close(&self) {
        if !self.close_flag.swap(true, Ordering::AcqRel) {
            self.closed.cancel();
        }
    }
}
