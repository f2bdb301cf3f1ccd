//! In-memory registry of live sessions.
//!
//! The store owns every `Session` record; all mutation goes through the
//! bridge and lifecycle methods. Cross-session access is lookup-only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bc_protocol::{
    ConsumerIdentity, PermissionRecord, PersistedSession, SessionState, UnifiedMessage,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::BackendSession;
use crate::broadcast::{ConsumerSink, SinkId};
use crate::commands::CommandRegistry;
use crate::gate::TokenBucket;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A slash command forwarded to the backend, waiting for its user echo.
#[derive(Debug, Clone)]
pub struct PendingPassthrough {
    pub command: String,
    pub request_id: Option<String>,
}

/// A connected consumer: its sink plus the identity it authenticated as.
pub struct ConsumerSeat {
    pub sink: Arc<dyn ConsumerSink>,
    pub identity: ConsumerIdentity,
}

/// The unit of ownership: one backend, many consumers.
pub struct Session {
    pub id: Uuid,
    pub state: RwLock<SessionState>,
    /// Exclusively owned backend handle, replaced atomically.
    pub backend: RwLock<Option<Arc<dyn BackendSession>>>,
    /// Cancels the backend stream consume loop.
    pub backend_abort: Mutex<Option<CancellationToken>>,
    /// FIFO of messages awaiting a backend connection.
    pub pending_messages: Mutex<VecDeque<UnifiedMessage>>,
    /// Ordered `request_id → record`, replayed to late-joining participants.
    pub pending_permissions: Mutex<Vec<(String, PermissionRecord)>>,
    pub pending_passthroughs: Mutex<VecDeque<PendingPassthrough>>,
    pub consumers: RwLock<HashMap<SinkId, ConsumerSeat>>,
    /// Token buckets, one per live socket.
    pub rate_limiters: Mutex<HashMap<SinkId, TokenBucket>>,
    pub history: RwLock<Vec<UnifiedMessage>>,
    pub last_activity_ms: AtomicI64,
    /// Single-slot pre-connect UX queue, cleared on first backend connect.
    pub queued_message: Mutex<Option<UnifiedMessage>>,
    anonymous_counter: AtomicU64,
    pub commands: Mutex<CommandRegistry>,
    pub archived: AtomicBool,
    /// Whether the backend initialize request was already issued.
    pub initialize_requested: AtomicBool,
    pub first_turn_emitted: AtomicBool,
    /// The first user message, reported with the first-turn event.
    pub first_user_message: Mutex<Option<String>>,
    /// Fixed for the session's lifetime once set.
    pub adapter_name: Mutex<Option<String>>,
    /// The backend's own session id, used to resume after relaunch.
    pub backend_session_id: Mutex<Option<String>>,
    /// Latest auth status reported by the backend.
    pub last_auth_status: Mutex<Option<serde_json::Value>>,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState::for_session(id.to_string())),
            backend: RwLock::new(None),
            backend_abort: Mutex::new(None),
            pending_messages: Mutex::new(VecDeque::new()),
            pending_permissions: Mutex::new(Vec::new()),
            pending_passthroughs: Mutex::new(VecDeque::new()),
            consumers: RwLock::new(HashMap::new()),
            rate_limiters: Mutex::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            queued_message: Mutex::new(None),
            anonymous_counter: AtomicU64::new(0),
            commands: Mutex::new(CommandRegistry::new()),
            archived: AtomicBool::new(false),
            initialize_requested: AtomicBool::new(false),
            first_turn_emitted: AtomicBool::new(false),
            first_user_message: Mutex::new(None),
            adapter_name: Mutex::new(None),
            backend_session_id: Mutex::new(None),
            last_auth_status: Mutex::new(None),
        }
    }

    pub fn adapter_name(&self) -> Option<String> {
        self.adapter_name.lock().clone()
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn next_anonymous(&self) -> u64 {
        self.anonymous_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn has_backend(&self) -> bool {
        self.backend.read().is_some()
    }

    pub fn backend_handle(&self) -> Option<Arc<dyn BackendSession>> {
        self.backend.read().clone()
    }

    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::Relaxed)
    }

    pub fn identity_of(&self, sink: SinkId) -> Option<ConsumerIdentity> {
        self.consumers.read().get(&sink).map(|s| s.identity.clone())
    }

    pub fn identities(&self) -> Vec<ConsumerIdentity> {
        self.consumers
            .read()
            .values()
            .map(|s| s.identity.clone())
            .collect()
    }

    pub fn add_consumer(&self, sink: Arc<dyn ConsumerSink>, identity: ConsumerIdentity) {
        let id = sink.id();
        self.consumers
            .write()
            .insert(id, ConsumerSeat { sink, identity });
    }

    /// Remove the seat and release its rate-limit bucket.
    pub fn remove_consumer(&self, sink: SinkId) -> Option<ConsumerIdentity> {
        self.rate_limiters.lock().remove(&sink);
        self.consumers
            .write()
            .remove(&sink)
            .map(|seat| seat.identity)
    }

    pub fn push_history(&self, msg: UnifiedMessage) {
        self.history.write().push(msg);
    }

    pub fn state_snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn pending_permission(&self, request_id: &str) -> Option<PermissionRecord> {
        self.pending_permissions
            .lock()
            .iter()
            .find(|(id, _)| id == request_id)
            .map(|(_, record)| record.clone())
    }

    /// Insert-or-replace keyed by request id, preserving arrival order.
    pub fn store_permission(&self, record: PermissionRecord) {
        let mut pending = self.pending_permissions.lock();
        if let Some(slot) = pending.iter_mut().find(|(id, _)| *id == record.request_id) {
            slot.1 = record;
        } else {
            pending.push((record.request_id.clone(), record));
        }
    }

    pub fn take_permission(&self, request_id: &str) -> Option<PermissionRecord> {
        let mut pending = self.pending_permissions.lock();
        let idx = pending.iter().position(|(id, _)| id == request_id)?;
        Some(pending.remove(idx).1)
    }

    /// The durable projection of this session.
    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            id: self.id,
            state: self.state_snapshot(),
            message_history: self.history.read().clone(),
            pending_messages: self.pending_messages.lock().iter().cloned().collect(),
            pending_permissions: self.pending_permissions.lock().clone(),
            archived: self.is_archived(),
        }
    }

    /// Restore the durable projection into a fresh record.
    pub fn apply_persisted(&self, persisted: PersistedSession) {
        *self.state.write() = persisted.state;
        *self.history.write() = persisted.message_history;
        *self.pending_messages.lock() = persisted.pending_messages.into();
        *self.pending_permissions.lock() = persisted.pending_permissions;
        self.archived.store(persisted.archived, Ordering::Relaxed);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record with empty state on first touch.
    pub fn get_or_create(&self, id: Uuid) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(&id) {
            return session.clone();
        }
        let mut sessions = self.sessions.write();
        sessions
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!(session_id = %id, "session record created");
                Arc::new(Session::new(id))
            })
            .clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
