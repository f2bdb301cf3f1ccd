//! Consumer gate: authentication, RBAC, and per-socket rate limiting.
//!
//! The gate wraps an optional external [`Authenticator`]. Without one, every
//! socket gets an anonymous participant identity from the session's monotone
//! counter. Rate limits are token buckets keyed by socket, never by session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bc_domain::Result;
use bc_protocol::{ConsumerIdentity, ConsumerRole};
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::SinkId;
use crate::store::Session;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authenticator seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection context handed to the authenticator.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub session_id: Uuid,
    pub token: Option<String>,
    pub remote_addr: Option<String>,
}

/// External identity provider. `Ok(None)` means "reject".
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<Option<ConsumerIdentity>>;
}

#[derive(Debug)]
pub enum AuthResult {
    Granted(ConsumerIdentity),
    Denied(String),
    /// The socket closed (or the session vanished) while auth was in flight.
    Cancelled,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token bucket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Starts full; refills continuously at `capacity / window_ms` tokens per ms.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    pub fn new(capacity: u32, window_ms: u64, now_ms: i64) -> Self {
        let capacity = capacity as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_ms: capacity / window_ms.max(1) as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Admit one message if a token is available.
    pub fn try_take(&mut self, now_ms: i64) -> bool {
        let elapsed = (now_ms - self.last_refill_ms).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill_ms = now_ms;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConsumerGate {
    authenticator: Option<Arc<dyn Authenticator>>,
    rate_capacity: u32,
    rate_window_ms: u64,
    /// Sockets with auth in flight, so a close can cancel.
    pending_auth: Mutex<HashMap<SinkId, CancellationToken>>,
}

impl ConsumerGate {
    pub fn new(
        authenticator: Option<Arc<dyn Authenticator>>,
        rate_capacity: u32,
        rate_window_ms: u64,
    ) -> Self {
        Self {
            authenticator,
            rate_capacity,
            rate_window_ms,
            pending_auth: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_authenticator(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Run the external authenticator without blocking the broker. The socket
    /// is tracked as pending so `cancel_pending_auth` can abort it.
    pub async fn authenticate_async(&self, sink_id: SinkId, ctx: &AuthContext) -> AuthResult {
        let authenticator = match &self.authenticator {
            Some(a) => a.clone(),
            None => return AuthResult::Denied("no authenticator configured".into()),
        };

        let cancel = CancellationToken::new();
        self.pending_auth.lock().insert(sink_id, cancel.clone());

        let outcome = tokio::select! {
            result = authenticator.authenticate(ctx) => match result {
                Ok(Some(identity)) => AuthResult::Granted(identity),
                Ok(None) => AuthResult::Denied("authentication rejected".into()),
                Err(e) => AuthResult::Denied(e.to_string()),
            },
            _ = cancel.cancelled() => AuthResult::Cancelled,
        };

        self.pending_auth.lock().remove(&sink_id);
        outcome
    }

    /// Abort an in-flight authentication (socket closed, session gone).
    pub fn cancel_pending_auth(&self, sink_id: SinkId) {
        if let Some(cancel) = self.pending_auth.lock().remove(&sink_id) {
            cancel.cancel();
        }
    }

    /// RBAC: observers are read-only — every inbound frame kind is a write.
    pub fn authorize(&self, identity: &ConsumerIdentity, kind: &str) -> std::result::Result<(), String> {
        match identity.role {
            ConsumerRole::Participant => Ok(()),
            ConsumerRole::Observer => Err(format!("observers cannot send {kind}")),
        }
    }

    /// Admit or reject one message on the socket's token bucket. A socket
    /// without a bucket gets a fresh full one.
    pub fn check_rate_limit(&self, session: &Session, sink_id: SinkId) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let mut limiters = session.rate_limiters.lock();
        limiters
            .entry(sink_id)
            .or_insert_with(|| TokenBucket::new(self.rate_capacity, self.rate_window_ms, now_ms))
            .try_take(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::Error;
    use std::time::Duration;

    struct SlowAllow;
    #[async_trait]
    impl Authenticator for SlowAllow {
        async fn authenticate(&self, _ctx: &AuthContext) -> Result<Option<ConsumerIdentity>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(ConsumerIdentity::anonymous(1)))
        }
    }

    struct Fixed(Option<ConsumerIdentity>);
    #[async_trait]
    impl Authenticator for Fixed {
        async fn authenticate(&self, _ctx: &AuthContext) -> Result<Option<ConsumerIdentity>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;
    #[async_trait]
    impl Authenticator for Failing {
        async fn authenticate(&self, _ctx: &AuthContext) -> Result<Option<ConsumerIdentity>> {
            Err(Error::Auth("backend identity service down".into()))
        }
    }

    fn gate(auth: Option<Arc<dyn Authenticator>>) -> ConsumerGate {
        ConsumerGate::new(auth, 100, 60_000)
    }

    #[tokio::test]
    async fn granted_identity_passes_through() {
        let identity = ConsumerIdentity::anonymous(7);
        let gate = gate(Some(Arc::new(Fixed(Some(identity.clone())))));
        match gate.authenticate_async(1, &AuthContext::default()).await {
            AuthResult::Granted(id) => assert_eq!(id, identity),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_and_errors_deny() {
        let gate = gate(Some(Arc::new(Fixed(None))));
        assert!(matches!(
            gate.authenticate_async(1, &AuthContext::default()).await,
            AuthResult::Denied(_)
        ));

        let gate = self::gate(Some(Arc::new(Failing)));
        assert!(matches!(
            gate.authenticate_async(1, &AuthContext::default()).await,
            AuthResult::Denied(_)
        ));
    }

    #[tokio::test]
    async fn pending_auth_is_cancellable() {
        let gate = Arc::new(gate(Some(Arc::new(SlowAllow))));
        let g = gate.clone();
        let task = tokio::spawn(async move { g.authenticate_async(9, &AuthContext::default()).await });
        tokio::task::yield_now().await;
        gate.cancel_pending_auth(9);
        assert!(matches!(task.await.unwrap(), AuthResult::Cancelled));
    }

    #[test]
    fn observers_are_read_only() {
        let gate = gate(None);
        let observer = ConsumerIdentity {
            user_id: "o1".into(),
            display_name: "Observer".into(),
            role: ConsumerRole::Observer,
        };
        for kind in [
            "user_message",
            "interrupt",
            "slash_command",
            "permission_response",
            "set_model",
        ] {
            assert!(gate.authorize(&observer, kind).is_err(), "{kind} should be denied");
        }
        let participant = ConsumerIdentity::anonymous(1);
        assert!(gate.authorize(&participant, "user_message").is_ok());
    }

    #[test]
    fn bucket_starts_full_and_exhausts() {
        let mut bucket = TokenBucket::new(3, 60_000, 0);
        assert!(bucket.try_take(0));
        assert!(bucket.try_take(0));
        assert!(bucket.try_take(0));
        assert!(!bucket.try_take(0));
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(100, 60_000, 0);
        for _ in 0..100 {
            assert!(bucket.try_take(0));
        }
        assert!(!bucket.try_take(0));
        // 600 ms refills one token at 100 tokens / 60 s.
        assert!(bucket.try_take(600));
        assert!(!bucket.try_take(600));
    }

    #[test]
    fn rate_limit_is_per_socket() {
        let gate = gate(None);
        let session = Session::new(Uuid::new_v4());
        // Exhaust socket 1 with a tiny synthetic bucket.
        session
            .rate_limiters
            .lock()
            .insert(1, TokenBucket::new(1, 60_000, Utc::now().timestamp_millis()));
        assert!(gate.check_rate_limit(&session, 1));
        assert!(!gate.check_rate_limit(&session, 1));
        // Socket 2 gets a fresh bucket.
        assert!(gate.check_rate_limit(&session, 2));
    }

    #[test]
    fn closed_socket_releases_bucket() {
        let gate = gate(None);
        let session = Session::new(Uuid::new_v4());
        assert!(gate.check_rate_limit(&session, 1));
        assert!(session.rate_limiters.lock().contains_key(&1));
        session.remove_consumer(1);
        assert!(!session.rate_limiters.lock().contains_key(&1));
    }
}
