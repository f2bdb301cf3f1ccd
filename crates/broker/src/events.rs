//! Typed broker event bus.
//!
//! Components emit named events instead of holding back-pointers to the
//! session manager; the manager (and metrics sinks) subscribe. Emission is
//! fire-and-forget — a bus with no subscribers drops events silently.

use bc_protocol::ConsumerIdentity;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    BackendConnected {
        session_id: Uuid,
    },
    BackendDisconnected {
        session_id: Uuid,
        code: Option<u16>,
        reason: String,
    },
    /// A consumer joined a session whose backend is gone; the manager should
    /// relaunch if the session is not archived.
    BackendRelaunchNeeded {
        session_id: Uuid,
    },
    /// The backend reported its own session id (for resume).
    BackendSessionId {
        session_id: Uuid,
        backend_session_id: String,
    },
    ConsumerConnected {
        session_id: Uuid,
        consumer_count: usize,
    },
    ConsumerDisconnected {
        session_id: Uuid,
        consumer_count: usize,
        identity: Option<ConsumerIdentity>,
    },
    MessageInbound {
        session_id: Uuid,
        kind: &'static str,
    },
    RateLimitExceeded {
        session_id: Uuid,
    },
    FirstTurnCompleted {
        session_id: Uuid,
        first_user_message: Option<String>,
    },
    SessionClosed {
        session_id: Uuid,
    },
    CapabilitiesTimeout {
        session_id: Uuid,
    },
    CircuitOpen {
        session_id: Uuid,
    },
    /// A recoverable error surfaced from inside a session.
    SessionError {
        session_id: Uuid,
        source: &'static str,
        message: String,
    },
}

/// Broadcast bus shared by the bridge, launcher, and manager.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine — events are advisory.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(BrokerEvent::BackendConnected { session_id: id });
        bus.emit(BrokerEvent::SessionClosed { session_id: id });

        match rx.recv().await.unwrap() {
            BrokerEvent::BackendConnected { session_id } => assert_eq!(session_id, id),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            BrokerEvent::SessionClosed { session_id } => assert_eq!(session_id, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(BrokerEvent::RateLimitExceeded {
            session_id: Uuid::new_v4(),
        });
    }
}
