//! The beamcode session broker core.
//!
//! Sits between many concurrent WebSocket consumers and one backend per
//! session. Owns the session registry, the consumer/backend fan-in/fan-out,
//! backend lifecycle, process supervision, slash commands, the permission
//! state machine, and the durable session store.

pub mod adapter;
pub mod breaker;
pub mod bridge;
pub mod broadcast;
pub mod commands;
pub mod events;
pub mod gate;
pub mod launcher;
pub mod lifecycle;
pub mod manager;
pub mod permissions;
pub mod persist;
pub mod store;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use adapter::{
    AdapterResolver, Availability, BackendAdapter, BackendCapabilities, BackendSession,
    BackendWire, ChannelBackendSession, ConnectOptions, InvertedConnectionAdapter,
};
pub use breaker::CircuitBreaker;
pub use bridge::SessionBridge;
pub use broadcast::{ConsumerSink, SinkId};
pub use events::{BrokerEvent, EventBus};
pub use gate::{AuthContext, AuthResult, Authenticator, ConsumerGate};
pub use launcher::{BackendProfile, LaunchMode, LaunchOptions, SessionLauncher};
pub use manager::{OperationOutcome, SessionManager};
pub use persist::FileStore;
pub use store::{Session, SessionStore};
pub use supervisor::{ProcessHandle, ProcessSupervisor, SpawnSpec};
