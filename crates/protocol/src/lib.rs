//! Broker protocol types: the uniform internal message envelope, the consumer
//! WebSocket frame schema, user-visible session state, and persisted records.
//!
//! Everything here is protocol-agnostic — per-backend wire formats live behind
//! the translator seam in the adapter crates.

pub mod consumer;
pub mod records;
pub mod state;
pub mod unified;

pub use consumer::{
    InboundFrame, OutboundFrame, CLOSE_AUTH_FAILED, CLOSE_MESSAGE_TOO_BIG,
    CLOSE_SESSION_NOT_FOUND,
};
pub use records::{LaunchState, LauncherRecord, PermissionRecord, PersistedSession};
pub use state::{
    CapabilitiesSnapshot, CircuitSnapshot, ConsumerIdentity, ConsumerRole, GitInfo,
    PermissionBehavior, PermissionMode, SessionState, SessionStatus, UsageTotals,
};
pub use unified::{ContentBlock, MessageKind, Role, UnifiedMessage};
