//! Fan-out to consumer sockets.
//!
//! Each frame is serialized once and pushed to every seat; a failing socket
//! is logged and never affects its siblings.

use std::sync::Arc;

use bc_domain::Result;
use bc_protocol::OutboundFrame;

use crate::store::Session;

/// Stable identifier of a consumer socket for the session maps.
pub type SinkId = u64;

/// Abstract consumer socket. The WebSocket server adapter implements this
/// over its writer task; tests implement it with a recording buffer.
pub trait ConsumerSink: Send + Sync {
    fn id(&self) -> SinkId;
    /// Non-blocking enqueue of a serialized frame.
    fn send_text(&self, json: &str) -> Result<()>;
    /// Close the socket with the given code. Idempotent.
    fn close(&self, code: u16, reason: &str);
}

/// Send a frame to a single sink.
pub fn send_to(sink: &Arc<dyn ConsumerSink>, frame: &OutboundFrame) {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound frame");
            return;
        }
    };
    if let Err(e) = sink.send_text(&json) {
        tracing::warn!(sink_id = sink.id(), error = %e, "consumer send failed");
    }
}

/// Fan a frame out to every consumer of the session.
pub fn broadcast(session: &Session, frame: &OutboundFrame) {
    fan_out(session, frame, false);
}

/// Fan a frame out to participants only (permission traffic).
pub fn broadcast_to_participants(session: &Session, frame: &OutboundFrame) {
    fan_out(session, frame, true);
}

fn fan_out(session: &Session, frame: &OutboundFrame, participants_only: bool) {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound frame");
            return;
        }
    };
    let consumers = session.consumers.read();
    for seat in consumers.values() {
        if participants_only && !seat.identity.is_participant() {
            continue;
        }
        if let Err(e) = seat.sink.send_text(&json) {
            // Transport errors are per-socket; the close handler will reap.
            tracing::warn!(
                session_id = %session.id,
                sink_id = seat.sink.id(),
                error = %e,
                "consumer send failed"
            );
        }
    }
}
