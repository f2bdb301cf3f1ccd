//! Inverted-connection adapter: the backend CLI dials into the broker
//! (`claude --sdk-url ws://…/sessions/<id>/backend`).
//!
//! `connect` parks the session's channel endpoints until the WebSocket
//! server hands over the accepted socket via `deliver_socket`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bc_broker::adapter::{
    BackendAdapter, BackendCapabilities, BackendSession, BackendWire, ChannelBackendSession,
    ConnectOptions, InvertedConnectionAdapter, OutboundPayload, SessionEndpoints,
};
use bc_domain::Result;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::translate::Translator;

pub struct SdkUrlAdapter {
    name: String,
    translator: Arc<dyn Translator>,
    capabilities: BackendCapabilities,
    /// Sessions connected but still waiting for their CLI to dial in.
    parked: Mutex<HashMap<Uuid, SessionEndpoints>>,
}

impl SdkUrlAdapter {
    pub fn new(
        name: impl Into<String>,
        translator: Arc<dyn Translator>,
        capabilities: BackendCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            translator,
            capabilities,
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }
}

#[async_trait]
impl BackendAdapter for SdkUrlAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let (session, endpoints) = ChannelBackendSession::pair(true, true);
        // Replacing a parked slot drops the stale endpoints, which ends the
        // previous pump if one was somehow still alive.
        self.parked.lock().insert(opts.session_id, endpoints);
        Ok(session)
    }

    fn as_inverted(&self) -> Option<&dyn InvertedConnectionAdapter> {
        Some(self)
    }
}

impl InvertedConnectionAdapter for SdkUrlAdapter {
    fn deliver_socket(&self, session_id: Uuid, wire: BackendWire) -> bool {
        let Some(endpoints) = self.parked.lock().remove(&session_id) else {
            tracing::warn!(
                adapter = %self.name,
                session_id = %session_id,
                "socket delivered for a session that is not waiting"
            );
            return false;
        };
        let SessionEndpoints {
            inbound,
            mut outbound_rx,
            closed,
        } = endpoints;
        let BackendWire { tx, mut rx } = wire;
        let translator = self.translator.clone();
        let adapter_name = self.name.clone();

        // Writer: outbound payloads → socket text.
        let writer_closed = closed.clone();
        let writer_translator = translator.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    payload = outbound_rx.recv() => match payload {
                        Some(p) => p,
                        None => break,
                    },
                };
                let text = match payload {
                    OutboundPayload::Raw(text) => Some(text),
                    OutboundPayload::Unified(msg) => writer_translator
                        .translate_outbound(&msg)
                        .map(|v| v.to_string()),
                };
                let Some(text) = text else {
                    continue;
                };
                if tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        // Reader: socket text → inbound stream. Dropping `inbound` at the
        // end terminates the broker's consume loop.
        let reader_closed = closed;
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    text = rx.recv() => match text {
                        Some(t) => t,
                        None => break,
                    },
                };
                let native: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(adapter = %adapter_name, error = %e, "unparseable backend frame");
                        continue;
                    }
                };
                let Some(msg) = translator.translate_inbound(&native) else {
                    continue;
                };
                if !inbound.deliver(msg).await {
                    break;
                }
            }
        });

        true
    }
}
