//! Line-delimited JSON over a supervised child's stdio.
//!
//! Used for backends whose wire is NDJSON (or JSON-RPC lines) on
//! stdin/stdout. The supervisor spawns the child; this adapter claims its
//! pipes and runs one reader and one writer task per session.

use std::sync::Arc;

use async_trait::async_trait;
use bc_broker::adapter::{
    BackendAdapter, BackendCapabilities, BackendSession, ChannelBackendSession, ConnectOptions,
    OutboundPayload,
};
use bc_broker::supervisor::ProcessSupervisor;
use bc_domain::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::translate::Translator;

pub struct StdioAdapter {
    name: String,
    supervisor: Arc<ProcessSupervisor>,
    translator: Arc<dyn Translator>,
    capabilities: BackendCapabilities,
}

impl StdioAdapter {
    pub fn new(
        name: impl Into<String>,
        supervisor: Arc<ProcessSupervisor>,
        translator: Arc<dyn Translator>,
        capabilities: BackendCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            supervisor,
            translator,
            capabilities,
        }
    }
}

#[async_trait]
impl BackendAdapter for StdioAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let handle = self
            .supervisor
            .get(&opts.session_id)
            .ok_or_else(|| Error::Adapter {
                adapter: self.name.clone(),
                message: "no supervised process for session".into(),
            })?;
        let io = handle.take_io().ok_or_else(|| Error::Adapter {
            adapter: self.name.clone(),
            message: "child stdio already claimed".into(),
        })?;

        let (session, endpoints) = ChannelBackendSession::pair(true, true);
        let bc_broker::adapter::SessionEndpoints {
            inbound,
            mut outbound_rx,
            closed,
        } = endpoints;
        let translator = self.translator.clone();
        let adapter_name = self.name.clone();

        // Writer: unified/raw payloads → NDJSON lines on the child's stdin.
        let writer_closed = closed.clone();
        let writer_translator = translator.clone();
        let mut stdin = io.stdin;
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    payload = outbound_rx.recv() => match payload {
                        Some(p) => p,
                        None => break,
                    },
                };
                let line = match payload {
                    OutboundPayload::Raw(text) => Some(text),
                    OutboundPayload::Unified(msg) => writer_translator
                        .translate_outbound(&msg)
                        .map(|v| v.to_string()),
                };
                let Some(line) = line else {
                    continue;
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Reader: NDJSON lines from the child's stdout → inbound stream.
        let reader_session = session.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(io.stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let native: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(adapter = %adapter_name, error = %e, "unparseable backend line");
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
            // Stream end surfaces to the broker as backend disconnect.
            reader_session.close().await;
        });

        Ok(session)
    }
}
