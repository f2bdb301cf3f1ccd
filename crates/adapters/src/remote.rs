//! Outbound WebSocket backends: the broker dials a socket the backend
//! listens on (`codex app-server --listen ws://…`), or any remote peer
//! speaking a translated dialect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bc_broker::adapter::{
    BackendAdapter, BackendCapabilities, BackendSession, ChannelBackendSession, ConnectOptions,
    OutboundPayload, SessionEndpoints,
};
use bc_domain::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use crate::rpc::RpcTracker;
use crate::translate::Translator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backoff policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Jittered exponential backoff for the initial dial: a freshly spawned
/// app-server needs a moment before its listener is up.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// `0` means unlimited attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: 8,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (0-indexed), with ~25% deterministic
    /// jitter so simultaneous sessions do not dial in lock-step.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Deterministic "random" fraction in [0, 1); spreads dial storms without
/// pulling in an RNG.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2_654_435_761);
    f64::from(hash) / f64::from(u32::MAX)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// App-server adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds the dial URL for a session (profile-owned for spawned app-servers,
/// fixed for remote peers).
pub type UrlResolver = Box<dyn Fn(&ConnectOptions) -> String + Send + Sync>;

pub struct AppServerAdapter {
    name: String,
    translator: Arc<dyn Translator>,
    capabilities: BackendCapabilities,
    url_for: UrlResolver,
    backoff: ReconnectBackoff,
    rpc_timeout: Duration,
}

impl AppServerAdapter {
    pub fn new(
        name: impl Into<String>,
        translator: Arc<dyn Translator>,
        capabilities: BackendCapabilities,
        url_for: UrlResolver,
    ) -> Self {
        Self {
            name: name.into(),
            translator,
            capabilities,
            url_for,
            backoff: ReconnectBackoff::default(),
            rpc_timeout: Duration::from_millis(30_000),
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    async fn dial(
        &self,
        url: &str,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>
    {
        let mut attempt: u32 = 0;
        loop {
            match tokio_tungstenite::connect_async(url).await {
                Ok((ws, _response)) => return Ok(ws),
                Err(e) => {
                    if self.backoff.should_give_up(attempt) {
                        return Err(Error::Adapter {
                            adapter: self.name.clone(),
                            message: format!("dial {url} failed after {attempt} retries: {e}"),
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    tracing::debug!(
                        adapter = %self.name,
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "backend not accepting yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for AppServerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Arc<dyn BackendSession>> {
        let url = (self.url_for)(&opts);
        let ws = self.dial(&url).await?;
        let (mut sink, mut stream) = ws.split();

        let (session, endpoints) = ChannelBackendSession::pair(true, true);
        let SessionEndpoints {
            inbound,
            mut outbound_rx,
            closed,
        } = endpoints;
        let translator = self.translator.clone();
        let adapter_name = self.name.clone();
        let rpc = Arc::new(RpcTracker::new(self.rpc_timeout));

        // Writer: outbound payloads → WS text frames.
        let writer_closed = closed.clone();
        let writer_translator = translator.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = writer_closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
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
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Reader: WS text frames → inbound stream. Replies to our own RPCs
        // are completed here and never reach the broker.
        let reader_session = session.clone();
        let reader_rpc = rpc.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                match frame {
                    Message::Text(text) => {
                        let native: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::debug!(
                                    adapter = %adapter_name,
                                    error = %e,
                                    "unparseable backend frame"
                                );
                                continue;
                            }
                        };
                        if reader_rpc.complete(&native) {
                            continue;
                        }
                        let Some(msg) = translator.translate_inbound(&native) else {
                            continue;
                        };
                        if !inbound.deliver(msg).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            let failed = reader_rpc.fail_all();
            if failed > 0 {
                tracing::warn!(failed, "failed in-flight rpcs on backend disconnect");
            }
            reader_session.close().await;
        });

        // Protocol handshake: fire the initialize request; the reply (or a
        // timeout) is observed in the background, never blocking connect.
        let (id, envelope, rx) = rpc.prepare(
            "initialize",
            json!({ "clientInfo": { "name": "beamcode", "version": env!("CARGO_PKG_VERSION") } }),
        );
        if session.send_raw(&envelope.to_string()).is_ok() {
            let handshake_rpc = rpc.clone();
            let handshake_name = self.name.clone();
            tokio::spawn(async move {
                match handshake_rpc.wait(id, rx).await {
                    Ok(_) => tracing::debug!(adapter = %handshake_name, "initialize acknowledged"),
                    Err(e) => tracing::debug!(adapter = %handshake_name, error = %e, "initialize unanswered"),
                }
            });
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = ReconnectBackoff::default();
        let d0 = policy.delay_for_attempt(0);
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);

        let capped = ReconnectBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
            max_attempts: 0,
        };
        // max_delay + 25% jitter ceiling.
        assert!(capped.delay_for_attempt(10) <= Duration::from_millis(37_500));
    }

    #[test]
    fn give_up_policy() {
        let policy = ReconnectBackoff {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!policy.should_give_up(2));
        assert!(policy.should_give_up(3));

        let unlimited = ReconnectBackoff {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!unlimited.should_give_up(1_000_000));
    }

    #[tokio::test]
    async fn dial_gives_up_against_dead_endpoint() {
        let adapter = AppServerAdapter::new(
            "codex",
            Arc::new(crate::translate::CarrierTranslator),
            BackendCapabilities::default(),
            Box::new(|_| "ws://127.0.0.1:1/".to_string()),
        )
        .with_backoff(ReconnectBackoff {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 1.0,
            max_attempts: 2,
        });
        let result = adapter
            .connect(ConnectOptions {
                session_id: uuid::Uuid::new_v4(),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
    }
}
