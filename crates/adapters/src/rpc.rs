//! JSON-RPC request/response tracking for backends that speak request/reply
//! over the translated stream.
//!
//! State lives here, on the session-handle side — translators stay pure. Each
//! outstanding request is a oneshot keyed by its numeric id; a reply wakes
//! the waiter, a timeout clears the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bc_domain::{Error, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub struct RpcTracker {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    timeout: Duration,
}

impl RpcTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Build a request envelope and register its pending slot. The caller
    /// puts the envelope on the wire, then awaits [`RpcTracker::wait`].
    pub fn prepare(&self, method: &str, params: Value) -> (i64, Value, oneshot::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, envelope, rx)
    }

    /// Await the reply for `id`. On timeout the pending entry is cleared and
    /// a timeout error returned.
    pub async fn wait(&self, id: i64, rx: oneshot::Receiver<Value>) -> Result<Value> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(Error::BackendClosed)
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "rpc {id} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Feed an inbound frame. Returns `true` when it was the reply to a
    /// pending request (and should not be delivered downstream).
    pub fn complete(&self, native: &Value) -> bool {
        let Some(id) = native.get("id").and_then(Value::as_i64) else {
            return false;
        };
        // Requests from the backend carry a method; only bare replies match.
        if native.get("method").is_some() {
            return false;
        }
        let Some(tx) = self.pending.lock().remove(&id) else {
            return false;
        };
        let payload = native
            .get("result")
            .or_else(|| native.get("error"))
            .cloned()
            .unwrap_or(Value::Null);
        let _ = tx.send(payload);
        true
    }

    /// Fail everything outstanding (backend went away).
    pub fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
