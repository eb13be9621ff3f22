//! In-flight request correlation
//!
//! Each adapter owns one [`PendingRequests`] map keyed by its own
//! monotonically increasing request ids. An entry resolves, rejects or times
//! out exactly once: completion removes the entry and the oneshot channel
//! consumes itself, so a late duplicate reply cannot fire twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{oneshot, Mutex};

use super::TransportError;
use crate::protocol::JsonRpcResponse;

type Waiter = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicI64,
    inflight: Mutex<HashMap<i64, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            // ids start at 1; 0 stays free for frames with no usable id
            next_id: AtomicI64::new(1),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next adapter-local request id. Never reused for the
    /// lifetime of the adapter instance.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a waiter for `id` and hand back the receiving end.
    pub async fn register(
        &self,
        id: i64,
    ) -> oneshot::Receiver<Result<JsonRpcResponse, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().await.insert(id, tx);
        rx
    }

    /// Resolve the waiter for `id` with a correlated response. Returns false
    /// when no entry exists, which includes the already-completed case.
    pub async fn complete(&self, id: i64, response: JsonRpcResponse) -> bool {
        match self.inflight.lock().await.remove(&id) {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Reject the waiter for `id` with an error.
    pub async fn fail(&self, id: i64, error: TransportError) -> bool {
        match self.inflight.lock().await.remove(&id) {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id` without an answer. Used on timeout, where the
    /// caller has already stopped listening.
    pub async fn discard(&self, id: i64) {
        self.inflight.lock().await.remove(&id);
    }

    /// Reject every outstanding request, leaving the map empty. Called on
    /// disconnect and process exit.
    pub async fn fail_all(&self, make_error: impl Fn() -> TransportError) {
        let waiters: Vec<Waiter> = {
            let mut inflight = self.inflight.lock().await;
            inflight.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub async fn len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
