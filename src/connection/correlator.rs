//! Request/response correlation for a single connection: allocates a
//! numeric JSON-RPC id per outgoing call and resolves the matching
//! `oneshot` when a reply with that id comes back on the read loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RelayError;

pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Result<Value, RelayError>>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        })
    }

    /// Allocates an id and registers a reply slot for it.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value, RelayError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Resolves a pending call with its reply. A miss (unknown id, or the
    /// caller already timed out and dropped the receiver) is dropped
    /// silently — this is a normal race, not an error.
    pub fn resolve(&self, id: u64, result: Result<Value, RelayError>) {
        if let Some((_, tx)) = self.pending.remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Removes a pending call without resolving it, e.g. after the caller's
    /// timeout has already fired.
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Fails every pending call, e.g. because the connection dropped.
    pub fn fail_all(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RelayError::TransientNetwork(reason.to_string())));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_result_to_registered_receiver() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.resolve(id, Ok(serde_json::json!({"ok": true})));
        let result = rx.await.unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn resolve_on_unknown_id_is_a_silent_no_op() {
        let correlator = Correlator::new();
        correlator.resolve(999, Ok(serde_json::json!(null)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_call_with_an_error() {
        let correlator = Correlator::new();
        let (_, rx1) = correlator.register();
        let (_, rx2) = correlator.register();
        correlator.fail_all("connection closed");
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn cancel_removes_without_resolving() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.cancel(id);
        drop(rx);
        assert_eq!(correlator.pending_count(), 0);
    }
}
