//! Notification routing: demultiplexes unsolicited JSON-RPC notifications
//! (messages with no numeric `id`, or `id == 0`) by method name.
//!
//! `eth_subscription` (Ethereum `newHeads`) and `slotNotification` (Solana)
//! are the two methods relay clients recognize; anything else is forwarded
//! to a catch-all sink so a caller can still observe or log it.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

pub const ETH_SUBSCRIPTION: &str = "eth_subscription";
pub const SOLANA_SLOT_NOTIFICATION: &str = "slotNotification";

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// Routes notifications to per-method subscriber channels. One router is
/// shared by all connections for a given network.
#[derive(Default)]
pub struct NotificationRouter {
    subscribers: DashMap<String, mpsc::UnboundedSender<Notification>>,
    catch_all: DashMap<(), mpsc::UnboundedSender<Notification>>,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to notifications for a specific method; replaces any
    /// previous subscriber for that method.
    pub fn subscribe(&self, method: impl Into<String>) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(method.into(), tx);
        rx
    }

    /// Subscribe to every notification, regardless of method.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.catch_all.insert((), tx);
        rx
    }

    /// Route a raw JSON-RPC notification object (has `method`, no response
    /// `id` the correlator recognizes). Drops silently if there's no
    /// subscriber — the same "unknown id replies are dropped" posture the
    /// correlator takes for unmatched responses.
    pub fn dispatch(&self, method: &str, params: Value) {
        let notification = Notification {
            method: method.to_string(),
            params,
        };

        if let Some(tx) = self.subscribers.get(method) {
            let _ = tx.send(notification.clone());
        }
        if let Some(tx) = self.catch_all.get(&()) {
            let _ = tx.send(notification);
        }
    }

    pub fn is_recognized(method: &str) -> bool {
        matches!(method, ETH_SUBSCRIPTION | SOLANA_SLOT_NOTIFICATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_matching_subscriber_only() {
        let router = NotificationRouter::new();
        let mut heads = router.subscribe(ETH_SUBSCRIPTION);
        let mut slots = router.subscribe(SOLANA_SLOT_NOTIFICATION);

        router.dispatch(ETH_SUBSCRIPTION, serde_json::json!({"result": {"hash": "0x1"}}));

        let received = heads.recv().await.unwrap();
        assert_eq!(received.method, ETH_SUBSCRIPTION);
        assert!(slots.try_recv().is_err());
    }

    #[tokio::test]
    async fn catch_all_receives_every_notification() {
        let router = NotificationRouter::new();
        let mut all = router.subscribe_all();
        router.dispatch("some_unrecognized_method", serde_json::json!({}));
        let received = all.recv().await.unwrap();
        assert_eq!(received.method, "some_unrecognized_method");
    }

    #[test]
    fn recognizes_known_methods_only() {
        assert!(NotificationRouter::is_recognized(ETH_SUBSCRIPTION));
        assert!(NotificationRouter::is_recognized(SOLANA_SLOT_NOTIFICATION));
        assert!(!NotificationRouter::is_recognized("eth_getBlockByNumber"));
    }
}
