//! Response correlator: turns a fire-and-forget send into a call that waits
//! for a reply of a given type.
//!
//! Waiters are keyed only by the expected response type. When a message of
//! that type arrives, every waiter currently registered for it is resolved
//! with the same body. Two callers that expect the same response type at the
//! same time therefore cannot tell their replies apart; pairing a specific
//! reply with a specific request would need a correlation id on the wire.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{Body, MessageType};

struct Waiter {
    id: u64,
    slot: oneshot::Sender<Body>,
}

type WaiterMap = HashMap<MessageType, Vec<Waiter>>;

/// Tracks callers waiting for a response of a particular type.
#[derive(Default)]
pub struct ResponseCorrelator {
    waiters: Arc<RwLock<WaiterMap>>,
    next_id: AtomicU64,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next message of `response_type`.
    ///
    /// Call this before sending the request so a fast reply is not missed.
    pub fn expect(&self, response_type: MessageType) -> PendingResponse {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, receiver) = oneshot::channel();

        self.waiters
            .write()
            .entry(response_type)
            .or_default()
            .push(Waiter { id, slot });

        PendingResponse {
            id,
            response_type,
            receiver,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Resolve and remove every waiter registered for `message_type`.
    /// Returns how many waiters were registered.
    pub fn resolve(&self, message_type: MessageType, body: &Body) -> usize {
        let Some(waiters) = self.waiters.write().remove(&message_type) else {
            return 0;
        };

        let count = waiters.len();
        for waiter in waiters {
            // The receiver may have timed out between removal and send.
            let _ = waiter.slot.send(body.clone());
        }
        debug!("Resolved {count} waiter(s) for message type {message_type}");
        count
    }

    /// Number of callers currently waiting for `message_type`.
    pub fn pending_count(&self, message_type: MessageType) -> usize {
        self.waiters
            .read()
            .get(&message_type)
            .map_or(0, Vec::len)
    }
}

/// One caller's outstanding wait. Dropping it withdraws the waiter.
pub struct PendingResponse {
    id: u64,
    response_type: MessageType,
    receiver: oneshot::Receiver<Body>,
    waiters: Arc<RwLock<WaiterMap>>,
}

impl PendingResponse {
    /// The response type this caller is waiting for.
    pub fn response_type(&self) -> MessageType {
        self.response_type
    }

    /// Wait up to `timeout` for the response. `None` on timeout.
    pub async fn wait(mut self, timeout: Duration) -> Option<Body> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(body)) => Some(body),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    "No response of type {} within {timeout:?}",
                    self.response_type
                );
                None
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut waiters = self.waiters.write();
        if let Some(list) = waiters.get_mut(&self.response_type) {
            list.retain(|w| w.id != self.id);
            if list.is_empty() {
                waiters.remove(&self.response_type);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Body {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_resolved_within_window() {
        let correlator = Arc::new(ResponseCorrelator::new());
        let pending = correlator.expect(11);
        assert_eq!(correlator.pending_count(11), 1);

        let c = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.resolve(11, &body(json!({"ok": true})));
        });

        let response = pending.wait(Duration::from_secs(5)).await;
        assert_eq!(response, Some(body(json!({"ok": true}))));
        assert_eq!(correlator.pending_count(11), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_none_and_removes_waiter() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(11);

        let response = pending.wait(Duration::from_secs(5)).await;
        assert!(response.is_none());
        assert_eq!(correlator.pending_count(11), 0);

        // A late response finds nobody waiting.
        assert_eq!(correlator.resolve(11, &Body::new()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_other_waiters() {
        let correlator = ResponseCorrelator::new();
        let short = correlator.expect(3);
        let long = correlator.expect(3);

        assert!(short.wait(Duration::from_secs(1)).await.is_none());
        assert_eq!(correlator.pending_count(3), 1);

        assert_eq!(correlator.resolve(3, &body(json!({"n": 1}))), 1);
        assert_eq!(
            long.wait(Duration::from_secs(5)).await,
            Some(body(json!({"n": 1})))
        );
    }

    #[tokio::test]
    async fn test_broadcast_resolve() {
        let correlator = ResponseCorrelator::new();
        let first = correlator.expect(20);
        let second = correlator.expect(20);
        let other = correlator.expect(21);

        assert_eq!(correlator.resolve(20, &body(json!({"players": 4}))), 2);

        let (a, b) = tokio::join!(
            first.wait(Duration::from_secs(5)),
            second.wait(Duration::from_secs(5))
        );
        assert_eq!(a, Some(body(json!({"players": 4}))));
        assert_eq!(a, b);
        assert_eq!(correlator.pending_count(21), 1);
        drop(other);
        assert_eq!(correlator.pending_count(21), 0);
    }

    #[tokio::test]
    async fn test_resolution_is_single_shot() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(9);

        assert_eq!(correlator.resolve(9, &body(json!({"seq": 1}))), 1);
        assert_eq!(correlator.resolve(9, &body(json!({"seq": 2}))), 0);
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await,
            Some(body(json!({"seq": 1})))
        );
    }
}
