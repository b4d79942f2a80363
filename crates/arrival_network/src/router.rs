//! Listener registry: dispatches inbound envelopes to registered handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::message::{Body, Envelope, MessageType};

/// A handler invoked for every inbound message of one type.
///
/// `S` is the sender context: `()` on the client, the sending
/// [`ClientId`](crate::identity::ClientId) on the server.
pub type Listener<S> = Arc<dyn Fn(&S, &Body) + Send + Sync>;

/// Routes inbound message bodies to every handler registered for their type.
///
/// The registry is add-only. Handlers for one type run in the order they
/// were registered, synchronously on the delivering task, so they should be
/// quick or hand their work off elsewhere.
pub struct ListenerRegistry<S = ()> {
    listeners: RwLock<HashMap<MessageType, Vec<Listener<S>>>>,
}

impl<S> ListenerRegistry<S> {
    /// Create a registry with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Append a handler for `message_type`.
    pub fn register<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&S, &Body) + Send + Sync + 'static,
    {
        debug!("Registering listener for message type {message_type}");
        self.listeners
            .write()
            .entry(message_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Append a handler that receives the body decoded as `T`.
    ///
    /// Bodies that do not fit `T` are dropped with a warning.
    pub fn register_typed<T, F>(&self, message_type: MessageType, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(&S, T) + Send + Sync + 'static,
    {
        self.register(message_type, move |sender, body| {
            let envelope = Envelope::new(message_type, body.clone());
            match envelope.body_as::<T>() {
                Ok(message) => handler(sender, message),
                Err(e) => warn!("Cannot decode body of message type {message_type}: {e}"),
            }
        });
    }

    /// Whether any handler is registered for `message_type`.
    pub fn has_listener(&self, message_type: MessageType) -> bool {
        self.listeners.read().contains_key(&message_type)
    }

    /// Number of handlers registered for `message_type`.
    pub fn listener_count(&self, message_type: MessageType) -> usize {
        self.listeners
            .read()
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler for `message_type`. Returns `false` when there
    /// were none.
    ///
    /// The handler list is snapshotted before the calls, so handlers may
    /// register further listeners; those only see later messages.
    pub fn dispatch(&self, message_type: MessageType, sender: &S, body: &Body) -> bool {
        let handlers = match self.listeners.read().get(&message_type) {
            Some(handlers) => handlers.clone(),
            None => return false,
        };

        for handler in &handlers {
            handler(sender, body);
        }
        true
    }
}

impl<S> Default for ListenerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Body {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry: ListenerRegistry = ListenerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&calls);
        registry.register(5, move |_, b| c1.lock().push(("h1", b.clone())));
        let c2 = Arc::clone(&calls);
        registry.register(5, move |_, b| c2.lock().push(("h2", b.clone())));

        let payload = body(json!({"x": 1}));
        assert!(registry.dispatch(5, &(), &payload));

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("h1", payload.clone()));
        assert_eq!(calls[1], ("h2", payload));
    }

    #[test]
    fn test_dispatch_unhandled_type() {
        let registry: ListenerRegistry = ListenerRegistry::new();
        let called = Arc::new(Mutex::new(false));
        let c = Arc::clone(&called);
        registry.register(1, move |_, _| *c.lock() = true);

        assert!(!registry.dispatch(2, &(), &Body::new()));
        assert!(!*called.lock());
    }

    #[test]
    fn test_listener_counts() {
        let registry: ListenerRegistry = ListenerRegistry::new();
        assert!(!registry.has_listener(3));
        registry.register(3, |_, _| {});
        registry.register(3, |_, _| {});
        assert!(registry.has_listener(3));
        assert_eq!(registry.listener_count(3), 2);
        assert_eq!(registry.listener_count(4), 0);
    }

    #[test]
    fn test_sender_context_is_passed() {
        let registry: ListenerRegistry<String> = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        registry.register(8, move |sender: &String, _| *s.lock() = Some(sender.clone()));

        registry.dispatch(8, &"lobby".to_string(), &Body::new());
        assert_eq!(seen.lock().as_deref(), Some("lobby"));
    }

    #[test]
    fn test_handler_may_register_listeners() {
        let registry: Arc<ListenerRegistry> = Arc::new(ListenerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register(1, move |_, _| inner.register(2, |_, _| {}));

        assert!(registry.dispatch(1, &(), &Body::new()));
        assert!(registry.has_listener(2));
    }

    #[test]
    fn test_typed_listener() {
        #[derive(Deserialize)]
        struct Kick {
            player: String,
        }

        let registry: ListenerRegistry = ListenerRegistry::new();
        let kicked = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kicked);
        registry.register_typed(4, move |_, kick: Kick| k.lock().push(kick.player));

        registry.dispatch(4, &(), &body(json!({"player": "notch"})));
        // Wrong shape is dropped, but still counts as handled.
        assert!(registry.dispatch(4, &(), &body(json!({"reason": "afk"}))));

        assert_eq!(*kicked.lock(), vec!["notch".to_string()]);
    }

    #[test]
    fn test_concurrent_register_and_dispatch() {
        let registry: Arc<ListenerRegistry> = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let hits = Arc::clone(&hits);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let hits = Arc::clone(&hits);
                        registry.register(1, move |_, _| {
                            hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        });
                        registry.dispatch(1, &(), &Body::new());
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        assert_eq!(registry.listener_count(1), 200);
        assert!(hits.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
