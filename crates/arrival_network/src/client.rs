//! ArrivalClient: the connecting side of the library.
//!
//! A client holds at most one connection. Inbound messages go to listeners
//! first and then to any blocking sends waiting on their type; a message
//! nobody consumed is logged and dropped.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::correlator::ResponseCorrelator;
use crate::error::NetworkError;
use crate::message::{Body, ClientRegistration, Envelope, Message, MessageType};
use crate::router::ListenerRegistry;
use crate::transport::{self, CloseInfo, PeerConnection};

/// Close code the client sends when it hangs up.
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    /// Never connected.
    Idle,
    Open,
    /// The last connection ended, with the server's close frame if it sent
    /// one.
    Closed(Option<CloseInfo>),
}

/// A WebSocket client speaking the typed-envelope protocol.
///
/// Cheap to clone; all clones share the connection, listeners and pending
/// responses.
#[derive(Clone)]
pub struct ArrivalClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    listeners: ListenerRegistry,
    responses: ResponseCorrelator,
    connection: RwLock<Option<PeerConnection>>,
    status: watch::Sender<LinkStatus>,
}

impl ArrivalClient {
    pub fn new(config: ClientConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus::Idle);
        Self {
            inner: Arc::new(ClientInner {
                config,
                listeners: ListenerRegistry::new(),
                responses: ResponseCorrelator::new(),
                connection: RwLock::new(None),
                status,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Register a handler for messages of `message_type` from the server.
    pub fn add_listener<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Body) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .register(message_type, move |_: &(), body| handler(body));
    }

    /// Register a handler receiving the body decoded as `T`.
    pub fn add_typed_listener<T, F>(&self, message_type: MessageType, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .register_typed(message_type, move |_: &(), message: T| handler(message));
    }

    /// Open the connection to the configured server. A no-op while a
    /// connection is already open.
    pub async fn connect(&self) -> Result<(), NetworkError> {
        if self.is_connected() {
            return Ok(());
        }

        let url = self.inner.config.server.url()?;
        let (connection, reader) =
            transport::connect(url.as_str(), self.inner.config.connect_timeout).await?;
        let id = connection.id();
        self.attach(connection);
        info!("Opened WebSocket connection to the server {url}");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let close = reader.run(|text| inner.deliver(text)).await;

            let mut slot = inner.connection.write();
            if slot.as_ref().is_some_and(|c| c.id() == id) {
                *slot = None;
                drop(slot);
                match &close {
                    Some(info) => info!(
                        "Connection to the server has been closed (code {}: {})",
                        info.code, info.reason
                    ),
                    None => info!("Connection to the server has been lost"),
                }
                inner.status.send_replace(LinkStatus::Closed(close));
            }
        });
        Ok(())
    }

    fn attach(&self, connection: PeerConnection) {
        *self.inner.connection.write() = Some(connection);
        self.inner.status.send_replace(LinkStatus::Open);
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Send `message` without waiting for anything back.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), NetworkError> {
        let connection = self.inner.connection.read();
        connection
            .as_ref()
            .ok_or(NetworkError::NotConnected)?
            .send(message)
    }

    /// Send `message` and wait for the next message of `response_type`.
    ///
    /// Returns `Ok(None)` when nothing of that type arrives within the
    /// configured response timeout. Every caller waiting on the same type
    /// receives the same reply.
    pub async fn send_blocking<M: Message>(
        &self,
        message: &M,
        response_type: MessageType,
    ) -> Result<Option<Body>, NetworkError> {
        let pending = self.inner.responses.expect(response_type);
        self.send(message)?;
        Ok(pending.wait(self.inner.config.response_timeout).await)
    }

    /// [`send_blocking`](Self::send_blocking) with the reply decoded as `T`.
    pub async fn request<M, T>(
        &self,
        message: &M,
        response_type: MessageType,
    ) -> Result<Option<T>, NetworkError>
    where
        M: Message,
        T: DeserializeOwned,
    {
        match self.send_blocking(message, response_type).await? {
            Some(body) => Envelope::new(response_type, body).body_as().map(Some),
            None => Ok(None),
        }
    }

    /// Identify this client to the server as `name`.
    pub fn register_as(&self, name: impl Into<String>) -> Result<(), NetworkError> {
        self.send(&ClientRegistration::new(name))
    }

    /// Ask the server to close the connection.
    pub fn close(&self) {
        if let Some(connection) = self.inner.connection.read().as_ref() {
            connection.close(CLOSE_NORMAL, "Client closing");
        }
    }

    /// Wait until the current connection ends and return the server's close
    /// frame, if it sent one. Returns at once when not connected.
    pub async fn closed(&self) -> Option<CloseInfo> {
        let mut status = self.inner.status.subscribe();
        let ended = status.wait_for(|s| *s != LinkStatus::Open).await;
        match ended.as_deref() {
            Ok(LinkStatus::Closed(info)) => info.clone(),
            _ => None,
        }
    }
}

impl ClientInner {
    /// Hand one inbound text frame to listeners and waiting senders.
    fn deliver(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping message from the server: {e}");
                return;
            }
        };

        let message_type = envelope.message_type;
        let handled = self
            .listeners
            .dispatch(message_type, &(), &envelope.body);
        let resolved = self.responses.resolve(message_type, &envelope.body);
        if !handled && resolved == 0 {
            warn!("There is no registered listener for client message type {message_type}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
