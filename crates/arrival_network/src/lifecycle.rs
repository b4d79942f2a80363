//! Connection lifecycle: admission, registration and cleanup on the server.
//!
//! ```text
//!            allow-list check            registration (type 0)
//! handshake ─────────────────▶ Waiting ──────────────────────▶ Connected
//!     │ unknown host                │ timeout                       │
//!     ▼                             ▼                               ▼
//!  close 4000                  close 4000                    removed on close
//! ```
//!
//! With [`AccessPolicy::AddressBound`] the identity comes from the allow-list,
//! so an admitted connection skips the waiting room and a second connection
//! for a live identity is closed with 4001.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::{AccessPolicy, DEFAULT_CLOSE_TIMEOUT, ServerConfig};
use crate::identity::{ClientId, ConnectionId};
use crate::message::{
    self, Body, CLIENT_REGISTRATION, ClientRegistration, Envelope, Message, MessageType,
};
use crate::peer::{ClientInfo, PeerState, PeerTable, Promotion, Removed};
use crate::router::ListenerRegistry;
use crate::transport::{CloseCode, CloseInfo, PeerConnection};

/// How an admitted connection enters the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Wait for a registration message.
    AwaitRegistration,
    /// Identity already known from the allow-list.
    Identified(ClientId),
}

/// Why a connection was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: CloseCode,
    pub reason: String,
}

/// Owns the server's peer table and listener registry.
///
/// Cheap to clone; all clones share state. A listener that needs to reply
/// should capture a [`WeakConnectionManager`] rather than a clone, since the
/// manager owns its listeners.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

/// A non-owning handle to a [`ConnectionManager`].
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<ManagerInner>,
}

impl WeakConnectionManager {
    /// The manager, if it is still alive.
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

struct ManagerInner {
    access: AccessPolicy,
    registration_timeout: Duration,
    close_timeout: Duration,
    peers: RwLock<PeerTable>,
    listeners: ListenerRegistry<ClientId>,
}

impl ConnectionManager {
    pub fn new(access: AccessPolicy, registration_timeout: Duration) -> Self {
        Self::with_timeouts(access, registration_timeout, DEFAULT_CLOSE_TIMEOUT)
    }

    fn with_timeouts(
        access: AccessPolicy,
        registration_timeout: Duration,
        close_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                access,
                registration_timeout,
                close_timeout,
                peers: RwLock::new(PeerTable::new()),
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::with_timeouts(
            config.access.clone(),
            config.registration_timeout,
            config.close_timeout,
        )
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// How long a peer may take over the handshake or the closing handshake.
    pub fn close_timeout(&self) -> Duration {
        self.inner.close_timeout
    }

    /// The allow-list in force.
    pub fn access(&self) -> &AccessPolicy {
        &self.inner.access
    }

    /// Register a handler for messages of `message_type` from identified
    /// clients.
    pub fn add_listener<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&ClientId, &Body) + Send + Sync + 'static,
    {
        self.inner.listeners.register(message_type, handler);
    }

    /// Register a handler receiving the body decoded as `T`.
    pub fn add_typed_listener<T, F>(&self, message_type: MessageType, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(&ClientId, T) + Send + Sync + 'static,
    {
        self.inner.listeners.register_typed(message_type, handler);
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Check whether a handshake from `addr` would be admitted right now.
    pub fn authorize(&self, addr: SocketAddr) -> Result<Admission, Rejection> {
        let host = addr.ip().to_canonical().to_string();
        let peers = self.inner.peers.read();
        self.admission(&host, &peers)
    }

    fn admission(&self, host: &str, peers: &PeerTable) -> Result<Admission, Rejection> {
        let unauthorized = || Rejection {
            code: CloseCode::Unauthorized,
            reason: format!("Connection from the host '{host}' is not allowed"),
        };

        match &self.inner.access {
            AccessPolicy::Registration { allowed_hosts } => {
                if allowed_hosts.contains(host) {
                    Ok(Admission::AwaitRegistration)
                } else {
                    Err(unauthorized())
                }
            }
            AccessPolicy::AddressBound { clients } => match clients.get(host) {
                None => Err(unauthorized()),
                Some(client) if peers.is_connected(client) => Err(Rejection {
                    code: CloseCode::AlreadyConnected,
                    reason: format!("Client {client} is already connected"),
                }),
                Some(client) => Ok(Admission::Identified(client.clone())),
            },
        }
    }

    /// Admit a freshly upgraded connection, or close it with the policy code.
    ///
    /// The check and the insertion happen under one write lock, so two
    /// simultaneous handshakes cannot both claim an address-bound identity.
    /// Returns whether the connection was admitted. After
    /// [`close_all`](Self::close_all) every connection is refused with the
    /// same code until [`reopen`](Self::reopen).
    ///
    /// Arms the registration timer with `tokio::spawn`, so it must run inside
    /// a Tokio runtime.
    pub(crate) fn open(&self, connection: PeerConnection) -> bool {
        let host = connection.host();
        let admission = {
            let mut peers = self.inner.peers.write();
            if let Some((code, reason)) = peers.refusal().cloned() {
                drop(peers);
                info!("Refusing connection from {host}: {reason}");
                connection.close(code, reason);
                return false;
            }
            let admission = self.admission(&host, &peers);
            match &admission {
                Ok(Admission::AwaitRegistration) => peers.add_waiting(connection.clone()),
                Ok(Admission::Identified(client)) => {
                    peers.add_connected(client.clone(), connection.clone());
                }
                Err(_) => {}
            }
            admission
        };

        match admission {
            Ok(Admission::AwaitRegistration) => {
                self.arm_registration_timer(connection.id());
                info!("Opened connection from client {host}");
                true
            }
            Ok(Admission::Identified(client)) => {
                info!("Client {client} connected from {host}");
                true
            }
            Err(rejection) => {
                warn!("Rejected connection from {host}: {}", rejection.reason);
                connection.close(rejection.code.code(), rejection.reason);
                false
            }
        }
    }

    fn arm_registration_timer(&self, id: ConnectionId) {
        let manager = self.clone();
        let timeout = self.inner.registration_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire(id);
        });
    }

    /// Close `id` if it is still waiting. Returns whether it was.
    fn expire(&self, id: ConnectionId) -> bool {
        let Some(connection) = self.inner.peers.write().remove_waiting(id) else {
            return false;
        };
        warn!(
            "Client {} did not register within {:?}, closing",
            connection.host(),
            self.inner.registration_timeout
        );
        connection.close(CloseCode::Unauthorized.code(), "Client has not registered");
        true
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handle one text frame from connection `id`.
    pub fn handle_text(&self, id: ConnectionId, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle_envelope(id, envelope),
            Err(e) => warn!("Dropping message from connection {id}: {e}"),
        }
    }

    /// Route a decoded envelope: registration is handled here, anything else
    /// goes to listeners if the sender is identified.
    pub fn handle_envelope(&self, id: ConnectionId, envelope: Envelope) {
        if envelope.message_type == CLIENT_REGISTRATION {
            self.register(id, &envelope);
            return;
        }

        let client = self.inner.peers.read().client_of(id).cloned();
        let Some(client) = client else {
            warn!(
                "Dropping message of type {} from unregistered connection {id}",
                envelope.message_type
            );
            return;
        };

        if !self
            .inner
            .listeners
            .dispatch(envelope.message_type, &client, &envelope.body)
        {
            warn!(
                "There is no registered listener for server message type {}",
                envelope.message_type
            );
        }
    }

    fn register(&self, id: ConnectionId, envelope: &Envelope) {
        if matches!(self.inner.access, AccessPolicy::AddressBound { .. }) {
            warn!("Ignoring registration from connection {id}: clients are identified by address");
            return;
        }

        let registration: ClientRegistration = match envelope.body_as() {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Malformed registration from connection {id}: {e}");
                return;
            }
        };
        if registration.client_name.is_empty() {
            warn!("Ignoring registration with an empty name from connection {id}");
            return;
        }

        let client = ClientId::from(registration.client_name);
        let promotion = self.inner.peers.write().promote(id, client.clone());
        match promotion {
            Promotion::Promoted => info!("Client {client} registered"),
            Promotion::NotWaiting => {
                warn!("Ignoring registration as {client} from connection {id}: not waiting");
            }
            Promotion::IdentityTaken(connection) => {
                warn!(
                    "Client {client} is already connected, rejecting {}",
                    connection.host()
                );
                connection.close(
                    CloseCode::AlreadyConnected.code(),
                    format!("Client {client} is already connected"),
                );
            }
        }
    }

    /// Forget connection `id` after the transport closed it.
    pub fn handle_close(&self, id: ConnectionId, close: Option<CloseInfo>) {
        let code = close.map_or_else(|| "none".to_string(), |c| c.code.to_string());
        let removed = self.inner.peers.write().remove(id);
        match removed {
            Some(Removed::Waiting(connection)) => info!(
                "Connection from the waiting client {} has been closed (code {code})",
                connection.host()
            ),
            Some(Removed::Connected(client, _)) => {
                info!("Connection from the client {client} has been closed (code {code})");
            }
            None => debug!("Connection {id} closed after it was dropped from the table"),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send `message` to `client`. Returns `false` if the client has no
    /// identified connection.
    pub fn send<M: Message>(&self, client: &ClientId, message: &M) -> bool {
        match message::encode(message) {
            Ok(text) => self.send_text(client, text),
            Err(e) => {
                warn!("Cannot encode message for {client}: {e}");
                false
            }
        }
    }

    /// Send pre-encoded text to `client`.
    pub fn send_text(&self, client: &ClientId, text: String) -> bool {
        let peers = self.inner.peers.read();
        match peers.connection_for(client) {
            Some(connection) => connection.send_text(text),
            None => false,
        }
    }

    /// Send `message` to every identified client. Returns how many it was
    /// queued for.
    pub fn broadcast<M: Message>(&self, message: &M) -> usize {
        let text = match message::encode(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot encode broadcast message: {e}");
                return 0;
            }
        };
        self.inner
            .peers
            .read()
            .connections()
            .filter(|connection| connection.send_text(text.clone()))
            .count()
    }

    /// Close and forget every connection, and refuse new ones with the same
    /// code until [`reopen`](Self::reopen).
    pub fn close_all(&self, code: u16, reason: &str) {
        let connections = self.inner.peers.write().shut_down(code, reason);
        for connection in connections {
            connection.close(code, reason);
        }
    }

    /// Admit connections again after [`close_all`](Self::close_all).
    pub fn reopen(&self) {
        self.inner.peers.write().reopen();
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_connected(&self, client: &ClientId) -> bool {
        self.inner.peers.read().is_connected(client)
    }

    pub fn state_of(&self, id: ConnectionId) -> Option<PeerState> {
        self.inner.peers.read().state_of(id)
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.peers.read().waiting_count()
    }

    /// Snapshot of identified clients.
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.inner.peers.read().list_connected()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
