//! ArrivalServer: the accepting side of the library.
//!
//! [`ArrivalServer`] binds the WebSocket listener and wires every accepted
//! socket into a shared [`ConnectionManager`], which enforces the allow-list,
//! runs registration and dispatches identified traffic to listeners.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::NetworkError;
use crate::identity::ClientId;
use crate::lifecycle::ConnectionManager;
use crate::message::{Body, Message, MessageType};
use crate::peer::ClientInfo;
use crate::transport::{self, CLOSE_GOING_AWAY};

/// A WebSocket server that admits allow-listed clients.
///
/// Listeners may be added before or after [`start()`](ArrivalServer::start).
pub struct ArrivalServer {
    config: ServerConfig,
    manager: ConnectionManager,
    /// Shutdown signal for the accept loop.
    shutdown_tx: Option<broadcast::Sender<()>>,
    /// Bound address while running.
    local_addr: Option<SocketAddr>,
}

impl ArrivalServer {
    pub fn new(config: ServerConfig) -> Self {
        let manager = ConnectionManager::from_config(&config);
        Self {
            config,
            manager,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Create a server with default config.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The connection manager shared with the accept loop. Clone it into
    /// listeners that need to reply.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// The address actually bound, available once started. Useful when the
    /// configured port is `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register a handler for messages of `message_type` from identified
    /// clients.
    pub fn add_listener<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&ClientId, &Body) + Send + Sync + 'static,
    {
        self.manager.add_listener(message_type, handler);
    }

    /// Register a handler receiving the body decoded as `T`.
    pub fn add_typed_listener<T, F>(&self, message_type: MessageType, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(&ClientId, T) + Send + Sync + 'static,
    {
        self.manager.add_typed_listener(message_type, handler);
    }

    /// Send `message` to `client`. Returns `false` if the client is not
    /// connected.
    pub fn send<M: Message>(&self, client: &ClientId, message: &M) -> bool {
        self.manager.send(client, message)
    }

    /// Send `message` to every identified client. Returns how many were
    /// reached.
    pub fn broadcast<M: Message>(&self, message: &M) -> usize {
        self.manager.broadcast(message)
    }

    pub fn is_connected(&self, client: &ClientId) -> bool {
        self.manager.is_connected(client)
    }

    /// Snapshot of identified clients, sorted by id.
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.manager.connected_clients()
    }

    /// Bind the listener and start accepting connections. Returns the bound
    /// address; calling it again while running is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        if let (Some(_), Some(addr)) = (&self.shutdown_tx, self.local_addr) {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        self.manager.reopen();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(transport::serve(listener, self.manager.clone(), shutdown_rx));

        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        info!("WebSocket server is running on {local_addr}");
        Ok(local_addr)
    }

    /// Stop accepting and close every live connection with 1001. Handshakes
    /// still in flight are refused with the same code.
    pub fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        self.manager.close_all(CLOSE_GOING_AWAY, "Server shutting down");
        self.local_addr = None;
        info!("WebSocket server stopped");
    }
}

impl Drop for ArrivalServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
