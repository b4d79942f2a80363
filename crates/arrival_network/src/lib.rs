//! Arrival Network: typed JSON messaging between a game server and its
//! allow-listed clients.
//!
//! A server accepts WebSocket connections from known hosts only. Each
//! connection names itself with a registration message (or is named by its
//! address), after which both sides exchange flat JSON objects whose integer
//! `type` field selects the listeners that receive them.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket (via `tokio-tungstenite`), one writer task and
//!   one reader loop per connection.
//! - **Protocol**: flat JSON objects tagged with an integer `type`; type `0`
//!   is reserved for registration.
//! - **Lifecycle**: allow-list admission, a registration deadline and one
//!   live connection per client identity.
//! - **Routing**: per-type listener lists, plus blocking sends that wait for
//!   the next message of a response type.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arrival_network::{ArrivalClient, ArrivalServer, ClientConfig, ServerConfig};
//! use arrival_network::config::{AccessPolicy, ServerAddress};
//!
//! # async fn example() -> Result<(), arrival_network::NetworkError> {
//! let mut server = ArrivalServer::new(ServerConfig {
//!     access: AccessPolicy::registration(["127.0.0.1"]),
//!     ..ServerConfig::default()
//! });
//! // The manager owns its listeners, so a listener keeps only a weak handle.
//! let manager = server.manager().downgrade();
//! server.add_listener(40, move |client, _body| {
//!     let reply = serde_json::json!({"players": 3});
//!     let reply = arrival_network::Envelope::new(41, reply.as_object().cloned().unwrap_or_default());
//!     if let Some(manager) = manager.upgrade() {
//!         manager.send(client, &reply);
//!     }
//! });
//! let addr = server.start().await?;
//!
//! let client = ArrivalClient::new(ClientConfig::for_server(ServerAddress::new(
//!     "127.0.0.1",
//!     addr.port(),
//!     "",
//! )));
//! client.connect().await?;
//! client.register_as("lobby")?;
//! let status = arrival_network::Envelope::new(40, Default::default());
//! let reply = client.send_blocking(&status, 41).await?;
//! # let _ = reply;
//! server.stop();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod message;
pub mod peer;
pub mod router;
pub mod server;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use client::ArrivalClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::NetworkError;
pub use identity::ClientId;
pub use lifecycle::{ConnectionManager, WeakConnectionManager};
pub use message::{Body, ClientRegistration, Envelope, Message, MessageType, ServerScoped};
pub use peer::{ClientInfo, PeerState};
pub use server::ArrivalServer;
pub use transport::{CloseCode, CloseInfo};
