//! Peer table: which connections are waiting, which are identified.
//!
//! A connection is in exactly one of two places: the waiting room (connected,
//! identity unknown) or the connected map (keyed by [`ClientId`]). The table
//! itself is plain data; [`ConnectionManager`](crate::lifecycle::ConnectionManager)
//! wraps it in a lock and drives the transitions.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ClientId, ConnectionId};
use crate::transport::PeerConnection;

/// Where a live connection currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Transport open, identity not yet established.
    Waiting,
    /// Identity established; messages are dispatched.
    Connected,
}

/// Snapshot of one identified client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub addr: SocketAddr,
    /// When the client became identified.
    pub connected_at: DateTime<Utc>,
}

struct ConnectedPeer {
    connection: PeerConnection,
    connected_at: DateTime<Utc>,
}

/// Outcome of [`PeerTable::promote`].
#[derive(Debug)]
pub enum Promotion {
    /// Moved from waiting to connected.
    Promoted,
    /// The connection was not waiting (already connected, or gone).
    NotWaiting,
    /// Another connection holds the identity. The waiting connection has been
    /// taken out of the table and is returned so the caller can close it.
    IdentityTaken(PeerConnection),
}

/// What [`PeerTable::remove`] took out.
#[derive(Debug)]
pub enum Removed {
    Waiting(PeerConnection),
    Connected(ClientId, PeerConnection),
}

/// All live server-side connections.
#[derive(Default)]
pub struct PeerTable {
    waiting: HashMap<ConnectionId, PeerConnection>,
    connected: HashMap<ClientId, ConnectedPeer>,
    identities: HashMap<ConnectionId, ClientId>,
    /// Close code and reason for connections opened after shutdown.
    refusal: Option<(u16, String)>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a freshly opened connection in the waiting room.
    pub fn add_waiting(&mut self, connection: PeerConnection) {
        self.waiting.insert(connection.id(), connection);
    }

    /// Insert a connection directly as `client`. Returns `false` (and inserts
    /// nothing) if the identity is already taken.
    pub fn add_connected(&mut self, client: ClientId, connection: PeerConnection) -> bool {
        if self.connected.contains_key(&client) {
            return false;
        }
        self.identities.insert(connection.id(), client.clone());
        self.connected.insert(
            client,
            ConnectedPeer {
                connection,
                connected_at: Utc::now(),
            },
        );
        true
    }

    /// Move a waiting connection to the connected map under `client`.
    pub fn promote(&mut self, id: ConnectionId, client: ClientId) -> Promotion {
        let Some(connection) = self.waiting.remove(&id) else {
            return Promotion::NotWaiting;
        };
        if self.connected.contains_key(&client) {
            return Promotion::IdentityTaken(connection);
        }
        self.add_connected(client, connection);
        Promotion::Promoted
    }

    /// Take a connection out of whichever set holds it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Removed> {
        if let Some(connection) = self.waiting.remove(&id) {
            return Some(Removed::Waiting(connection));
        }
        let client = self.identities.remove(&id)?;
        let peer = self.connected.remove(&client)?;
        Some(Removed::Connected(client, peer.connection))
    }

    /// Take a connection out only if it is still waiting.
    pub fn remove_waiting(&mut self, id: ConnectionId) -> Option<PeerConnection> {
        self.waiting.remove(&id)
    }

    /// Remove everything, returning every live connection.
    pub fn drain(&mut self) -> Vec<PeerConnection> {
        self.identities.clear();
        self.waiting
            .drain()
            .map(|(_, c)| c)
            .chain(self.connected.drain().map(|(_, p)| p.connection))
            .collect()
    }

    /// Remove everything and refuse later connections with `code`/`reason`
    /// until [`reopen`](Self::reopen).
    pub fn shut_down(&mut self, code: u16, reason: &str) -> Vec<PeerConnection> {
        self.refusal = Some((code, reason.to_string()));
        self.drain()
    }

    /// Accept connections again after [`shut_down`](Self::shut_down).
    pub fn reopen(&mut self) {
        self.refusal = None;
    }

    /// How a new connection must be closed, if the table is shut down.
    pub fn refusal(&self) -> Option<&(u16, String)> {
        self.refusal.as_ref()
    }

    /// The state of a connection, or `None` if it is not in the table.
    pub fn state_of(&self, id: ConnectionId) -> Option<PeerState> {
        if self.waiting.contains_key(&id) {
            Some(PeerState::Waiting)
        } else if self.identities.contains_key(&id) {
            Some(PeerState::Connected)
        } else {
            None
        }
    }

    /// The identity behind a connected connection.
    pub fn client_of(&self, id: ConnectionId) -> Option<&ClientId> {
        self.identities.get(&id)
    }

    /// The connection currently serving `client`.
    pub fn connection_for(&self, client: &ClientId) -> Option<&PeerConnection> {
        self.connected.get(client).map(|p| &p.connection)
    }

    /// Connections of all identified clients.
    pub fn connections(&self) -> impl Iterator<Item = &PeerConnection> {
        self.connected.values().map(|p| &p.connection)
    }

    pub fn is_connected(&self, client: &ClientId) -> bool {
        self.connected.contains_key(client)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Snapshot of all identified clients, sorted by id.
    pub fn list_connected(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .connected
            .iter()
            .map(|(id, peer)| ClientInfo {
                id: id.clone(),
                addr: peer.connection.remote_addr(),
                connected_at: peer.connected_at,
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
