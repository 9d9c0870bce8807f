//! Live connection tracking and event delivery
//!
//! This module binds each transport connection to the identity it registered
//! with and delivers server events to it. It covers:
//! - Connection lifecycle (accept, register, close)
//! - Capacity enforcement for new connections
//! - Best-effort fan-out to everyone, to admins only, or to one connection
//!
//! Delivery goes through a bounded outbox per connection. Sends never wait:
//! a frame for a full or closed outbox is dropped and logged, so a slow or
//! dead peer never holds up the coordinator or the other connections.

use log::{error, info, warn};
use shared::{Role, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type ConnectionId = u32;

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized JSON event
    Text(String),
    /// Normal closure with the given reason; the writer stops afterwards
    Close(String),
}

/// Who a connection registered as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

/// A live transport connection and its outbox
#[derive(Debug)]
pub struct Connection {
    /// Identifier assigned when the socket was accepted
    pub id: ConnectionId,
    /// Peer address, used in log lines
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Set by `register`; unregistered connections have no role
    pub identity: Option<Identity>,
    outbox: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, outbox: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            identity: None,
            outbox,
        }
    }

    /// Queues a frame without waiting for room in the outbox
    pub fn send(&self, frame: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.outbox.try_send(frame)
    }

    pub fn role(&self) -> Option<Role> {
        self.identity.as_ref().map(|identity| identity.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(Role::Admin)
    }
}

/// Tracks every live connection and fans events out to them
///
/// The registry is owned by the round coordinator and only mutated from its
/// serialized event path.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Tracks a newly accepted connection
    ///
    /// Returns false without tracking it if the registry is at capacity.
    pub fn add(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
        outbox: mpsc::Sender<Outbound>,
    ) -> bool {
        if self.connections.len() >= self.max_connections {
            return false;
        }

        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr, outbox));
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if let Some(connection) = &removed {
            info!(
                "Connection {} ({}) closed after {:?}",
                id,
                connection
                    .identity
                    .as_ref()
                    .map(|identity| identity.username.as_str())
                    .unwrap_or("unregistered"),
                connection.connected_at.elapsed()
            );
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<&Identity> {
        self.connections.get(&id).and_then(|c| c.identity.as_ref())
    }

    /// Binds a connection to an identity, returning the one it replaced
    pub fn bind(&mut self, id: ConnectionId, username: &str, role: Role) -> Option<Identity> {
        let connection = self.connections.get_mut(&id)?;
        connection.identity.replace(Identity {
            username: username.to_string(),
            role,
        })
    }

    /// True if any live connection is bound to `username`
    pub fn is_username_live(&self, username: &str) -> bool {
        self.connections.values().any(|c| {
            c.identity
                .as_ref()
                .is_some_and(|identity| identity.username == username)
        })
    }

    pub fn connections_of(&self, username: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| {
                c.identity
                    .as_ref()
                    .is_some_and(|identity| identity.username == username)
            })
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Distinct usernames of connections registered as players
    pub fn player_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .values()
            .filter_map(|c| c.identity.as_ref())
            .filter(|identity| identity.role == Role::Player)
            .map(|identity| identity.username.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Every connection that is not an admin, including unregistered ones
    pub fn non_admin_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| !c.is_admin())
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        if let Some(text) = encode(message) {
            for connection in self.connections.values() {
                deliver(connection, Outbound::Text(text.clone()));
            }
        }
    }

    pub fn broadcast_to_admins(&self, message: &ServerMessage) {
        if let Some(text) = encode(message) {
            for connection in self.connections.values().filter(|c| c.is_admin()) {
                deliver(connection, Outbound::Text(text.clone()));
            }
        }
    }

    pub fn unicast(&self, id: ConnectionId, message: &ServerMessage) {
        let Some(connection) = self.connections.get(&id) else {
            warn!("Dropping message for unknown connection {}", id);
            return;
        };
        if let Some(text) = encode(message) {
            deliver(connection, Outbound::Text(text));
        }
    }

    /// Queues a normal-closure notice and stops tracking the connection
    pub fn close(&mut self, id: ConnectionId, reason: &str) -> Option<Connection> {
        let connection = self.remove(id)?;
        deliver(&connection, Outbound::Close(reason.to_string()));
        Some(connection)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize {:?}: {}", message, e);
            None
        }
    }
}

fn deliver(connection: &Connection, frame: Outbound) {
    match connection.send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!(
            "Outbox for connection {} ({}) is full, dropping frame",
            connection.id, connection.addr
        ),
        Err(TrySendError::Closed(_)) => warn!(
            "Outbox for connection {} ({}) is closed, dropping frame",
            connection.id, connection.addr
        ),
    }
}
