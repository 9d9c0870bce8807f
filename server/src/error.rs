//! Error types for the round server
//!
//! Rejected client commands never produce a reply. The coordinator returns a
//! [`CommandError`] and the event loop logs it.

use crate::connections::ConnectionId;
use shared::{Role, RoundStatus};

/// Broad category of a rejected command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Protocol,
    Authorization,
}

/// A client command that was ignored
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("connection {0} sent a command before registering")]
    Unregistered(ConnectionId),

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("{command} is not allowed for role {role}")]
    Unauthorized { command: &'static str, role: Role },

    #[error("{command} rejected while round is {status}")]
    InvalidState {
        command: &'static str,
        status: RoundStatus,
    },

    #[error("win already claimed by {winner}")]
    AlreadyClaimed { winner: String },
}

impl CommandError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            CommandError::Unauthorized { .. } => RejectionKind::Authorization,
            _ => RejectionKind::Protocol,
        }
    }
}

/// Failure of the historical results storage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors that stop the server or a single connection
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("result store error: {0}")]
    Store(#[from] StoreError),
}
