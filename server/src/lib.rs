//! # Hash Race Server Library
//!
//! This library provides the authoritative coordinator for the hash race. It
//! owns the round lifecycle, tracks who is connected, relays progress to
//! admins and persists every confirmed winner.
//!
//! ## Core Responsibilities
//!
//! ### Round Lifecycle
//! A round moves `idle -> countdown -> mining -> finished` and back to `idle`
//! on reset. Admins start and reset rounds; the first valid win claim during
//! mining finishes the round.
//!
//! ### Connection Management
//! Handles the lifecycle of WebSocket connections:
//! - Registration as player or admin
//! - Reconnection to a username's existing progress
//! - Forced closure of non-admins when a round is reset
//!
//! ### Historical Ranking
//! Winners are appended to a SQLite table and the fastest ten are sent to
//! every connection on connect, after a win and on reset.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! Connection tasks and the countdown timer never touch round state. They
//! post [`round::ServerEvent`]s into one channel, and [`network::Server::run`]
//! applies them one at a time. Deciding a winner is therefore a plain
//! check-and-set with no locking.
//!
//! ## Module Organization
//!
//! - `config`: tunables with their defaults
//! - `connections`: live connections and fan-out
//! - `error`: rejection and failure types
//! - `network`: WebSocket acceptor and the event loop
//! - `results`: SQLite-backed winner history
//! - `roster`: per-username progress across reconnects
//! - `round`: the round state machine
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connections;
pub mod error;
pub mod network;
pub mod results;
pub mod roster;
pub mod round;
