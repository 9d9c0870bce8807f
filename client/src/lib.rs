//! # Hash Race Client Library
//!
//! Headless client for the hash race. A miner registers as a player, waits
//! for the round to reach `mining`, hashes `seed + nonce` until a hash starts
//! with the difficulty prefix and claims the win. An admin starts or resets
//! rounds and prints the live player list and ranking.
//!
//! ## Module Organization
//!
//! - `miner`: the miner state machine; pure and synchronous
//! - `network`: JSON-over-WebSocket connection to the server
//! - `session`: the async loops tying the two together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Connection;
//! use client::session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut conn = Connection::connect("ws://127.0.0.1:8080").await?;
//!     session::mine(&mut conn, "alice", 500).await?;
//!     Ok(())
//! }
//! ```

pub mod miner;
pub mod network;
pub mod session;
