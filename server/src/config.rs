use shared::{DEFAULT_COUNTDOWN_SECONDS, RANKING_LIMIT};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the round server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// First value broadcast by the pre-round countdown
    pub countdown_seconds: u32,
    /// Spacing between countdown ticks
    pub tick_interval: Duration,
    /// SQLite file holding historical winners
    pub database_path: PathBuf,
    /// Live connections accepted before new ones are refused
    pub max_connections: usize,
    /// Rows sent in every ranking message
    pub ranking_limit: usize,
    /// Keep-alive ping spacing per connection
    pub ping_interval: Duration,
    /// Frames queued per connection before further frames are dropped
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            countdown_seconds: DEFAULT_COUNTDOWN_SECONDS,
            tick_interval: Duration::from_secs(1),
            database_path: PathBuf::from("ranking.db"),
            max_connections: 64,
            ranking_limit: RANKING_LIMIT,
            ping_interval: Duration::from_secs(20),
            outbox_capacity: 256,
        }
    }
}
