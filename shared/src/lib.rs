use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const DEFAULT_COUNTDOWN_SECONDS: u32 = 5;
pub const RANKING_LIMIT: usize = 10;
pub const DIFFICULTY_PREFIX: &str = "00";
pub const PROGRESS_REPORT_INTERVAL: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Player,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Player => write!(f, "player"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    #[default]
    Idle,
    Countdown,
    Mining,
    Finished,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStatus::Idle => "idle",
            RoundStatus::Countdown => "countdown",
            RoundStatus::Mining => "mining",
            RoundStatus::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Messages sent from a client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    StartGame,
    ResetGame,
    PlayerProgress {
        nonce: u64,
        hash: String,
    },
    Win {
        #[serde(deserialize_with = "number_or_string")]
        time: f64,
        #[serde(rename = "hashCount")]
        hash_count: u64,
    },
}

impl ClientMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wire name of the message, used in log lines and rejections
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::StartGame => "start_game",
            ClientMessage::ResetGame => "reset_game",
            ClientMessage::PlayerProgress { .. } => "player_progress",
            ClientMessage::Win { .. } => "win",
        }
    }
}

/// Messages sent from the server to one or more clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State {
        state: RoundStatus,
    },
    Countdown {
        #[serde(rename = "secondsLeft")]
        seconds_left: u32,
    },
    GameStartInfo {
        #[serde(rename = "baseData")]
        base_data: String,
        nonce: u64,
    },
    PlayerProgress {
        username: String,
        nonce: u64,
        hash: String,
    },
    PlayerList {
        players: Vec<PlayerSummary>,
    },
    Winner {
        winner: WinnerInfo,
        #[serde(rename = "allParticipants")]
        all_participants: Vec<ParticipantResult>,
    },
    Ranking {
        data: Vec<RankingEntry>,
    },
    GameReset,
}

impl ServerMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One row of the admin player list. `None` is shown as a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub username: String,
    pub latest_nonce: Option<u64>,
    pub latest_hash: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerInfo {
    pub username: String,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantResult {
    pub username: String,
    pub time: Option<f64>,
    pub hash_count: u64,
    pub is_winner: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub username: String,
    pub time: f64,
    pub hash_count: u64,
}

// Browser miners report the elapsed time as a fixed-point string ("12.34").
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Hashes `seed` followed by the decimal `nonce`, returned as lowercase hex
pub fn compute_hash(seed: &str, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn meets_difficulty(hash: &str) -> bool {
    hash.starts_with(DIFFICULTY_PREFIX)
}
