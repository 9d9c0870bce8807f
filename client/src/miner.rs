//! Miner state machine driven by server events

use log::{debug, info};
use shared::{
    compute_hash, meets_difficulty, ClientMessage, RoundStatus, ServerMessage,
    PROGRESS_REPORT_INTERVAL,
};
use std::time::Instant;

/// What a miner knows about the current round
#[derive(Debug, Clone, Default)]
pub struct MinerState {
    seed: Option<String>,
    nonce: u64,
    active: bool,
    started_at: Option<Instant>,
    hashes_since_report: u64,
    last_hash: Option<String>,
}

impl MinerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn seed(&self) -> Option<&str> {
        self.seed.as_deref()
    }

    /// Applies one server event to the miner
    pub fn on_message(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::State { state } => match state {
                RoundStatus::Mining => {
                    self.active = self.seed.is_some();
                    if self.started_at.is_none() {
                        self.started_at = Some(Instant::now());
                    }
                    info!("Mining started at nonce {}", self.nonce);
                }
                RoundStatus::Idle | RoundStatus::Finished => self.stop(),
                RoundStatus::Countdown => {}
            },
            ServerMessage::Countdown { seconds_left } => {
                debug!("Mining starts in {}s", seconds_left);
                self.stop();
            }
            ServerMessage::GameStartInfo { base_data, nonce } => {
                self.seed = Some(base_data.clone());
                self.nonce = *nonce;
                self.hashes_since_report = 0;
                self.last_hash = None;
            }
            ServerMessage::Winner { .. } => {
                self.active = false;
                self.hashes_since_report = 0;
            }
            ServerMessage::GameReset => {
                self.stop();
                self.seed = None;
                self.nonce = 0;
            }
            ServerMessage::PlayerProgress { .. }
            | ServerMessage::PlayerList { .. }
            | ServerMessage::Ranking { .. } => {}
        }
    }

    /// Hashes the current nonce and advances it
    ///
    /// Returns the messages to send: a progress report every
    /// `PROGRESS_REPORT_INTERVAL` hashes and a win claim once a hash meets
    /// the difficulty. Does nothing while inactive.
    pub fn step(&mut self) -> Vec<ClientMessage> {
        let mut outgoing = Vec::new();
        if !self.active {
            return outgoing;
        }
        let Some(seed) = self.seed.as_deref() else {
            return outgoing;
        };

        let hash = compute_hash(seed, self.nonce);
        self.hashes_since_report += 1;

        if self.hashes_since_report >= PROGRESS_REPORT_INTERVAL {
            outgoing.push(ClientMessage::PlayerProgress {
                nonce: self.nonce + 1,
                hash: hash.clone(),
            });
            self.hashes_since_report = 0;
        }

        if meets_difficulty(&hash) {
            let time = self
                .started_at
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or_default();
            info!("Found {} at nonce {} after {:.2}s", hash, self.nonce, time);
            outgoing.push(ClientMessage::Win {
                time,
                hash_count: self.nonce + 1,
            });
            self.active = false;
        }

        self.last_hash = Some(hash);
        self.nonce += 1;
        outgoing
    }

    /// Progress not yet reported, to be sent before leaving mid-round
    pub fn flush_progress(&mut self) -> Option<ClientMessage> {
        if !self.active || self.hashes_since_report == 0 {
            return None;
        }
        let hash = self.last_hash.clone()?;
        self.hashes_since_report = 0;
        Some(ClientMessage::PlayerProgress {
            nonce: self.nonce,
            hash,
        })
    }

    fn stop(&mut self) {
        self.active = false;
        self.started_at = None;
        self.hashes_since_report = 0;
    }
}
