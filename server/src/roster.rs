//! Per-username round progress that survives reconnects

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{PlayerSummary, Role};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Round progress tracked for one username
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerProgress {
    pub role: Role,
    /// Next nonce the player will hash; `None` after a reset
    pub latest_nonce: Option<u64>,
    pub latest_hash: Option<String>,
    /// Seed issued for the current round; `None` after a reset
    pub round_seed: Option<String>,
    pub connected: bool,
}

/// Seed and nonce a registering connection should resume from
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub seed: String,
    pub nonce: u64,
    /// True if an existing entry was reused
    pub reused: bool,
}

/// One entry per username, kept across reconnects until pruned by a reset
#[derive(Debug, Default)]
pub struct PlayerRoster {
    players: BTreeMap<String, PlayerProgress>,
}

impl PlayerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `username` connected, creating its entry on first sight
    ///
    /// A reused entry keeps its seed and nonce so a reconnecting player picks
    /// up where they left off. Entries without a seed get a fresh one.
    pub fn register(
        &mut self,
        username: &str,
        role: Role,
        seeds: &mut SeedGenerator,
    ) -> Registration {
        if self.mark_connected(username) {
            if let Some(entry) = self.players.get_mut(username) {
                entry.role = role;
                if entry.round_seed.is_none() {
                    entry.round_seed = Some(seeds.next_seed(username));
                    entry.latest_nonce = Some(0);
                }
                return Registration {
                    seed: entry.round_seed.clone().unwrap_or_default(),
                    nonce: entry.latest_nonce.unwrap_or(0),
                    reused: true,
                };
            }
        }

        let seed = seeds.next_seed(username);
        self.players.insert(
            username.to_string(),
            PlayerProgress {
                role,
                latest_nonce: Some(0),
                latest_hash: None,
                round_seed: Some(seed.clone()),
                connected: true,
            },
        );
        info!("Added {} to roster as {}", username, role);

        Registration {
            seed,
            nonce: 0,
            reused: false,
        }
    }

    /// Issues a new round seed and rewinds the nonce
    pub fn begin_round(&mut self, username: &str, seed: String) -> bool {
        match self.players.get_mut(username) {
            Some(entry) => {
                entry.round_seed = Some(seed);
                entry.latest_nonce = Some(0);
                entry.latest_hash = None;
                true
            }
            None => false,
        }
    }

    pub fn upsert_progress(&mut self, username: &str, nonce: u64, hash: &str) -> bool {
        match self.players.get_mut(username) {
            Some(entry) => {
                entry.latest_nonce = Some(nonce);
                entry.latest_hash = Some(hash.to_string());
                debug!("{} reached nonce {}", username, nonce);
                true
            }
            None => false,
        }
    }

    pub fn mark_connected(&mut self, username: &str) -> bool {
        self.set_connected(username, true)
    }

    pub fn mark_disconnected(&mut self, username: &str) -> bool {
        self.set_connected(username, false)
    }

    fn set_connected(&mut self, username: &str, connected: bool) -> bool {
        match self.players.get_mut(username) {
            Some(entry) => {
                entry.connected = connected;
                true
            }
            None => false,
        }
    }

    /// Drops every entry whose owner is not connected, returning their names
    pub fn prune_disconnected(&mut self) -> Vec<String> {
        let pruned: Vec<String> = self
            .players
            .iter()
            .filter(|(_, entry)| !entry.connected)
            .map(|(username, _)| username.clone())
            .collect();

        for username in &pruned {
            self.players.remove(username);
            info!("Pruned {} from roster", username);
        }
        pruned
    }

    /// Replaces the mining fields of every remaining entry with placeholders
    pub fn clear_mining_fields(&mut self) {
        for entry in self.players.values_mut() {
            entry.latest_nonce = None;
            entry.latest_hash = None;
            entry.round_seed = None;
            entry.connected = true;
        }
    }

    pub fn get(&self, username: &str) -> Option<&PlayerProgress> {
        self.players.get(username)
    }

    /// Admin view of the roster, ordered by username
    pub fn snapshot(&self) -> Vec<PlayerSummary> {
        self.players
            .iter()
            .map(|(username, entry)| PlayerSummary {
                username: username.clone(),
                latest_nonce: entry.latest_nonce,
                latest_hash: entry.latest_hash.clone(),
                connected: entry.connected,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

/// Produces per-player round seeds
///
/// Seeds start with a per-process sequence number, so no two seeds handed
/// out by the same generator are equal.
pub struct SeedGenerator {
    sequence: u64,
    rng: StdRng,
}

impl SeedGenerator {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn next_seed(&mut self, username: &str) -> String {
        self.sequence += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        let salt: u32 = self.rng.gen();
        format!("{:x}-{}-{}-{:08x}", self.sequence, username, millis, salt)
    }
}

impl Default for SeedGenerator {
    fn default() -> Self {
        Self::new()
    }
}
