//! Round state machine and winner-race resolution
//!
//! The [`RoundCoordinator`] owns every piece of mutable game state: the
//! connection registry, the player roster, the current round and the result
//! store. It is driven by a single stream of [`ServerEvent`]s, so inbound
//! messages and countdown ticks never interleave. The first `win` handled
//! while the round is mining takes the round; every later claim finds the
//! winner slot filled and is rejected.

use crate::config::ServerConfig;
use crate::connections::{ConnectionId, ConnectionRegistry, Outbound};
use crate::error::CommandError;
use crate::results::ResultStore;
use crate::roster::{PlayerRoster, SeedGenerator};
use log::{debug, error, info, warn};
use shared::{ClientMessage, ParticipantResult, Role, RoundStatus, ServerMessage, WinnerInfo};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Close reason sent to non-admin connections on reset
pub const RESET_CLOSE_REASON: &str = "Game Reset by Admin";
pub const SERVER_FULL_REASON: &str = "Server full";

/// Everything the coordinator reacts to, in arrival order
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        conn: ConnectionId,
        addr: SocketAddr,
        outbox: mpsc::Sender<Outbound>,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Malformed {
        conn: ConnectionId,
        reason: String,
    },
    Disconnected {
        conn: ConnectionId,
    },
    CountdownTick {
        round: u64,
    },
    /// Stops the server loop; the coordinator itself ignores it
    Shutdown,
}

/// Mutable state of the current round
#[derive(Debug, Clone, Default)]
pub struct RoundState {
    pub status: RoundStatus,
    pub winner: Option<WinnerInfo>,
    pub countdown_seconds_remaining: i64,
    /// Players who reported progress or a win this round, in first-report order
    pub participants: Vec<ParticipantResult>,
}

impl RoundState {
    fn participant_mut(&mut self, username: &str) -> &mut ParticipantResult {
        let index = match self
            .participants
            .iter()
            .position(|p| p.username == username)
        {
            Some(index) => index,
            None => {
                self.participants.push(ParticipantResult {
                    username: username.to_string(),
                    time: None,
                    hash_count: 0,
                    is_winner: false,
                });
                self.participants.len() - 1
            }
        };
        &mut self.participants[index]
    }

    fn clear(&mut self) {
        self.winner = None;
        self.participants.clear();
    }
}

/// Periodic tick source for one countdown
///
/// Dropping the timer aborts its task, so replacing or clearing the
/// coordinator's slot cancels it.
struct CountdownTimer {
    task: JoinHandle<()>,
}

impl CountdownTimer {
    fn spawn(round: u64, period: Duration, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // Skip the first tick since it fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if events.send(ServerEvent::CountdownTick { round }).is_err() {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serialized owner of the round, the roster and the results
pub struct RoundCoordinator {
    config: ServerConfig,
    registry: ConnectionRegistry,
    roster: PlayerRoster,
    round: RoundState,
    store: ResultStore,
    seeds: SeedGenerator,
    countdown: Option<CountdownTimer>,
    /// Bumped on every start and reset; ticks from older rounds are ignored
    round_number: u64,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl RoundCoordinator {
    pub fn new(
        config: &ServerConfig,
        store: ResultStore,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            config: config.clone(),
            registry: ConnectionRegistry::new(config.max_connections),
            roster: PlayerRoster::new(),
            round: RoundState {
                countdown_seconds_remaining: i64::from(config.countdown_seconds),
                ..RoundState::default()
            },
            store,
            seeds: SeedGenerator::new(),
            countdown: None,
            round_number: 0,
            events,
        }
    }

    pub fn status(&self) -> RoundStatus {
        self.round.status
    }

    pub fn winner(&self) -> Option<&WinnerInfo> {
        self.round.winner.as_ref()
    }

    pub fn participants(&self) -> &[ParticipantResult] {
        &self.round.participants
    }

    pub fn roster(&self) -> &PlayerRoster {
        &self.roster
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn round_number(&self) -> u64 {
        self.round_number
    }

    pub fn countdown_active(&self) -> bool {
        self.countdown.is_some()
    }

    /// Applies one event, including every broadcast it causes
    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { conn, addr, outbox } => self.on_connect(conn, addr, outbox),
            ServerEvent::Message { conn, message } => {
                let kind = message.kind();
                if let Err(e) = self.handle_message(conn, message) {
                    warn!("Ignoring {} from connection {}: {}", kind, conn, e);
                }
            }
            ServerEvent::Malformed { conn, reason } => {
                warn!(
                    "Ignoring message from connection {}: {}",
                    conn,
                    CommandError::Malformed(reason)
                );
            }
            ServerEvent::Disconnected { conn } => self.on_disconnect(conn),
            ServerEvent::CountdownTick { round } => self.on_countdown_tick(round),
            ServerEvent::Shutdown => debug!("Shutdown is handled by the server loop"),
        }
    }

    /// Validates and applies one client command
    pub fn handle_message(
        &mut self,
        conn: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), CommandError> {
        match message {
            ClientMessage::Register { username, role } => {
                self.register(conn, &username, role.unwrap_or_default())
            }
            ClientMessage::StartGame => {
                self.require_role(conn, "start_game", Role::Admin)?;
                self.start_round()
            }
            ClientMessage::ResetGame => {
                self.require_role(conn, "reset_game", Role::Admin)?;
                self.reset_round();
                Ok(())
            }
            ClientMessage::PlayerProgress { nonce, hash } => {
                let username = self.require_role(conn, "player_progress", Role::Player)?;
                self.record_progress(conn, &username, nonce, &hash)
            }
            ClientMessage::Win { time, hash_count } => {
                let username = self.require_role(conn, "win", Role::Player)?;
                self.claim_win(&username, time, hash_count)
            }
        }
    }

    fn require_role(
        &self,
        conn: ConnectionId,
        command: &'static str,
        required: Role,
    ) -> Result<String, CommandError> {
        let identity = self
            .registry
            .identity(conn)
            .ok_or(CommandError::Unregistered(conn))?;
        if identity.role != required {
            return Err(CommandError::Unauthorized {
                command,
                role: identity.role,
            });
        }
        Ok(identity.username.clone())
    }

    fn on_connect(
        &mut self,
        conn: ConnectionId,
        addr: SocketAddr,
        outbox: mpsc::Sender<Outbound>,
    ) {
        if !self.registry.add(conn, addr, outbox.clone()) {
            warn!("Refusing connection {} from {}: server full", conn, addr);
            let _ = outbox.try_send(Outbound::Close(SERVER_FULL_REASON.to_string()));
            return;
        }

        if let Some(ranking) = self.ranking_message() {
            self.registry.unicast(conn, &ranking);
        }
        self.registry.unicast(
            conn,
            &ServerMessage::State {
                state: self.round.status,
            },
        );

        // Late joiners see the finished round until an admin resets it
        if self.round.status == RoundStatus::Finished {
            if let Some(winner) = self.winner_message() {
                self.registry.unicast(conn, &winner);
            }
        }
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.registry.remove(conn) else {
            debug!("Connection {} was already untracked", conn);
            return;
        };

        if let Some(identity) = connection.identity {
            if !self.registry.is_username_live(&identity.username) {
                self.roster.mark_disconnected(&identity.username);
            }
            self.push_admin_snapshot();
        }
    }

    fn register(
        &mut self,
        conn: ConnectionId,
        username: &str,
        role: Role,
    ) -> Result<(), CommandError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(CommandError::EmptyUsername);
        }
        if self.registry.get(conn).is_none() {
            return Err(CommandError::Unregistered(conn));
        }

        if let Some(previous) = self.registry.bind(conn, username, role) {
            if previous.username != username && !self.registry.is_username_live(&previous.username)
            {
                self.roster.mark_disconnected(&previous.username);
            }
        }

        let registration = self.roster.register(username, role, &mut self.seeds);
        info!(
            "Registered {} as {} on connection {}{}",
            username,
            role,
            conn,
            if registration.reused { " (rejoined)" } else { "" }
        );

        if role == Role::Player {
            self.registry.unicast(
                conn,
                &ServerMessage::GameStartInfo {
                    base_data: registration.seed,
                    nonce: registration.nonce,
                },
            );
        }

        self.push_admin_snapshot();
        Ok(())
    }

    fn start_round(&mut self) -> Result<(), CommandError> {
        match self.round.status {
            RoundStatus::Idle | RoundStatus::Finished => {}
            status => {
                return Err(CommandError::InvalidState {
                    command: "start_game",
                    status,
                })
            }
        }

        self.round.clear();

        for username in self.registry.player_usernames() {
            let seed = self.seeds.next_seed(&username);
            if !self.roster.begin_round(&username, seed.clone()) {
                continue;
            }

            let start_info = ServerMessage::GameStartInfo {
                base_data: seed,
                nonce: 0,
            };
            for conn in self.registry.connections_of(&username) {
                let is_player = self
                    .registry
                    .get(conn)
                    .and_then(|connection| connection.role())
                    == Some(Role::Player);
                if is_player {
                    self.registry.unicast(conn, &start_info);
                }
            }
        }

        self.round_number += 1;
        self.round.status = RoundStatus::Countdown;
        self.round.countdown_seconds_remaining = i64::from(self.config.countdown_seconds);
        self.countdown = Some(CountdownTimer::spawn(
            self.round_number,
            self.config.tick_interval,
            self.events.clone(),
        ));
        info!(
            "Round {} countdown started ({}s)",
            self.round_number, self.config.countdown_seconds
        );

        self.registry.broadcast(&ServerMessage::State {
            state: RoundStatus::Countdown,
        });
        self.push_admin_snapshot();
        Ok(())
    }

    fn on_countdown_tick(&mut self, round: u64) {
        if round != self.round_number || self.round.status != RoundStatus::Countdown {
            debug!("Ignoring stale countdown tick for round {}", round);
            return;
        }

        let remaining = self.round.countdown_seconds_remaining;
        self.registry.broadcast(&ServerMessage::Countdown {
            seconds_left: u32::try_from(remaining).unwrap_or(0),
        });
        debug!("Round {} starts in {}s", round, remaining);

        self.round.countdown_seconds_remaining -= 1;
        if self.round.countdown_seconds_remaining < 0 {
            self.countdown = None;
            self.round.status = RoundStatus::Mining;
            info!("Round {} mining started", round);
            self.registry.broadcast(&ServerMessage::State {
                state: RoundStatus::Mining,
            });
        }
    }

    fn record_progress(
        &mut self,
        conn: ConnectionId,
        username: &str,
        nonce: u64,
        hash: &str,
    ) -> Result<(), CommandError> {
        if self.round.status != RoundStatus::Mining {
            return Err(CommandError::InvalidState {
                command: "player_progress",
                status: self.round.status,
            });
        }
        if !self.roster.upsert_progress(username, nonce, hash) {
            return Err(CommandError::Unregistered(conn));
        }

        let participant = self.round.participant_mut(username);
        participant.hash_count = nonce.saturating_add(1);
        participant.is_winner = false;

        self.registry
            .broadcast_to_admins(&ServerMessage::PlayerProgress {
                username: username.to_string(),
                nonce,
                hash: hash.to_string(),
            });
        Ok(())
    }

    fn claim_win(&mut self, username: &str, time: f64, hash_count: u64) -> Result<(), CommandError> {
        if !time.is_finite() || time < 0.0 {
            return Err(CommandError::Malformed(format!(
                "win time must be a non-negative number, got {time}"
            )));
        }
        if let Some(winner) = &self.round.winner {
            return Err(CommandError::AlreadyClaimed {
                winner: winner.username.clone(),
            });
        }
        if self.round.status != RoundStatus::Mining {
            return Err(CommandError::InvalidState {
                command: "win",
                status: self.round.status,
            });
        }

        self.round.winner = Some(WinnerInfo {
            username: username.to_string(),
            time,
        });
        self.round.status = RoundStatus::Finished;
        let participant = self.round.participant_mut(username);
        participant.time = Some(time);
        participant.hash_count = hash_count;
        participant.is_winner = true;
        info!(
            "Round {} won by {} in {:.2}s after {} hashes",
            self.round_number, username, time, hash_count
        );

        // The live result stands even if the ranking write fails
        let persisted = match self.store.append(username, time, hash_count) {
            Ok(record) => {
                info!("Recorded historical winner #{} ({})", record.id, username);
                true
            }
            Err(e) => {
                error!("Failed to record winner {}: {}", username, e);
                false
            }
        };

        if let Some(winner) = self.winner_message() {
            self.registry.broadcast(&winner);
        }
        self.registry.broadcast(&ServerMessage::State {
            state: RoundStatus::Finished,
        });
        if persisted {
            self.broadcast_ranking();
        }
        self.push_admin_snapshot();
        Ok(())
    }

    fn reset_round(&mut self) {
        self.countdown = None;
        self.round_number += 1;

        self.broadcast_ranking();

        for conn in self.registry.non_admin_ids() {
            self.registry.unicast(conn, &ServerMessage::GameReset);
            let Some(closed) = self.registry.close(conn, RESET_CLOSE_REASON) else {
                continue;
            };
            match closed.identity {
                Some(identity) => {
                    info!("Disconnecting {} for reset", identity.username);
                    if !self.registry.is_username_live(&identity.username) {
                        self.roster.mark_disconnected(&identity.username);
                    }
                }
                None => info!("Disconnecting unregistered connection {} for reset", conn),
            }
        }

        self.round.clear();
        self.round.status = RoundStatus::Idle;
        self.round.countdown_seconds_remaining = i64::from(self.config.countdown_seconds);

        let pruned = self.roster.prune_disconnected();
        self.roster.clear_mining_fields();
        info!(
            "Round reset; pruned {} roster entries, {} remain",
            pruned.len(),
            self.roster.len()
        );

        self.push_admin_snapshot();
        self.registry.broadcast(&ServerMessage::State {
            state: RoundStatus::Idle,
        });
    }

    fn push_admin_snapshot(&self) {
        self.registry
            .broadcast_to_admins(&ServerMessage::PlayerList {
                players: self.roster.snapshot(),
            });
        self.registry.broadcast_to_admins(&ServerMessage::State {
            state: self.round.status,
        });
    }

    fn broadcast_ranking(&self) {
        if let Some(ranking) = self.ranking_message() {
            self.registry.broadcast(&ranking);
        }
    }

    fn ranking_message(&self) -> Option<ServerMessage> {
        match self.store.ranking(self.config.ranking_limit) {
            Ok(data) => Some(ServerMessage::Ranking { data }),
            Err(e) => {
                error!("Failed to load ranking: {}", e);
                None
            }
        }
    }

    fn winner_message(&self) -> Option<ServerMessage> {
        self.round
            .winner
            .as_ref()
            .map(|winner| ServerMessage::Winner {
                winner: winner.clone(),
                all_participants: self.round.participants.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;
    use assert_approx_eq::assert_approx_eq;

    struct Harness {
        coordinator: RoundCoordinator,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        next_conn: ConnectionId,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(ServerConfig::default(), ResultStore::open_in_memory().unwrap())
        }

        fn with_store(config: ServerConfig, store: ResultStore) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                coordinator: RoundCoordinator::new(&config, store, tx),
                events: rx,
                next_conn: 1,
            }
        }

        fn connect(&mut self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
            let conn = self.next_conn;
            self.next_conn += 1;
            let (tx, rx) = mpsc::channel(ServerConfig::default().outbox_capacity);
            self.coordinator.handle_event(ServerEvent::Connected {
                conn,
                addr: "127.0.0.1:9000".parse().unwrap(),
                outbox: tx,
            });
            (conn, rx)
        }

        fn join(
            &mut self,
            username: &str,
            role: Role,
        ) -> (ConnectionId, mpsc::Receiver<Outbound>) {
            let (conn, mut rx) = self.connect();
            self.send(
                conn,
                ClientMessage::Register {
                    username: username.to_string(),
                    role: Some(role),
                },
            )
            .unwrap();
            drain(&mut rx);
            (conn, rx)
        }

        fn send(&mut self, conn: ConnectionId, message: ClientMessage) -> Result<(), CommandError> {
            self.coordinator.handle_message(conn, message)
        }

        fn tick(&mut self) {
            let round = self.coordinator.round_number();
            self.coordinator
                .handle_event(ServerEvent::CountdownTick { round });
        }

        fn start_mining(&mut self, admin: ConnectionId) {
            self.send(admin, ClientMessage::StartGame).unwrap();
            for _ in 0..=ServerConfig::default().countdown_seconds {
                self.tick();
            }
            assert_eq!(self.coordinator.status(), RoundStatus::Mining);
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        drain(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => Some(ServerMessage::from_json(&text).unwrap()),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    fn win(time: f64, hash_count: u64) -> ClientMessage {
        ClientMessage::Win { time, hash_count }
    }

    fn progress(nonce: u64) -> ClientMessage {
        ClientMessage::PlayerProgress {
            nonce,
            hash: format!("{nonce:064x}"),
        }
    }

    #[tokio::test]
    async fn test_connect_receives_ranking_then_state() {
        let mut h = Harness::new();
        h.coordinator.store().append("old", 3.5, 9).unwrap();

        let (_, mut rx) = h.connect();
        let received = messages(&mut rx);

        assert_eq!(received.len(), 2);
        match &received[0] {
            ServerMessage::Ranking { data } => assert_eq!(data[0].username, "old"),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(
            received[1],
            ServerMessage::State {
                state: RoundStatus::Idle
            }
        );
    }

    #[tokio::test]
    async fn test_register_sends_start_info_and_admin_snapshot() {
        let mut h = Harness::new();
        let (_, mut admin) = h.join("op", Role::Admin);

        let (conn, mut rx) = h.connect();
        drain(&mut rx);
        h.send(
            conn,
            ClientMessage::Register {
                username: "alice".to_string(),
                role: None,
            },
        )
        .unwrap();

        match messages(&mut rx).as_slice() {
            [ServerMessage::GameStartInfo { base_data, nonce }] => {
                assert!(base_data.contains("alice"));
                assert_eq!(*nonce, 0);
            }
            other => panic!("Unexpected messages: {:?}", other),
        }

        let admin_view = messages(&mut admin);
        match &admin_view[0] {
            ServerMessage::PlayerList { players } => {
                let names: Vec<&str> = players.iter().map(|p| p.username.as_str()).collect();
                assert_eq!(names, vec!["alice", "op"]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(
            admin_view[1],
            ServerMessage::State {
                state: RoundStatus::Idle
            }
        );
    }

    #[tokio::test]
    async fn test_register_rejects_empty_username() {
        let mut h = Harness::new();
        let (conn, _rx) = h.connect();

        let result = h.send(
            conn,
            ClientMessage::Register {
                username: "   ".to_string(),
                role: None,
            },
        );

        assert_eq!(result, Err(CommandError::EmptyUsername));
        assert!(h.coordinator.roster().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_register_reuses_entry() {
        let mut h = Harness::new();
        let (_, _first) = h.join("alice", Role::Player);
        let first_seed = h
            .coordinator
            .roster()
            .get("alice")
            .unwrap()
            .round_seed
            .clone();

        let (conn, mut rx) = h.connect();
        drain(&mut rx);
        h.send(
            conn,
            ClientMessage::Register {
                username: "alice".to_string(),
                role: None,
            },
        )
        .unwrap();

        assert_eq!(h.coordinator.roster().len(), 1);
        match messages(&mut rx).as_slice() {
            [ServerMessage::GameStartInfo { base_data, nonce }] => {
                assert_eq!(Some(base_data.clone()), first_seed);
                assert_eq!(*nonce, 0);
            }
            other => panic!("Unexpected messages: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_mid_round_resumes_seed_and_nonce() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (alice, mut alice_rx) = h.join("alice", Role::Player);
        h.start_mining(admin);
        let seed = messages(&mut alice_rx)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameStartInfo { base_data, .. } => Some(base_data),
                _ => None,
            })
            .unwrap();

        h.send(alice, progress(60)).unwrap();
        h.coordinator
            .handle_event(ServerEvent::Disconnected { conn: alice });
        assert!(!h.coordinator.roster().get("alice").unwrap().connected);

        let (conn, mut rejoined) = h.connect();
        let replay = messages(&mut rejoined);
        assert_eq!(
            replay.last(),
            Some(&ServerMessage::State {
                state: RoundStatus::Mining
            })
        );
        h.send(
            conn,
            ClientMessage::Register {
                username: "alice".to_string(),
                role: None,
            },
        )
        .unwrap();

        assert_eq!(
            messages(&mut rejoined),
            vec![ServerMessage::GameStartInfo {
                base_data: seed,
                nonce: 60
            }]
        );
        assert!(h.coordinator.roster().get("alice").unwrap().connected);
    }

    #[tokio::test]
    async fn test_start_requires_admin() {
        let mut h = Harness::new();
        let (alice, _rx) = h.join("alice", Role::Player);
        let (anon, _anon_rx) = h.connect();

        let err = h.send(alice, ClientMessage::StartGame).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Authorization);
        assert_eq!(
            h.send(anon, ClientMessage::StartGame),
            Err(CommandError::Unregistered(anon))
        );
        assert_eq!(h.coordinator.status(), RoundStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_issues_fresh_seeds_and_countdown_state() {
        let mut h = Harness::new();
        let (admin, mut admin_rx) = h.join("op", Role::Admin);
        let (_, mut alice_rx) = h.join("alice", Role::Player);
        let (_, mut bob_rx) = h.join("bob", Role::Player);

        h.send(admin, ClientMessage::StartGame).unwrap();

        let seed_of = |received: Vec<ServerMessage>| -> String {
            assert_eq!(
                received.last(),
                Some(&ServerMessage::State {
                    state: RoundStatus::Countdown
                })
            );
            received
                .into_iter()
                .find_map(|m| match m {
                    ServerMessage::GameStartInfo { base_data, nonce } => {
                        assert_eq!(nonce, 0);
                        Some(base_data)
                    }
                    _ => None,
                })
                .unwrap()
        };
        let alice_seed = seed_of(messages(&mut alice_rx));
        let bob_seed = seed_of(messages(&mut bob_rx));
        assert_ne!(alice_seed, bob_seed);

        assert!(!messages(&mut admin_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::GameStartInfo { .. })));
        assert_eq!(h.coordinator.status(), RoundStatus::Countdown);
        assert!(h.coordinator.countdown_active());
    }

    #[tokio::test]
    async fn test_start_ignored_outside_idle_or_finished() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (_, mut alice_rx) = h.join("alice", Role::Player);

        h.send(admin, ClientMessage::StartGame).unwrap();
        drain(&mut alice_rx);

        let err = h.send(admin, ClientMessage::StartGame).unwrap_err();
        assert_eq!(
            err,
            CommandError::InvalidState {
                command: "start_game",
                status: RoundStatus::Countdown
            }
        );
        assert!(drain(&mut alice_rx).is_empty());

        for _ in 0..=5 {
            h.tick();
        }
        assert!(h.send(admin, ClientMessage::StartGame).is_err());
        assert_eq!(h.coordinator.status(), RoundStatus::Mining);
    }

    #[tokio::test]
    async fn test_countdown_ticks_then_mining() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (_, mut rx) = h.join("alice", Role::Player);
        h.send(admin, ClientMessage::StartGame).unwrap();
        drain(&mut rx);

        for _ in 0..=5 {
            h.tick();
        }

        let received = messages(&mut rx);
        let countdown: Vec<u32> = received
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Countdown { seconds_left } => Some(*seconds_left),
                _ => None,
            })
            .collect();
        assert_eq!(countdown, vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(
            received.last(),
            Some(&ServerMessage::State {
                state: RoundStatus::Mining
            })
        );
        assert!(!h.coordinator.countdown_active());

        // Extra ticks after the transition change nothing
        h.tick();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_timer_drives_round_to_mining() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (_, mut rx) = h.join("alice", Role::Player);
        h.send(admin, ClientMessage::StartGame).unwrap();

        let started = tokio::time::Instant::now();
        while h.coordinator.status() == RoundStatus::Countdown {
            let event = h.events.recv().await.unwrap();
            h.coordinator.handle_event(event);
        }

        assert_eq!(h.coordinator.status(), RoundStatus::Mining);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));
        let mining_states = messages(&mut rx)
            .into_iter()
            .filter(|m| {
                *m == ServerMessage::State {
                    state: RoundStatus::Mining,
                }
            })
            .count();
        assert_eq!(mining_states, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_countdown() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        h.send(admin, ClientMessage::StartGame).unwrap();
        let stale_round = h.coordinator.round_number();

        h.send(admin, ClientMessage::ResetGame).unwrap();
        assert!(!h.coordinator.countdown_active());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.events.try_recv().is_err());

        // A tick queued before the reset must not revive the round
        h.coordinator
            .handle_event(ServerEvent::CountdownTick { round: stale_round });
        assert_eq!(h.coordinator.status(), RoundStatus::Idle);
    }

    #[tokio::test]
    async fn test_progress_only_while_mining() {
        let mut h = Harness::new();
        let (admin, mut admin_rx) = h.join("op", Role::Admin);
        let (alice, _rx) = h.join("alice", Role::Player);

        let err = h.send(alice, progress(10)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Protocol);
        assert_eq!(
            h.coordinator.roster().get("alice").unwrap().latest_nonce,
            Some(0)
        );
        assert!(h.coordinator.participants().is_empty());

        h.start_mining(admin);
        drain(&mut admin_rx);
        h.send(alice, progress(10)).unwrap();

        assert_eq!(
            h.coordinator.roster().get("alice").unwrap().latest_nonce,
            Some(10)
        );
        assert_eq!(h.coordinator.participants()[0].hash_count, 11);
        assert_eq!(h.coordinator.participants()[0].time, None);
        assert_eq!(
            messages(&mut admin_rx),
            vec![ServerMessage::PlayerProgress {
                username: "alice".to_string(),
                nonce: 10,
                hash: format!("{:064x}", 10),
            }]
        );
    }

    #[tokio::test]
    async fn test_progress_from_admin_is_unauthorized() {
        let mut h = Harness::new();
        let (admin, _rx) = h.join("op", Role::Admin);
        h.start_mining(admin);

        let err = h.send(admin, progress(1)).unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Authorization);
    }

    #[tokio::test]
    async fn test_first_win_takes_the_round() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, mut a_rx) = h.join("a", Role::Player);
        let (b, mut b_rx) = h.join("b", Role::Player);
        h.start_mining(admin);
        h.send(b, progress(20)).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.send(a, win(10.1, 57)).unwrap();
        let err = h.send(b, win(10.3, 40)).unwrap_err();

        assert_eq!(
            err,
            CommandError::AlreadyClaimed {
                winner: "a".to_string()
            }
        );
        assert_eq!(h.coordinator.status(), RoundStatus::Finished);
        assert_eq!(h.coordinator.winner().unwrap().username, "a");

        let participants = h.coordinator.participants();
        let a_result = participants.iter().find(|p| p.username == "a").unwrap();
        let b_result = participants.iter().find(|p| p.username == "b").unwrap();
        assert!(a_result.is_winner);
        assert_eq!(a_result.hash_count, 57);
        assert!(!b_result.is_winner);
        assert_eq!(b_result.hash_count, 21);

        let records = h.coordinator.store().top_n(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].username, "a");
        assert_approx_eq!(records[0].time, 10.1);

        let received = messages(&mut b_rx);
        assert!(matches!(received[0], ServerMessage::Winner { .. }));
        assert_eq!(
            received[1],
            ServerMessage::State {
                state: RoundStatus::Finished
            }
        );
        match &received[2] {
            ServerMessage::Ranking { data } => assert_eq!(data.len(), 1),
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_win_rejected_outside_mining() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, _rx) = h.join("a", Role::Player);

        assert!(h.send(a, win(1.0, 1)).is_err());
        h.send(admin, ClientMessage::StartGame).unwrap();
        assert!(h.send(a, win(1.0, 1)).is_err());

        assert!(h.coordinator.winner().is_none());
        assert!(h.coordinator.store().top_n(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_win_with_invalid_time_is_malformed() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, _rx) = h.join("a", Role::Player);
        h.start_mining(admin);

        assert!(matches!(
            h.send(a, win(f64::NAN, 1)),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            h.send(a, win(-1.0, 1)),
            Err(CommandError::Malformed(_))
        ));
        assert_eq!(h.coordinator.status(), RoundStatus::Mining);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_finished_round() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, _rx) = h.join("a", Role::Player);
        h.start_mining(admin);
        h.send(a, win(4.2, 8)).unwrap();

        let (_, mut late) = h.connect();
        let received = messages(&mut late);

        assert_eq!(received.len(), 3);
        assert_eq!(
            received[1],
            ServerMessage::State {
                state: RoundStatus::Finished
            }
        );
        match &received[2] {
            ServerMessage::Winner {
                winner,
                all_participants,
            } => {
                assert_eq!(winner.username, "a");
                assert_eq!(all_participants.len(), 1);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_round_after_finish() {
        let mut h = Harness::new();
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, mut a_rx) = h.join("a", Role::Player);
        h.start_mining(admin);
        h.send(a, win(4.2, 8)).unwrap();
        let first_seed = h.coordinator.roster().get("a").unwrap().round_seed.clone();
        drain(&mut a_rx);

        h.send(admin, ClientMessage::StartGame).unwrap();

        assert_eq!(h.coordinator.status(), RoundStatus::Countdown);
        assert!(h.coordinator.winner().is_none());
        assert!(h.coordinator.participants().is_empty());
        assert_ne!(
            h.coordinator.roster().get("a").unwrap().round_seed,
            first_seed
        );
    }

    #[tokio::test]
    async fn test_reset_closes_non_admins_and_prunes() {
        let mut h = Harness::new();
        let (admin, mut admin_rx) = h.join("op", Role::Admin);
        let (a, mut a_rx) = h.join("a", Role::Player);
        let (gone, _gone_rx) = h.join("gone", Role::Player);
        let (_, mut anon_rx) = h.connect();
        h.start_mining(admin);
        h.send(a, progress(5)).unwrap();
        h.coordinator
            .handle_event(ServerEvent::Disconnected { conn: gone });
        drain(&mut a_rx);
        drain(&mut anon_rx);
        drain(&mut admin_rx);

        h.send(admin, ClientMessage::ResetGame).unwrap();

        let frames = drain(&mut a_rx);
        assert!(matches!(&frames[0], Outbound::Text(t) if t.contains("\"ranking\"")));
        assert_eq!(
            frames[1],
            Outbound::Text(ServerMessage::GameReset.to_json().unwrap())
        );
        assert_eq!(frames[2], Outbound::Close(RESET_CLOSE_REASON.to_string()));
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            drain(&mut anon_rx).last(),
            Some(Outbound::Close(_))
        ));

        assert_eq!(h.coordinator.status(), RoundStatus::Idle);
        assert!(h.coordinator.winner().is_none());
        assert!(h.coordinator.participants().is_empty());
        assert_eq!(h.coordinator.registry().len(), 1);

        let roster = h.coordinator.roster();
        assert_eq!(roster.len(), 1);
        let op = roster.get("op").unwrap();
        assert_eq!(op.latest_nonce, None);
        assert_eq!(op.round_seed, None);
        assert!(op.connected);

        let admin_view = messages(&mut admin_rx);
        assert!(matches!(admin_view[0], ServerMessage::Ranking { .. }));
        assert_eq!(
            admin_view.last(),
            Some(&ServerMessage::State {
                state: RoundStatus::Idle
            })
        );

        // The closed socket reporting in later is harmless
        h.coordinator.handle_event(ServerEvent::Disconnected { conn: a });
        assert_eq!(h.coordinator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_pushes_admin_snapshot() {
        let mut h = Harness::new();
        let (_, mut admin_rx) = h.join("op", Role::Admin);
        let (a, _a_rx) = h.join("a", Role::Player);
        drain(&mut admin_rx);

        h.coordinator.handle_event(ServerEvent::Disconnected { conn: a });

        match &messages(&mut admin_rx)[0] {
            ServerMessage::PlayerList { players } => {
                let a = players.iter().find(|p| p.username == "a").unwrap();
                assert!(!a.connected);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(h.coordinator.roster().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_username_live_on_other_connection() {
        let mut h = Harness::new();
        let (first, _first_rx) = h.join("a", Role::Player);
        let (_, _second_rx) = h.join("a", Role::Player);

        h.coordinator
            .handle_event(ServerEvent::Disconnected { conn: first });

        assert!(h.coordinator.roster().get("a").unwrap().connected);
    }

    #[tokio::test]
    async fn test_server_full_refuses_connection() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let mut h = Harness::with_store(config, ResultStore::open_in_memory().unwrap());
        let (_, _first) = h.connect();

        let (_, mut refused) = h.connect();

        assert_eq!(
            drain(&mut refused),
            vec![Outbound::Close(SERVER_FULL_REASON.to_string())]
        );
        assert_eq!(h.coordinator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_live_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranking.db");
        let store = ResultStore::open(&path).unwrap();
        let mut h = Harness::with_store(ServerConfig::default(), store);
        let (admin, _admin_rx) = h.join("op", Role::Admin);
        let (a, mut a_rx) = h.join("a", Role::Player);
        h.start_mining(admin);
        drain(&mut a_rx);

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE historical_winners")
            .unwrap();

        h.send(a, win(3.3, 12)).unwrap();

        assert_eq!(h.coordinator.status(), RoundStatus::Finished);
        let received = messages(&mut a_rx);
        assert!(matches!(received[0], ServerMessage::Winner { .. }));
        assert_eq!(
            received[1],
            ServerMessage::State {
                state: RoundStatus::Finished
            }
        );
        assert!(!received
            .iter()
            .any(|m| matches!(m, ServerMessage::Ranking { .. })));
    }

    #[tokio::test]
    async fn test_malformed_event_changes_nothing() {
        let mut h = Harness::new();
        let (conn, mut rx) = h.connect();
        drain(&mut rx);

        h.coordinator.handle_event(ServerEvent::Malformed {
            conn,
            reason: "unknown variant `cheat`".to_string(),
        });

        assert!(drain(&mut rx).is_empty());
        assert_eq!(h.coordinator.status(), RoundStatus::Idle);
        assert_eq!(h.coordinator.registry().len(), 1);
    }
}
