//! Long-running miner and admin sessions

use crate::miner::MinerState;
use crate::network::Connection;
use log::info;
use shared::{ClientMessage, PlayerSummary, Role, ServerMessage};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Admin command issued right after registering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Start,
    Reset,
    Watch,
}

/// Registers as a player and mines at `rate` hashes per second
///
/// Returns when the server closes the connection (for example on reset) or
/// on Ctrl+C, after reporting any unsent progress.
pub async fn mine(
    conn: &mut Connection,
    username: &str,
    rate: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    conn.send(&ClientMessage::Register {
        username: username.to_string(),
        role: Some(Role::Player),
    })
    .await?;

    let mut miner = MinerState::new();
    let mut hashing = interval(Duration::from_secs_f64(1.0 / f64::from(rate.max(1))));
    hashing.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            incoming = conn.recv() => {
                let Some(message) = incoming? else {
                    info!("Server closed the connection: {}", conn.close_reason().unwrap_or("no reason"));
                    return Ok(());
                };
                print_event(&message);
                miner.on_message(&message);
            },

            _ = hashing.tick(), if miner.is_active() => {
                for message in miner.step() {
                    conn.send(&message).await?;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                if let Some(progress) = miner.flush_progress() {
                    conn.send(&progress).await?;
                }
                conn.close().await;
                return Ok(());
            },
        }
    }
}

/// Registers as an admin, issues `action` and prints the live view
pub async fn administer(
    conn: &mut Connection,
    username: &str,
    action: AdminAction,
) -> Result<(), Box<dyn std::error::Error>> {
    conn.send(&ClientMessage::Register {
        username: username.to_string(),
        role: Some(Role::Admin),
    })
    .await?;

    match action {
        AdminAction::Start => conn.send(&ClientMessage::StartGame).await?,
        AdminAction::Reset => conn.send(&ClientMessage::ResetGame).await?,
        AdminAction::Watch => {}
    }

    loop {
        tokio::select! {
            incoming = conn.recv() => {
                let Some(message) = incoming? else {
                    info!("Server closed the connection: {}", conn.close_reason().unwrap_or("no reason"));
                    return Ok(());
                };
                print_event(&message);
            },

            _ = tokio::signal::ctrl_c() => {
                conn.close().await;
                return Ok(());
            },
        }
    }
}

fn print_event(message: &ServerMessage) {
    match message {
        ServerMessage::State { state } => println!("state: {}", state),
        ServerMessage::Countdown { seconds_left } => println!("starting in {}s", seconds_left),
        ServerMessage::GameStartInfo { base_data, nonce } => {
            println!("seed {} from nonce {}", base_data, nonce)
        }
        ServerMessage::PlayerProgress {
            username, nonce, ..
        } => println!("{} at nonce {}", username, nonce),
        ServerMessage::PlayerList { players } => {
            println!("{:<20} {:>10} {:<10} {}", "player", "nonce", "hash", "online");
            for player in players {
                println!("{}", player_row(player));
            }
        }
        ServerMessage::Winner {
            winner,
            all_participants,
        } => {
            println!("winner: {} in {:.2}s", winner.username, winner.time);
            for participant in all_participants {
                println!(
                    "  {:<20} {:>10} hashes{}",
                    participant.username,
                    participant.hash_count,
                    if participant.is_winner { " *" } else { "" }
                );
            }
        }
        ServerMessage::Ranking { data } => {
            println!("{:<4} {:<20} {:>8} {:>10}", "#", "username", "time", "hashes");
            for (i, entry) in data.iter().enumerate() {
                println!(
                    "{:<4} {:<20} {:>8.2} {:>10}",
                    i + 1,
                    entry.username,
                    entry.time,
                    entry.hash_count
                );
            }
        }
        ServerMessage::GameReset => println!("round reset by admin"),
    }
}

/// One admin table row. Hashes are player-reported, so they are cut by
/// characters rather than bytes.
fn player_row(player: &PlayerSummary) -> String {
    let nonce = player
        .latest_nonce
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
    let hash: String = match player.latest_hash.as_deref() {
        Some(hash) => hash.chars().take(8).collect(),
        None => "-".to_string(),
    };
    format!(
        "{:<20} {:>10} {:<10} {}",
        player.username, nonce, hash, player.connected
    )
}
