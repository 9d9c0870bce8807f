use clap::{Parser, Subcommand, ValueEnum};
use client::network::Connection;
use client::session::{self, AdminAction};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Join as a player and mine
    Miner {
        /// Username to register with
        #[arg(short = 'n', long)]
        name: String,

        /// Hashes per second
        #[arg(short = 'r', long, default_value = "200")]
        rate: u32,
    },
    /// Join as an admin
    Admin {
        #[arg(value_enum)]
        action: Action,

        /// Username to register with
        #[arg(short = 'n', long, default_value = "admin")]
        name: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    /// Start a round, then watch
    Start,
    /// Reset the round, then watch
    Reset,
    /// Only watch
    Watch,
}

impl From<Action> for AdminAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Start => AdminAction::Start,
            Action::Reset => AdminAction::Reset,
            Action::Watch => AdminAction::Watch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let mut conn = Connection::connect(&args.server).await?;

    match args.mode {
        Mode::Miner { name, rate } => {
            info!("Mining as {} at {} hashes/s", name, rate);
            session::mine(&mut conn, &name, rate).await?;
        }
        Mode::Admin { action, name } => {
            session::administer(&mut conn, &name, action.into()).await?;
        }
    }

    Ok(())
}
