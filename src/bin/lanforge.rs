//! LanForge: peer-hosted LAN rooms with automatic host migration.
//!
//! Run with:
//! ```not_rust
//! lanforge host Alice
//! lanforge discover
//! lanforge join Bob X7QK2P
//! ```
//!
//! During a session, typed lines are chat; `/kick <deviceId>` removes a
//! member (host only), `/leave` leaves the room, `/quit` exits.

use std::time::Duration;

use clap::{Parser, Subcommand};

use lanforge::cli::{self, SessionOptions};
use lanforge::common::logger::setup_logger;
use lanforge::coordinator::COORDINATOR_PORT;
use lanforge::discovery::DISCOVERY_PORT;

#[derive(Parser, Debug)]
#[command(name = "lanforge")]
#[command(about = "Offline LAN multiplayer rooms with peer-hosted coordination", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a coordinator, create a room, and announce it on the LAN
    Host {
        /// Display name (falls back to LANFORGE_CLIENT_NAME)
        name: Option<String>,

        /// Port for the coordinator WebSocket listener
        #[arg(long, default_value_t = COORDINATOR_PORT)]
        port: u16,

        /// UDP port for announcements
        #[arg(long, default_value_t = DISCOVERY_PORT)]
        discovery_port: u16,
    },

    /// Listen for room announcements and print each discovered room
    Discover {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = 5)]
        window_secs: u64,

        /// UDP port to listen on
        #[arg(long, default_value_t = DISCOVERY_PORT)]
        discovery_port: u16,
    },

    /// Connect to a coordinator and join a room by its code
    Join {
        /// Display name
        name: String,

        /// 6-character join code
        join_code: Option<String>,

        /// Coordinator URL (falls back to LANFORGE_SERVER_URL)
        #[arg(long)]
        url: Option<String>,

        /// Port this peer would host on if elected after a migration
        #[arg(long, default_value_t = COORDINATOR_PORT)]
        port: u16,

        /// UDP port for discovery during migration
        #[arg(long, default_value_t = DISCOVERY_PORT)]
        discovery_port: u16,
    },
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();
    let result = match args.command {
        Command::Host {
            name,
            port,
            discovery_port,
        } => {
            cli::run_host(
                name,
                SessionOptions {
                    coordinator_port: port,
                    discovery_port,
                },
            )
            .await
        }
        Command::Discover {
            window_secs,
            discovery_port,
        } => cli::run_discover(Duration::from_secs(window_secs), discovery_port).await,
        Command::Join {
            name,
            join_code,
            url,
            port,
            discovery_port,
        } => {
            let Some(join_code) = join_code else {
                tracing::error!("join requires a join code");
                std::process::exit(1);
            };
            cli::run_join(
                name,
                join_code,
                url,
                SessionOptions {
                    coordinator_port: port,
                    discovery_port,
                },
            )
            .await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            std::process::exit(1);
        }
    }
}
