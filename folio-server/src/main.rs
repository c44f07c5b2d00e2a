//! Folio collaboration server binary.
//!
//! Usage:
//!   # In-memory (ephemeral)
//!   cargo run -p folio-server
//!
//!   # Persistent, with templates imported at startup
//!   cargo run -p folio-server -- --storage ./folio_data --templates ./templates
//!
//! Every flag can also come from a `FOLIO_*` environment variable.
//! `RUST_LOG` controls log filtering (default `info`).

use std::path::PathBuf;

use clap::Parser;
use folio_collab::server::{CollabServer, ServerConfig};

/// Real-time block collaboration server.
#[derive(Parser, Debug)]
#[command(name = "folio-server")]
#[command(about = "WebSocket server for lock-based block collaboration")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "FOLIO_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; omit to keep everything in memory
    #[arg(long, env = "FOLIO_STORAGE")]
    storage: Option<PathBuf>,

    /// Directory of *.json templates to import at startup
    #[arg(long, env = "FOLIO_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Events a slow client may fall behind before it is told it lagged
    #[arg(long, env = "FOLIO_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between heartbeat sweeps
    #[arg(long, env = "FOLIO_HEARTBEAT_INTERVAL", default_value_t = 5)]
    heartbeat_interval: u64,

    /// Seconds without a heartbeat before a session is dropped
    #[arg(long, env = "FOLIO_HEARTBEAT_TIMEOUT", default_value_t = 15)]
    heartbeat_timeout: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            broadcast_capacity: args.broadcast_capacity,
            heartbeat_interval_secs: args.heartbeat_interval,
            heartbeat_timeout_secs: args.heartbeat_timeout,
            storage_path: args.storage,
            template_dir: args.templates,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    match &config.storage_path {
        Some(path) => log::info!("Starting Folio with storage at {}", path.display()),
        None => log::info!("Starting Folio with in-memory storage"),
    }

    let server = CollabServer::new(config)?;
    server.run().await.map_err(|e| e as Box<dyn std::error::Error>)?;
    Ok(())
}
