//! Coordinator binary

use clap::{Parser, Subcommand};
use scarab::common::{FlushPolicy, PeerConfig};
use scarab::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scarab-coord")]
#[command(about = "scarab coordination node: durable counters, fenced ownership, id generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordination node
    Serve {
        /// Node ID (must fit the 10-bit identifier node field)
        #[arg(long)]
        id: u16,

        /// Bind address for the public HTTP API
        #[arg(long, default_value = "0.0.0.0:7000")]
        bind: String,

        /// Bind address for the internal consensus gRPC plane
        #[arg(long, default_value = "0.0.0.0:7001")]
        grpc: String,

        /// Public address handed out in owner redirect hints
        #[arg(long)]
        advertise: Option<String>,

        /// Data directory (counter files + consensus metadata)
        #[arg(long, default_value = "./scarab-data")]
        data: PathBuf,

        /// Consensus peers, repeated: id@grpc_addr@http_addr
        #[arg(long = "peer")]
        peers: Vec<PeerConfig>,

        /// Election timeout base in milliseconds
        #[arg(long)]
        election_timeout_ms: Option<u64>,

        /// Heartbeat interval in milliseconds
        #[arg(long)]
        heartbeat_interval_ms: Option<u64>,

        /// Flush counter increments to disk (always|never)
        #[arg(long)]
        flush: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            grpc,
            advertise,
            data,
            peers,
            election_timeout_ms,
            heartbeat_interval_ms,
            flush,
        } => {
            // Load config from file/env, then override with CLI arguments
            let file_config = scarab::common::config::Config::load();
            let mut config = file_config.coordinator.unwrap_or_default();

            config.node_id = id;
            config.bind_addr = bind.parse()?;
            config.grpc_addr = grpc.parse()?;
            config.data_dir = data;
            if let Some(advertise) = advertise {
                config.advertise_addr = advertise;
            }
            if !peers.is_empty() {
                config.peers = peers;
            }
            if let Some(ms) = election_timeout_ms {
                config.election_timeout_ms = ms;
            }
            if let Some(ms) = heartbeat_interval_ms {
                config.heartbeat_interval_ms = ms;
            }
            if let Some(flush) = flush {
                config.flush_policy = match flush.as_str() {
                    "always" => FlushPolicy::Always,
                    "never" => FlushPolicy::Never,
                    other => anyhow::bail!("unknown flush policy: {}", other),
                };
            }

            let coord = Coordinator::new(config);
            coord.serve().await?;
        }
    }

    Ok(())
}
