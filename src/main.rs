//! Standalone overlay node.
//!
//! Binds a UDP socket, optionally joins an existing overlay through one or
//! more bootstrap addresses, and logs telemetry until interrupted.
//!
//! # Usage
//!
//! ```bash
//! kadnet --bind 127.0.0.1:4000
//! kadnet --bind 127.0.0.1:4001 --bootstrap 127.0.0.1:4000
//! ```
//!
//! Set `RUST_LOG=kadnet=debug` to watch probes and lookups.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadnet::{KadConfig, KadNet};

#[derive(Parser, Debug)]
#[command(name = "kadnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP address to bind; overrides the configuration file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Seconds between telemetry log lines.
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => KadConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => KadConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let node = KadNet::create(config).await?;
    info!(
        key = %node.local_node().key,
        addr = %node.local_node().addr,
        "node listening"
    );

    if !args.bootstrap.is_empty() {
        match node.join(&args.bootstrap).await {
            Ok(()) => info!("bootstrap complete"),
            Err(err) => warn!(error = %err, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry();
                info!(
                    known_peers = snapshot.known_peers,
                    buckets_in_use = snapshot.buckets_in_use,
                    outstanding_requests = snapshot.outstanding_requests,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown();
    Ok(())
}
