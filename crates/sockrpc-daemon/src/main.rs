//! sockrpc daemon
//!
//! Background process serving one-shot requests over a TCP or Unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use sockrpc_daemon::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sockrpc-daemon")]
#[command(about = "Serve one-shot requests over a TCP port or Unix socket")]
#[command(version)]
struct Args {
    /// Configuration file (default: ~/.sockrpc/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind (default: every address of this machine)
    #[arg(long)]
    host: Option<String>,

    /// Numeric TCP port, or a Unix socket path
    #[arg(short, long)]
    port: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DaemonConfig::load(),
    };
    if args.host.is_some() {
        config.host = args.host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("Starting sockrpc daemon v{}", env!("CARGO_PKG_VERSION"));

    // Run async runtime
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(Daemon::new(config).run())
}
