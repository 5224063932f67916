//! sockrpc CLI
//!
//! Sends one request to a sockrpc server and prints the reply.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sockrpc_ipc::IpcClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(name = "sockrpc")]
#[command(about = "sockrpc - one-shot requests over TCP or Unix sockets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the server listens
#[derive(Args, Debug)]
struct Target {
    /// Server host (must be localhost, or omitted, for a socket path)
    #[arg(long)]
    host: Option<String>,

    /// Numeric TCP port, or a Unix socket path
    #[arg(short, long)]
    port: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a request and print the reply
    Send {
        #[command(flatten)]
        target: Target,

        /// Request payload (default: read stdin)
        payload: Option<String>,
    },

    /// Check whether a server accepts connections
    Probe {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Simple logging for CLI
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt().with_target(false).init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Send { target, payload } => cmd_send(&target, payload).await,
        Commands::Probe { target } => cmd_probe(&target).await,
    }
}

fn client_for(target: &Target) -> Result<IpcClient> {
    IpcClient::new(target.host.as_deref(), &target.port).context("Invalid server address")
}

async fn cmd_send(target: &Target, payload: Option<String>) -> Result<()> {
    let client = client_for(target)?;

    let payload = match payload {
        Some(payload) => payload.into_bytes(),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read request from stdin")?;
            buf
        }
    };

    if payload.contains(&0) {
        eprintln!("warning: request contains a zero byte and will be truncated");
    }

    let reply = client
        .request(&payload)
        .await
        .with_context(|| format!("Request to {} failed", client.endpoint()))?;

    match reply {
        Some(reply) => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&reply).await?;
            if !reply.ends_with(b"\n") {
                stdout.write_all(b"\n").await?;
            }
            stdout.flush().await?;
            Ok(())
        }
        None => anyhow::bail!("Server closed the connection without replying"),
    }
}

async fn cmd_probe(target: &Target) -> Result<()> {
    let client = client_for(target)?;

    if client.is_reachable().await {
        println!("✓ {} is accepting connections", client.endpoint());
        Ok(())
    } else {
        anyhow::bail!("{} is not reachable", client.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_with_payload() {
        let cli = Cli::try_parse_from(["sockrpc", "send", "--port", "9999", "ping"]).unwrap();
        match cli.command {
            Commands::Send { target, payload } => {
                assert_eq!(target.host, None);
                assert_eq!(target.port, "9999");
                assert_eq!(payload.as_deref(), Some("ping"));
            }
            Commands::Probe { .. } => panic!("Expected send"),
        }
    }

    #[test]
    fn test_parse_probe_unix_path() {
        let cli = Cli::try_parse_from([
            "sockrpc",
            "probe",
            "--host",
            "localhost",
            "-p",
            "/tmp/sockrpc.sock",
        ])
        .unwrap();
        match cli.command {
            Commands::Probe { target } => {
                assert_eq!(target.host.as_deref(), Some("localhost"));
                assert_eq!(target.port, "/tmp/sockrpc.sock");
            }
            Commands::Send { .. } => panic!("Expected probe"),
        }
    }

    #[test]
    fn test_port_is_required() {
        assert!(Cli::try_parse_from(["sockrpc", "send", "ping"]).is_err());
    }

    #[test]
    fn test_client_for_rejects_remote_socket_path() {
        let target = Target {
            host: Some("example.org".to_string()),
            port: "/tmp/sockrpc.sock".to_string(),
        };
        assert!(client_for(&target).is_err());
    }
}
