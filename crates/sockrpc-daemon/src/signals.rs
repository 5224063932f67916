//! Signal handling for graceful shutdown.

use std::fmt;
use tokio::sync::broadcast;

/// Why the daemon is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "shutdown request",
        })
    }
}

/// Wait for SIGINT, SIGTERM, or a message on `shutdown_rx`
pub async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) -> ShutdownReason {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
        _ = shutdown_rx.recv() => ShutdownReason::Requested,
        _ = wait_for_sigterm() => ShutdownReason::Terminate,
    }
}

async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Cannot watch for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_request() {
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        assert_eq!(wait_for_shutdown(rx).await, ShutdownReason::Requested);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Terminate.to_string(), "SIGTERM");
    }
}
