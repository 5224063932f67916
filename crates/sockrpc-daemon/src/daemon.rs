//! Daemon lifecycle management.

use anyhow::{Context, Result};
use sockrpc_ipc::{Endpoint, IpcServer, ListenHandle};
use tokio::sync::broadcast;

use crate::config::DaemonConfig;
use crate::handler::build_handler;
use crate::signals;

/// The main daemon process
pub struct Daemon {
    config: DaemonConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Create a daemon for `config`
    pub fn new(config: DaemonConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown_tx,
        }
    }

    /// Sender that stops a running daemon
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until a shutdown signal arrives or the accept loop fails
    pub async fn run(&self) -> Result<()> {
        let endpoint = self.config.endpoint().context("Invalid listen endpoint")?;

        // Subscribe before binding so a shutdown sent once the endpoint is
        // reachable is never missed
        let shutdown_rx = self.shutdown_tx.subscribe();

        // Check single instance
        self.acquire_pid_lock()?;

        let handle = match ListenHandle::bind(endpoint).await {
            Ok(handle) => handle,
            Err(e) => {
                // Whatever sits at the endpoint is not ours to clean up
                self.release_pid_lock();
                return Err(e).context("Failed to bind listen endpoint");
            }
        };
        let bound = handle.endpoint().clone();

        let result = self.serve(handle, shutdown_rx).await;

        self.cleanup(&bound);
        result
    }

    async fn serve(
        &self,
        handle: ListenHandle,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::info!(
            endpoint = %handle.endpoint(),
            handler = ?self.config.handler,
            "Daemon starting"
        );

        let server = IpcServer::with_options(
            build_handler(&self.config.handler),
            self.config.server_options(),
        );

        tokio::select! {
            result = server.run(handle) => {
                result.context("IPC server stopped")?;
            }
            reason = signals::wait_for_shutdown(shutdown_rx) => {
                tracing::info!("Shutting down ({})", reason);
            }
        }

        Ok(())
    }

    /// Acquire PID lock to ensure single instance
    fn acquire_pid_lock(&self) -> Result<()> {
        let pid_file = &self.config.pid_file;

        if pid_file.exists() {
            if let Ok(pid_str) = std::fs::read_to_string(pid_file) {
                if let Ok(pid) = pid_str.trim().parse::<u32>() {
                    if pid != std::process::id() && is_process_running(pid) {
                        anyhow::bail!("Daemon already running (PID: {})", pid);
                    }
                }
            }
            // Stale PID file
            std::fs::remove_file(pid_file)
                .with_context(|| format!("Failed to remove {}", pid_file.display()))?;
        }

        std::fs::write(pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write {}", pid_file.display()))?;

        tracing::debug!(pid = std::process::id(), "PID lock acquired");

        Ok(())
    }

    fn release_pid_lock(&self) {
        if self.config.pid_file.exists() {
            let _ = std::fs::remove_file(&self.config.pid_file);
        }
    }

    /// Remove the socket file and PID file
    fn cleanup(&self, endpoint: &Endpoint) {
        if let Some(path) = endpoint.unix_path() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Socket file not removed: {}", e);
            }
        }

        self.release_pid_lock();

        tracing::info!("Cleanup complete");
    }
}

/// Check if a process is running by PID
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) only checks that the process exists
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_running() {
        // Current process should be running
        assert!(is_process_running(std::process::id()));

        // Very high PID should not exist
        assert!(!is_process_running(999999999));
        assert!(!is_process_running(u32::MAX));
    }
}
