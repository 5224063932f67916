//! Socket tuning and Unix socket file housekeeping.

use socket2::Socket;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::net::UnixStream;

/// Apply best-effort tuning to a new TCP socket.
///
/// Address reuse lets a restarted server rebind while old connections linger in
/// TIME_WAIT. Failures are logged and otherwise ignored.
pub fn configure(socket: &Socket) {
    if let Err(e) = socket.set_reuse_address(true) {
        tracing::warn!("setsockopt SO_REUSEADDR failed: {}", e);
    }
    if let Err(e) = socket.set_nodelay(true) {
        tracing::warn!("setsockopt TCP_NODELAY failed: {}", e);
    }
}

/// What [`reclaim_stale_socket`] found at a socket path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Nothing exists at the path
    Absent,
    /// A socket file with no listener behind it was removed
    Removed,
    /// A listener answered the probe, or may have; the file was left alone
    InUse,
    /// The path is not a socket; it was left alone
    NotASocket,
    /// The stale file could not be removed
    RemoveFailed,
}

/// Remove a socket file left behind by a listener that died without cleanup.
///
/// The file is removed only when a connect probe is refused. A socket file
/// whose listener still answers, or is too busy to answer, is never removed;
/// binding over it then fails with "address in use".
pub async fn reclaim_stale_socket(path: &Path) -> ReclaimOutcome {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return ReclaimOutcome::Absent,
    };

    if !metadata.file_type().is_socket() {
        tracing::warn!(path = %path.display(), "Path exists and is not a socket, leaving it");
        return ReclaimOutcome::NotASocket;
    }

    // Only a refused connect proves nobody is listening. A full backlog
    // (WouldBlock) or any other failure leaves the file where it is.
    let probe = match UnixStream::connect(path).await {
        Ok(_) => {
            tracing::debug!(path = %path.display(), "Socket file has a live listener");
            return ReclaimOutcome::InUse;
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReclaimOutcome::Absent,
        Err(e) => {
            tracing::debug!(path = %path.display(), "Connect probe inconclusive: {}", e);
            return ReclaimOutcome::InUse;
        }
    };

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Removed stale socket file ({})", probe);
            ReclaimOutcome::Removed
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to remove stale socket file: {}", e);
            ReclaimOutcome::RemoveFailed
        }
    }
}
