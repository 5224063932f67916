//! IPC Error types

use std::fmt;
use thiserror::Error;

/// The socket operation that was being attempted when a transport error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStep {
    /// Creating the socket
    Socket,
    /// Naming the socket (bind)
    Bind,
    /// Opening up permissions on a Unix socket file
    Permissions,
    /// Marking the socket as listening
    Listen,
    /// Connecting to a server
    Connect,
    /// Accepting a pending connection
    Accept,
}

impl fmt::Display for TransportStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::Socket => "socket creation",
            Self::Bind => "bind",
            Self::Permissions => "setting socket permissions",
            Self::Listen => "listen",
            Self::Connect => "connect",
            Self::Accept => "accept",
        };
        f.write_str(step)
    }
}

/// Errors that can occur during IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    /// The (host, port) pair could not be turned into an endpoint
    #[error("Cannot resolve host [{host}] port [{port}]: {reason}")]
    Resolution {
        host: String,
        port: String,
        reason: String,
    },

    /// A socket operation failed
    #[error("{step} failed for {endpoint}: {source}")]
    Transport {
        step: TransportStep,
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Frame exceeded the configured maximum
    #[error("Frame too large (max {limit} bytes)")]
    FrameTooLarge { limit: usize },

    /// IO error while reading or writing a frame
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The request handler reported a failure
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl IpcError {
    pub(crate) fn resolution(host: Option<&str>, port: &str, reason: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.unwrap_or("<this host>").to_string(),
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(
        step: TransportStep,
        endpoint: impl fmt::Display,
        source: std::io::Error,
    ) -> Self {
        Self::Transport {
            step,
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// The failing step, if this is a transport error
    pub fn transport_step(&self) -> Option<TransportStep> {
        match self {
            Self::Transport { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Whether this error means another socket already owns the address
    pub fn is_address_in_use(&self) -> bool {
        matches!(
            self,
            Self::Transport { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}
