//! Endpoint classification and name resolution.
//!
//! A port token made only of decimal digits names a TCP port; anything else
//! names a Unix-domain socket path. The rule is purely syntactic: there is no
//! fallback from one domain to the other.

use crate::IpcError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// The only host accepted alongside a Unix-domain path
pub const LOCALHOST: &str = "localhost";

/// Transport target, before name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP endpoint. An absent host means this machine.
    Inet { host: Option<String>, port: u16 },
    /// Unix-domain socket path
    UnixPath { path: PathBuf },
}

/// Endpoint with its host name resolved to an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEndpoint {
    Inet(SocketAddr),
    Unix(PathBuf),
}

/// Whether a port token selects the TCP domain
pub fn is_numeric_port(port: &str) -> bool {
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

/// Classify and resolve a (host, port) pair in one step
pub async fn resolve(host: Option<&str>, port: &str) -> Result<ResolvedEndpoint, IpcError> {
    Endpoint::parse(host, port)?.resolve().await
}

impl Endpoint {
    /// Classify a (host, port) pair without touching the network or filesystem
    pub fn parse(host: Option<&str>, port: &str) -> Result<Self, IpcError> {
        if port.is_empty() {
            return Err(IpcError::resolution(host, port, "empty port"));
        }

        if is_numeric_port(port) {
            let number = port
                .parse::<u16>()
                .map_err(|_| IpcError::resolution(host, port, "port number out of range"))?;
            return Ok(Self::Inet {
                host: host.map(str::to_string),
                port: number,
            });
        }

        // Unix-domain sockets only exist on the local machine
        if let Some(host) = host {
            if host != LOCALHOST {
                return Err(IpcError::resolution(
                    Some(host),
                    port,
                    format!("{} expected for socket path", LOCALHOST),
                ));
            }
        }

        Ok(Self::UnixPath {
            path: PathBuf::from(port),
        })
    }

    /// Unix socket path, if this is a Unix-domain endpoint
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::UnixPath { path } => Some(path),
            Self::Inet { .. } => None,
        }
    }

    /// TCP port, if this is an Inet endpoint
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Inet { port, .. } => Some(*port),
            Self::UnixPath { .. } => None,
        }
    }

    /// Resolve the host name of an Inet endpoint to a socket address.
    ///
    /// An absent host resolves the machine's own name. IPv4 addresses are
    /// preferred when the name has several.
    pub async fn resolve(&self) -> Result<ResolvedEndpoint, IpcError> {
        match self {
            Self::UnixPath { path } => Ok(ResolvedEndpoint::Unix(path.clone())),
            Self::Inet { host, port } => lookup_inet(host.as_deref(), *port)
                .await
                .map(ResolvedEndpoint::Inet),
        }
    }
}

/// Resolve a host name (or this machine's own name) to one socket address
pub(crate) async fn lookup_inet(host: Option<&str>, port: u16) -> Result<SocketAddr, IpcError> {
    let name = match host {
        Some(host) => host.to_string(),
        None => local_hostname().map_err(|e| {
            IpcError::resolution(None, &port.to_string(), format!("gethostname: {}", e))
        })?,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), port))
        .await
        .map_err(|e| {
            IpcError::resolution(Some(&name), &port.to_string(), format!("unknown host: {}", e))
        })?
        .collect();

    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| IpcError::resolution(Some(&name), &port.to_string(), "no address for host"))?;

    tracing::debug!(host = %name, %addr, "Resolved endpoint");
    Ok(addr)
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet {
                host: Some(host),
                port,
            } => write!(f, "tcp://{}:{}", host, port),
            Self::Inet { host: None, port } => write!(f, "tcp://<this host>:{}", port),
            Self::UnixPath { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "tcp://{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// The machine's own host name
fn local_hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
