//! IPC client: one connection, one request, one reply.

use crate::endpoint::{Endpoint, ResolvedEndpoint};
use crate::stream::Stream;
use crate::{codec, IpcError, TransportStep};
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, UnixStream};

/// IPC client for a fixed endpoint
#[derive(Debug, Clone)]
pub struct IpcClient {
    endpoint: Endpoint,
}

impl IpcClient {
    /// Create a client for `(host, port)`.
    ///
    /// Fails before any socket is created if the pair is malformed, e.g. a
    /// socket path with a host other than `localhost`.
    pub fn new(host: Option<&str>, port: &str) -> Result<Self, IpcError> {
        Ok(Self {
            endpoint: Endpoint::parse(host, port)?,
        })
    }

    pub fn with_endpoint(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Resolve and connect to `(host, port)`
    pub async fn open(host: Option<&str>, port: &str) -> Result<ClientConnection, IpcError> {
        Self::new(host, port)?.connect().await
    }

    /// Open a new connection. No retry, no timeout.
    pub async fn connect(&self) -> Result<ClientConnection, IpcError> {
        let stream = match self.endpoint.resolve().await? {
            ResolvedEndpoint::Inet(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(|e| IpcError::transport(TransportStep::Socket, &self.endpoint, e))?;

                let stream = socket
                    .connect(addr)
                    .await
                    .map_err(|e| IpcError::transport(TransportStep::Connect, &self.endpoint, e))?;
                Stream::Tcp(stream)
            }
            ResolvedEndpoint::Unix(path) => {
                let stream = connect_unix(path)
                    .await
                    .map_err(|e| IpcError::transport(TransportStep::Connect, &self.endpoint, e))?;
                Stream::Unix(stream)
            }
        };

        tracing::debug!(endpoint = %self.endpoint, "Connected");
        Ok(ClientConnection {
            stream,
            endpoint: self.endpoint.clone(),
        })
    }

    /// Send a request and wait for the reply (opens a new connection)
    pub async fn request(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, IpcError> {
        let mut conn = self.connect().await?;
        let reply = conn.request(payload).await?;
        conn.close().await?;
        Ok(reply)
    }

    /// Check whether something is accepting connections on the endpoint
    pub async fn is_reachable(&self) -> bool {
        match self.connect().await {
            Ok(conn) => {
                let _ = conn.close().await;
                true
            }
            Err(e) => {
                tracing::debug!("Endpoint unreachable: {}", e);
                false
            }
        }
    }
}

/// Connect to a Unix socket, waiting for a slot when the listener's queue is full.
///
/// tokio's connect is non-blocking and fails with `WouldBlock` in that case, so
/// the blocking connect runs on the blocking pool instead.
async fn connect_unix(path: PathBuf) -> io::Result<UnixStream> {
    let stream = tokio::task::spawn_blocking(move || StdUnixStream::connect(path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// A connected client
#[derive(Debug)]
pub struct ClientConnection {
    stream: Stream,
    endpoint: Endpoint,
}

impl ClientConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send the request frame
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize, IpcError> {
        codec::write_frame(&mut self.stream, payload).await
    }

    /// Receive the reply frame. `None` means the server closed without one.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        codec::read_frame(&mut self.stream).await
    }

    /// Send a request and wait for the reply
    pub async fn request(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, IpcError> {
        self.send(payload).await?;
        self.recv().await
    }

    /// Raw channel
    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Close the connection, reporting the shutdown status
    pub async fn close(mut self) -> Result<(), IpcError> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            // The server may already have closed its side after replying
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
