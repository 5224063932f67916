//! TCP / Unix socket IPC server.
//!
//! Binds one listening socket, accepts connections, and hands each one to a
//! supervised worker task that reads a single request frame and passes it to
//! the [`RequestHandler`].

use crate::endpoint::{lookup_inet, Endpoint};
use crate::socket::{configure, reclaim_stale_socket};
use crate::stream::{PeerAddr, Stream};
use crate::{codec, IpcError, TransportStep};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener};
use tracing::Instrument;

/// Pending connections queued by the kernel before accept
const LISTEN_BACKLOG: i32 = 2;

/// Unix socket files are reachable by every local user
const UNIX_SOCKET_MODE: u32 = 0o777;

/// A bound, listening socket and the endpoint it is bound to
pub struct ListenHandle {
    listener: Listener,
    endpoint: Endpoint,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenHandle {
    /// Bind and listen on `endpoint`.
    ///
    /// An Inet endpoint without a host listens on every local address. A Unix
    /// path left behind by a dead listener is reclaimed first; a path owned by
    /// a live listener makes this fail with "address in use".
    pub async fn bind(endpoint: Endpoint) -> Result<Self, IpcError> {
        let handle = match endpoint {
            Endpoint::Inet { host, port } => bind_inet(host, port).await?,
            Endpoint::UnixPath { path } => bind_unix(&path).await?,
        };

        tracing::info!(endpoint = %handle.endpoint, "IPC server listening");
        Ok(handle)
    }

    /// Classify `(host, port)` and bind it
    pub async fn bind_to(host: Option<&str>, port: &str) -> Result<Self, IpcError> {
        Self::bind(Endpoint::parse(host, port)?).await
    }

    /// The bound endpoint. Port 0 is replaced by the port the OS picked.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Debug for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenHandle")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

async fn bind_inet(host: Option<String>, port: u16) -> Result<ListenHandle, IpcError> {
    let requested = Endpoint::Inet {
        host: host.clone(),
        port,
    };
    let addr = match host.as_deref() {
        Some(host) => lookup_inet(Some(host), port).await?,
        None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| IpcError::transport(TransportStep::Socket, &requested, e))?;
    configure(&socket);

    socket
        .bind(&addr.into())
        .map_err(|e| IpcError::transport(TransportStep::Bind, &requested, e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| IpcError::transport(TransportStep::Listen, &requested, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| IpcError::transport(TransportStep::Listen, &requested, e))?;

    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| IpcError::transport(TransportStep::Listen, &requested, e))?;

    let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
    Ok(ListenHandle {
        listener: Listener::Tcp(listener),
        endpoint: Endpoint::Inet {
            host,
            port: bound_port,
        },
    })
}

async fn bind_unix(path: &Path) -> Result<ListenHandle, IpcError> {
    let endpoint = Endpoint::UnixPath {
        path: path.to_path_buf(),
    };

    reclaim_stale_socket(path).await;

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|e| IpcError::transport(TransportStep::Socket, &endpoint, e))?;

    let addr =
        SockAddr::unix(path).map_err(|e| IpcError::transport(TransportStep::Bind, &endpoint, e))?;
    socket
        .bind(&addr)
        .map_err(|e| IpcError::transport(TransportStep::Bind, &endpoint, e))?;

    let listener = listen_unix(socket, path, &endpoint)?;

    Ok(ListenHandle {
        listener: Listener::Unix(listener),
        endpoint,
    })
}

/// Finish setting up a Unix socket bound to `path`.
///
/// The socket file created by the bind is removed if any step fails.
fn listen_unix(
    socket: Socket,
    path: &Path,
    endpoint: &Endpoint,
) -> Result<UnixListener, IpcError> {
    match setup_unix_listener(socket, path) {
        Ok(listener) => Ok(listener),
        Err((step, e)) => {
            if let Err(remove_err) = std::fs::remove_file(path) {
                tracing::warn!(
                    path = %path.display(),
                    "Failed to remove socket file after {} failure: {}",
                    step,
                    remove_err
                );
            }
            Err(IpcError::transport(step, endpoint, e))
        }
    }
}

fn setup_unix_listener(
    socket: Socket,
    path: &Path,
) -> Result<UnixListener, (TransportStep, io::Error)> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(UNIX_SOCKET_MODE))
        .map_err(|e| (TransportStep::Permissions, e))?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| (TransportStep::Listen, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| (TransportStep::Listen, e))?;

    let listener = std::os::unix::net::UnixListener::from(OwnedFd::from(socket));
    UnixListener::from_std(listener).map_err(|e| (TransportStep::Listen, e))
}

/// Something that produces connections when its socket becomes ready
#[async_trait]
pub trait Acceptor: Send {
    /// Accepted connection type
    type Conn: Send + 'static;

    /// Wait for readiness and accept the next connection
    async fn accept(&mut self) -> io::Result<Self::Conn>;

    /// Human-readable name of what is being accepted on, for errors
    fn describe(&self) -> String;
}

#[async_trait]
impl Acceptor for ListenHandle {
    type Conn = (Stream, PeerAddr);

    async fn accept(&mut self) -> io::Result<(Stream, PeerAddr)> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Stream::Tcp(stream), PeerAddr::Inet(addr)))
            }
            Listener::Unix(listener) => {
                let (stream, addr) = listener.accept().await?;
                let peer = PeerAddr::Unix(addr.as_pathname().map(Path::to_path_buf));
                Ok((Stream::Unix(stream), peer))
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Accept connections forever, passing each one to `dispatch`.
///
/// An interrupted wait is retried; any other failure ends the loop.
/// `dispatch` must not block, so the loop can go straight back to waiting.
pub async fn accept_loop<A, F>(acceptor: &mut A, mut dispatch: F) -> Result<(), IpcError>
where
    A: Acceptor + ?Sized,
    F: FnMut(A::Conn),
{
    loop {
        match acceptor.accept().await {
            Ok(conn) => dispatch(conn),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::debug!("Accept interrupted, retrying");
            }
            Err(e) => {
                return Err(IpcError::transport(
                    TransportStep::Accept,
                    acceptor.describe(),
                    e,
                ));
            }
        }
    }
}

/// Identifier of an accepted connection, unique per server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An accepted connection, owned by the worker serving it
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerAddr,
    stream: Stream,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Write the reply frame
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize, IpcError> {
        codec::write_frame(&mut self.stream, payload).await
    }

    /// Raw channel, for handlers that stream their reply themselves
    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }
}

/// Trait for handling incoming requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request. The reply, if any, is written to `conn`.
    async fn handle(&self, conn: &mut Connection, request: Vec<u8>) -> Result<(), IpcError>;
}

/// Tunables for [`IpcServer`]
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Requests longer than this are dropped without calling the handler
    pub max_request_len: Option<usize>,
}

/// Socket IPC server
pub struct IpcServer {
    handler: Arc<dyn RequestHandler>,
    options: ServerOptions,
    next_id: AtomicU64,
}

impl IpcServer {
    /// Create a server that passes requests to `handler`
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self::with_options(handler, ServerOptions::default())
    }

    pub fn with_options(handler: Arc<dyn RequestHandler>, options: ServerOptions) -> Self {
        Self {
            handler,
            options,
            next_id: AtomicU64::new(1),
        }
    }

    /// Run the accept loop on `handle` until accepting fails
    pub async fn run(&self, mut handle: ListenHandle) -> Result<(), IpcError> {
        let result = accept_loop(&mut handle, |(stream, peer)| self.dispatch(stream, peer)).await;
        if let Err(e) = &result {
            tracing::error!("Accept loop stopped: {}", e);
        }
        result
    }

    /// Spawn a supervised worker for one connection
    fn dispatch(&self, stream: Stream, peer: PeerAddr) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(connection = %id, %peer, "Accepted connection");

        let conn = Connection { id, peer, stream };
        let worker = tokio::spawn(serve_connection(
            conn,
            self.handler.clone(),
            self.options.max_request_len,
        ));

        tokio::spawn(async move {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    tracing::error!(connection = %id, "Request handler panicked");
                }
            }
        });
    }
}

/// Read one request, hand it to the handler, then close the connection
async fn serve_connection(
    mut conn: Connection,
    handler: Arc<dyn RequestHandler>,
    max_request_len: Option<usize>,
) {
    let span = tracing::debug_span!("connection", id = %conn.id, peer = %conn.peer);

    async move {
        let request = match max_request_len {
            Some(max) => codec::read_frame_limited(&mut conn.stream, max).await,
            None => codec::read_frame(&mut conn.stream).await,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("Connection closed without a request");
                return;
            }
            Err(e) => {
                tracing::debug!("Failed to read request: {}", e);
                return;
            }
        };

        tracing::debug!(len = request.len(), "Received request");

        if let Err(e) = handler.handle(&mut conn, request).await {
            tracing::warn!("Request handler failed: {}", e);
        }

        if let Err(e) = conn.stream.shutdown().await {
            tracing::debug!("Shutdown after reply failed: {}", e);
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_frame, write_frame};
    use std::collections::VecDeque;
    use tempfile::tempdir;
    use tokio::net::UnixStream;

    struct ScriptedAcceptor {
        script: VecDeque<io::Result<u32>>,
        calls: usize,
    }

    impl ScriptedAcceptor {
        fn new(script: Vec<io::Result<u32>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Conn = u32;

        async fn accept(&mut self) -> io::Result<u32> {
            self.calls += 1;
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Other, "script exhausted")))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test]
    async fn test_accept_loop_retries_interrupted() {
        let mut acceptor = ScriptedAcceptor::new(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(1),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(2),
            Err(io::Error::new(io::ErrorKind::Other, "boom")),
        ]);
        let mut seen = Vec::new();

        let err = accept_loop(&mut acceptor, |conn| seen.push(conn))
            .await
            .unwrap_err();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(acceptor.calls, 5);
        assert_eq!(err.transport_step(), Some(TransportStep::Accept));
        assert!(err.to_string().contains("scripted"));
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_first_real_failure() {
        let mut acceptor = ScriptedAcceptor::new(vec![
            Err(io::ErrorKind::ConnectionAborted.into()),
            Ok(7),
        ]);
        let mut seen = Vec::new();

        let err = accept_loop(&mut acceptor, |conn| seen.push(conn))
            .await
            .unwrap_err();

        assert!(seen.is_empty());
        assert_eq!(acceptor.calls, 1);
        assert!(matches!(err, IpcError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_bind_tcp_ephemeral_port() {
        let handle = ListenHandle::bind_to(Some("localhost"), "0").await.unwrap();
        let port = handle.endpoint().port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(
            handle.endpoint(),
            &Endpoint::Inet {
                host: Some("localhost".to_string()),
                port
            }
        );
    }

    #[tokio::test]
    async fn test_bind_tcp_port_in_use() {
        let first = ListenHandle::bind_to(Some("127.0.0.1"), "0").await.unwrap();
        let port = first.endpoint().port().unwrap().to_string();

        let err = ListenHandle::bind_to(Some("127.0.0.1"), &port)
            .await
            .unwrap_err();
        assert_eq!(err.transport_step(), Some(TransportStep::Bind));
        assert!(err.is_address_in_use());
    }

    #[tokio::test]
    async fn test_bind_tcp_unknown_host() {
        let err = ListenHandle::bind_to(Some("no-such-host.invalid"), "0")
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_bind_unix_sets_world_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perm.sock");
        let handle = ListenHandle::bind_to(None, path.to_str().unwrap()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        assert_eq!(handle.endpoint().unix_path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_failed_unix_listen_removes_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dgram.sock");
        let endpoint = Endpoint::UnixPath { path: path.clone() };

        // Datagram sockets bind a file but cannot listen
        let socket = Socket::new(Domain::UNIX, Type::DGRAM, None).unwrap();
        socket.bind(&SockAddr::unix(&path).unwrap()).unwrap();
        assert!(path.exists());

        let err = listen_unix(socket, &path, &endpoint).unwrap_err();
        assert_eq!(err.transport_step(), Some(TransportStep::Listen));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_unix_reclaims_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _handle = ListenHandle::bind_to(None, path.to_str().unwrap()).await.unwrap();

        // The new listener owns the recreated file
        UnixStream::connect(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_unix_live_listener_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _first = ListenHandle::bind_to(None, path.to_str().unwrap()).await.unwrap();

        let err = ListenHandle::bind_to(Some("localhost"), path.to_str().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.transport_step(), Some(TransportStep::Bind));
        assert!(err.is_address_in_use());
        assert!(path.exists());
    }

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, conn: &mut Connection, request: Vec<u8>) -> Result<(), IpcError> {
            conn.write_frame(&request).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_server_echo_over_unix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let handle = ListenHandle::bind_to(None, path.to_str().unwrap()).await.unwrap();

        let server = IpcServer::new(Arc::new(EchoHandler));
        tokio::spawn(async move {
            let _ = server.run(handle).await;
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_frame(&mut stream, b"hello").await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_server_closes_oversized_request() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limit.sock");
        let handle = ListenHandle::bind_to(None, path.to_str().unwrap()).await.unwrap();

        let server = IpcServer::with_options(
            Arc::new(EchoHandler),
            ServerOptions {
                max_request_len: Some(4),
            },
        );
        tokio::spawn(async move {
            let _ = server.run(handle).await;
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_frame(&mut stream, b"too long").await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), None);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "#42");
    }
}
