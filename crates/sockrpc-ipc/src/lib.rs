//! sockrpc transport layer
//!
//! A TCP or Unix-domain socket server that hands every accepted connection to
//! an isolated worker, a matching client, and the zero-terminated framing
//! used to carry one request and one reply per connection.
//!
//! A numeric port selects TCP; any other port string is a socket path.

mod client;
pub mod codec;
pub mod endpoint;
mod error;
mod server;
pub mod socket;
mod stream;

pub use client::{ClientConnection, IpcClient};
pub use codec::{read_frame, read_frame_limited, write_frame};
pub use endpoint::{resolve, Endpoint, ResolvedEndpoint};
pub use error::{IpcError, TransportStep};
pub use server::{
    accept_loop, Acceptor, Connection, ConnectionId, IpcServer, ListenHandle, RequestHandler,
    ServerOptions,
};
pub use stream::{PeerAddr, Stream};
