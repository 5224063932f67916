//! sockrpc daemon
//!
//! Binds the configured endpoint and answers one request per connection with
//! the configured handler.

pub mod config;
mod daemon;
pub mod handler;
pub mod signals;

pub use config::{DaemonConfig, HandlerConfig};
pub use daemon::Daemon;
