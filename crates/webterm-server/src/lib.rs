//! webterm-server: bridges browser terminals to PTY-backed shell sessions.
//!
//! A browser connects over WebSocket, authenticates with a bearer token and
//! is attached to a shell session. Sessions outlive their connections so a
//! client can reconnect with the session id it was given and pick up where
//! it left off.

pub mod auth;
pub mod config;
pub mod connection;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{CliOverrides, ConfigFile, ServerConfig, TerminalOptions};
pub use server::WebTermServer;
pub use session::{SessionRegistry, TerminalSession};
