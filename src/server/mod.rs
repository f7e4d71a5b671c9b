//! RTMP server implementation
//!
//! This module provides the server-side RTMP plumbing:
//! - TCP listener for accepting connections
//! - Per-connection driver bridging sockets to sessions

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use connection::{Connection, TcpTransport};
pub use listener::RtmpServer;
