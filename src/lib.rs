//! rtmp-live: RTMP protocol engine for live streaming
//!
//! This library implements the RTMP wire protocol for both sides of a
//! connection:
//! - Cryptographic handshake (simple and HMAC-SHA256 digest modes)
//! - Chunk stream multiplexing with full header-compression support
//! - AMF0 command encoding/decoding
//! - A per-connection session state machine driving connect, publish,
//!   play, pause and seek flows
//! - A tokio-based server wrapping sessions around accepted sockets
//!
//! The protocol engine itself ([`RtmpSession`]) is synchronous and
//! I/O-free; feed it inbound bytes and flush notifications, and it talks
//! back through a [`Transport`]. The `server` module supplies the async
//! socket plumbing.
//!
//! # Example: Simple Server
//!
//! ```no_run
//! use rtmp_live::{LoggingHandler, RtmpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RtmpServer::new(ServerConfig::default(), || LoggingHandler);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use protocol::message::{MediaType, Message, MessageHeader, UserControlEvent};
pub use server::config::ServerConfig;
pub use server::listener::RtmpServer;
pub use session::handler::{LoggingHandler, RtmpHandler};
pub use session::session::{RtmpSession, Transport};
