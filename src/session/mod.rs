//! RTMP session orchestration
//!
//! This module ties the protocol pieces together:
//! - [`RtmpSession`] drives the handshake, chunk codec, and command flow
//!   for one connection, on either side of the wire
//! - [`Transport`] abstracts the socket so the engine stays I/O-free
//! - [`RtmpHandler`] hands decoded commands and media to the business layer

pub mod handler;
#[allow(clippy::module_inception)]
pub mod session;

pub use handler::{LoggingHandler, RtmpHandler};
pub use session::{RtmpSession, Transport};
