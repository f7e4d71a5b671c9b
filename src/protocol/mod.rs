//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Handshake (C0C1C2/S0S1S2 exchange, simple and digest modes)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and control messages

pub mod bytes;
pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use handshake::{Handshake, HandshakeProgress, HandshakeRole};
pub use message::{MediaType, Message, MessageHeader, UserControlEvent};
