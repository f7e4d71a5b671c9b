//! Business-layer callback trait
//!
//! The protocol engine stays out of stream bookkeeping: once a command or
//! media message is fully decoded it is handed to an [`RtmpHandler`]. All
//! callbacks have no-op defaults so implementations override only what
//! they need. Callbacks run on the connection's own task; they must not
//! block.

use crate::protocol::message::{MediaType, Message};

/// Callbacks from an RTMP session to the business layer.
pub trait RtmpHandler {
    /// A connection finished its handshake and entered the message phase.
    fn on_new_connection(&mut self) {}

    /// The connection is going away (protocol error or peer close).
    fn on_connection_destroy(&mut self) {}

    /// A player asked for `session_name` (`domain/app/stream`) with the
    /// given query params. Return `false` to reject and close.
    fn on_play(&mut self, session_name: &str, param: &str) -> bool {
        let _ = (session_name, param);
        true
    }

    /// A publisher offered `session_name`. Return `false` to reject.
    fn on_publish(&mut self, session_name: &str, param: &str) -> bool {
        let _ = (session_name, param);
        true
    }

    /// Pause toggled by the peer. Return `false` to reject.
    fn on_pause(&mut self, paused: bool) -> bool {
        let _ = paused;
        true
    }

    /// Seek requested, position in milliseconds.
    fn on_seek(&mut self, time: f64) {
        let _ = time;
    }

    /// A complete audio/video/metadata message arrived.
    fn on_recv(&mut self, media: MediaType, message: Message) {
        let _ = (media, message);
    }

    /// The outbound queue fully drained; more data may be queued.
    fn on_active(&mut self) {}
}

/// Handler that logs every event, useful for debugging and tests.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl RtmpHandler for LoggingHandler {
    fn on_new_connection(&mut self) {
        tracing::info!("connection established");
    }

    fn on_connection_destroy(&mut self) {
        tracing::info!("connection destroyed");
    }

    fn on_play(&mut self, session_name: &str, param: &str) -> bool {
        tracing::info!(session = %session_name, param = %param, "play");
        true
    }

    fn on_publish(&mut self, session_name: &str, param: &str) -> bool {
        tracing::info!(session = %session_name, param = %param, "publish");
        true
    }

    fn on_pause(&mut self, paused: bool) -> bool {
        tracing::info!(paused, "pause");
        true
    }

    fn on_seek(&mut self, time: f64) {
        tracing::info!(time, "seek");
    }

    fn on_recv(&mut self, media: MediaType, message: Message) {
        tracing::debug!(
            ?media,
            timestamp = message.header.timestamp,
            len = message.payload.len(),
            "media message"
        );
    }
}
