//! Per-connection async driver
//!
//! Bridges one `TcpStream` to an [`RtmpSession`]. The session itself is
//! synchronous and I/O-free: this task reads socket bytes into it, writes
//! out the segment batches it queues, and reports each completed flush
//! back so the session can pace its one-write-in-flight queue.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::server::config::ServerConfig;
use crate::session::{RtmpHandler, RtmpSession, Transport};

/// Socket-side transport. The session pushes segment batches here; the
/// connection task drains them to the socket.
pub struct TcpTransport {
    pending: VecDeque<Vec<Bytes>>,
    peer_addr: SocketAddr,
    closed: bool,
}

impl TcpTransport {
    fn new(peer_addr: SocketAddr) -> Self {
        TcpTransport {
            pending: VecDeque::new(),
            peer_addr,
            closed: false,
        }
    }

    fn take_batch(&mut self) -> Option<Vec<Bytes>> {
        self.pending.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, segments: Vec<Bytes>) {
        self.pending.push_back(segments);
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.to_string()
    }

    fn force_close(&mut self) {
        self.closed = true;
    }
}

/// One accepted RTMP connection.
pub struct Connection<H: RtmpHandler> {
    session_id: u64,
    stream: TcpStream,
    config: ServerConfig,
    session: RtmpSession<TcpTransport, H>,
    read_buf: BytesMut,
}

impl<H: RtmpHandler> Connection<H> {
    pub fn new(
        session_id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        handler: H,
    ) -> Self {
        let mut session = RtmpSession::new_server(TcpTransport::new(peer_addr), handler);
        session.set_out_chunk_size(config.chunk_size);
        session.set_ack_window(config.window_ack_size);

        Connection {
            session_id,
            stream,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            config,
            session,
        }
    }

    /// Drive the connection until the peer disconnects or the session
    /// closes it.
    pub async fn run(&mut self) -> Result<()> {
        self.session.start()?;
        self.flush().await?;

        loop {
            if self.session.transport_mut().is_closed() {
                break;
            }

            // stricter deadline until the handshake completes
            let read_timeout = if self.session.is_established() {
                self.config.idle_timeout
            } else {
                self.config.connection_timeout
            };

            let n = match timeout(read_timeout, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(session_id = self.session_id, "read timeout");
                    return Err(Error::Timeout);
                }
            };
            if n == 0 {
                tracing::debug!(session_id = self.session_id, "peer closed connection");
                break;
            }

            self.session.parse(&mut self.read_buf)?;
            self.flush().await?;
        }

        let _ = self.stream.shutdown().await;
        Ok(())
    }

    /// Write out every queued batch, acking each completed flush.
    async fn flush(&mut self) -> Result<()> {
        while let Some(batch) = self.session.transport_mut().take_batch() {
            for segment in &batch {
                self.stream.write_all(segment).await?;
            }
            self.stream.flush().await?;
            self.session.on_write_complete()?;
            if self.session.transport_mut().is_closed() {
                break;
            }
        }
        Ok(())
    }
}
