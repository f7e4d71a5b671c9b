//! Per-connection RTMP session
//!
//! `RtmpSession` owns one handshake, both chunk codec directions, the
//! outbound queue, and the command layer. It is a synchronous state
//! machine: the connection driver feeds it inbound bytes via [`parse`]
//! and flush notifications via [`on_write_complete`]; it talks back
//! through the [`Transport`] collaborator and hands decoded traffic to an
//! [`RtmpHandler`].
//!
//! All session state is mutated from a single task; the engine itself
//! never blocks and never touches a socket.
//!
//! [`parse`]: RtmpSession::parse
//! [`on_write_complete`]: RtmpSession::on_write_complete

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::Result;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeProgress, HandshakeRole};
use crate::protocol::message::{Message, UserControlEvent};
use crate::session::handler::RtmpHandler;

/// Connection-facing collaborator.
///
/// The session never performs I/O itself; it hands batches of wire
/// segments (alternating chunk headers and body slices, suitable for one
/// vectored write) to the transport and expects exactly one
/// `on_write_complete` call back per batch.
pub trait Transport {
    /// Queue one batch of segments for a single write.
    fn send(&mut self, segments: Vec<Bytes>);

    /// Peer address, for logging only.
    fn peer_addr(&self) -> String;

    /// Tear the connection down; no further callbacks expected.
    fn force_close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Inbound bytes are routed to the handshake
    Handshake,
    /// Handshake exchange finished, last packet still flushing
    WaitingDone,
    /// Chunk stream established
    Message,
}

/// Per-connection RTMP protocol state machine.
pub struct RtmpSession<C: Transport, H: RtmpHandler> {
    transport: C,
    handler: H,
    is_client: bool,
    state: SessionState,
    handshake: Handshake,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,

    out_queue: VecDeque<Message>,
    /// One vectored write in flight at a time
    sending: bool,

    ack_window_size: u32,
    /// Bytes seen since the last BytesRead acknowledgement
    in_bytes: u32,
    /// Unconsumed buffer length after the previous parse call
    last_left: usize,

    // connect/play/publish state
    app: String,
    tc_url: String,
    name: String,
    param: String,
    session_name: String,
    is_player: bool,
    closed: bool,
}

impl<C: Transport, H: RtmpHandler> RtmpSession<C, H> {
    /// Session for an accepted connection.
    pub fn new_server(transport: C, handler: H) -> Self {
        Self::new(transport, handler, HandshakeRole::Server, false)
    }

    /// Session that dials out. `tc_url` is `rtmp://host[:port]/app/stream`;
    /// `is_player` selects play vs publish once the connect completes.
    pub fn new_client(transport: C, handler: H, tc_url: &str, is_player: bool) -> Self {
        let mut session = Self::new(transport, handler, HandshakeRole::Client, is_player);
        session.tc_url = tc_url.to_string();
        let parts: Vec<&str> = tc_url.split('/').collect();
        if let Some(app) = parts.get(3) {
            session.app = (*app).to_string();
        }
        if let Some(stream) = parts.get(4) {
            session.name = (*stream).to_string();
        }
        session.parse_name_and_tc_url();
        session
    }

    fn new(transport: C, handler: H, role: HandshakeRole, is_player: bool) -> Self {
        RtmpSession {
            transport,
            handler,
            is_client: role == HandshakeRole::Client,
            state: SessionState::Handshake,
            handshake: Handshake::new(role),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            out_queue: VecDeque::new(),
            sending: false,
            ack_window_size: DEFAULT_WINDOW_ACK_SIZE,
            in_bytes: 0,
            last_left: 0,
            app: String::new(),
            tc_url: String::new(),
            name: String::new(),
            param: String::new(),
            session_name: String::new(),
            is_player,
            closed: false,
        }
    }

    /// Kick the session off. The client side sends C0C1 immediately.
    pub fn start(&mut self) -> Result<()> {
        self.handler.on_new_connection();
        if let Some(c0c1) = self.handshake.start() {
            tracing::debug!(peer = %self.transport.peer_addr(), "sending C0C1");
            self.transport.send(vec![c0c1]);
        }
        Ok(())
    }

    /// The stream/app identity once connect and play/publish have been
    /// seen, as `domain/app/stream`.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn is_player(&self) -> bool {
        self.is_player
    }

    /// Handshake finished, chunk stream established.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Message
    }

    pub fn transport_mut(&mut self) -> &mut C {
        &mut self.transport
    }

    /// Chunk size used for outbound messages, announced during connect.
    pub fn set_out_chunk_size(&mut self, size: u32) {
        self.encoder.set_chunk_size(size);
    }

    /// Window size announced to the peer and used to pace our own
    /// BytesRead acknowledgements.
    pub fn set_ack_window(&mut self, size: u32) {
        self.ack_window_size = size;
    }

    /// Feed inbound bytes. The buffer accumulates across calls; the
    /// session consumes only what it can act on.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<()> {
        match self.parse_inner(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(peer = %self.transport.peer_addr(), error = %e, "protocol error");
                self.close();
                Err(e)
            }
        }
    }

    fn parse_inner(&mut self, buf: &mut BytesMut) -> Result<()> {
        loop {
            match self.state {
                SessionState::Handshake => match self.handshake.handshake(buf)? {
                    HandshakeProgress::NeedMoreData => return Ok(()),
                    HandshakeProgress::InProgress(packet) => {
                        self.transport.send(vec![packet]);
                        return Ok(());
                    }
                    HandshakeProgress::Continue(packet) => {
                        self.transport.send(vec![packet]);
                        self.state = SessionState::WaitingDone;
                        return Ok(());
                    }
                    HandshakeProgress::Done => {
                        self.enter_message_state()?;
                        if buf.is_empty() {
                            return Ok(());
                        }
                    }
                },
                // handshake traffic flushed but not yet acknowledged;
                // leave inbound bytes buffered
                SessionState::WaitingDone => return Ok(()),
                SessionState::Message => return self.parse_messages(buf),
            }
        }
    }

    /// A previously queued write has fully flushed.
    pub fn on_write_complete(&mut self) -> Result<()> {
        match self.write_complete_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(peer = %self.transport.peer_addr(), error = %e, "send error");
                self.close();
                Err(e)
            }
        }
    }

    fn write_complete_inner(&mut self) -> Result<()> {
        match self.state {
            SessionState::Handshake => {
                if let Some(packet) = self.handshake.write_complete() {
                    self.transport.send(vec![packet]);
                } else if self.handshake.is_done() {
                    self.enter_message_state()?;
                }
                Ok(())
            }
            SessionState::WaitingDone => {
                self.handshake.write_complete();
                self.enter_message_state()
            }
            SessionState::Message => self.check_and_send(),
        }
    }

    fn enter_message_state(&mut self) -> Result<()> {
        tracing::debug!(peer = %self.transport.peer_addr(), "handshake done");
        self.state = SessionState::Message;
        if self.is_client {
            // announce our outbound chunk size before any chunked traffic;
            // the peer still decodes at the protocol default until told
            self.push_out_queue(Message::set_chunk_size(self.encoder.chunk_size()))?;
            self.send_connect()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // inbound message path
    // ------------------------------------------------------------------

    fn parse_messages(&mut self, buf: &mut BytesMut) -> Result<()> {
        // count only bytes that arrived since the previous call
        self.in_bytes += (buf.len() - self.last_left) as u32;
        if self.in_bytes >= self.ack_window_size {
            let acked = self.in_bytes;
            self.in_bytes = 0;
            tracing::debug!(peer = %self.transport.peer_addr(), acked, "sending BytesRead");
            self.push_out_queue(Message::bytes_read(acked))?;
        }

        loop {
            let msg = match self.decoder.decode(buf) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    self.last_left = buf.len();
                    return Err(e);
                }
            };
            self.message_complete(msg)?;
        }
        self.last_left = buf.len();
        Ok(())
    }

    fn message_complete(&mut self, msg: Message) -> Result<()> {
        match msg.header.message_type {
            MSG_SET_CHUNK_SIZE => {
                if msg.payload.len() >= 4 {
                    let size = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    tracing::debug!(peer = %self.transport.peer_addr(), size, "peer chunk size");
                    self.decoder.set_chunk_size(size);
                }
                Ok(())
            }
            MSG_WINDOW_ACK_SIZE => {
                if msg.payload.len() >= 4 {
                    self.ack_window_size = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                }
                Ok(())
            }
            MSG_ACKNOWLEDGEMENT | MSG_SET_PEER_BANDWIDTH | MSG_ABORT => {
                // informational, nothing to adjust
                Ok(())
            }
            MSG_USER_CONTROL => self.handle_user_control(&msg),
            MSG_COMMAND_AMF0 => self.handle_amf_command(&msg, false),
            MSG_COMMAND_AMF3 => self.handle_amf_command(&msg, true),
            MSG_AUDIO | MSG_VIDEO | MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                if let Some(media) = msg.media_type() {
                    self.handler.on_recv(media, msg);
                }
                Ok(())
            }
            other => {
                tracing::debug!(peer = %self.transport.peer_addr(), message_type = other, "unhandled message type");
                Ok(())
            }
        }
    }

    fn handle_user_control(&mut self, msg: &Message) -> Result<()> {
        let event = match UserControlEvent::parse(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(peer = %self.transport.peer_addr(), error = %e, "bad user control message");
                return Ok(());
            }
        };
        tracing::trace!(peer = %self.transport.peer_addr(), ?event, "user control");
        if let UserControlEvent::PingRequest(value) = event {
            self.push_out_queue(Message::user_control(&UserControlEvent::PingResponse(value)))?;
        }
        Ok(())
    }

    fn handle_amf_command(&mut self, msg: &Message, amf3: bool) -> Result<()> {
        // AMF3 command bodies are an AMF0 sequence after a one-byte tag
        let body = if amf3 && !msg.payload.is_empty() {
            &msg.payload[1..]
        } else {
            &msg.payload[..]
        };

        let values = match amf0::decode_all(body) {
            Ok(values) => values,
            Err(e) => {
                tracing::debug!(peer = %self.transport.peer_addr(), error = %e, "amf decode error");
                return Ok(());
            }
        };
        let name = values.first().and_then(|v| v.as_str()).unwrap_or("");
        tracing::trace!(peer = %self.transport.peer_addr(), command = %name, "amf command");

        match name {
            CMD_CONNECT => self.handle_connect(&values),
            CMD_CREATE_STREAM => self.handle_create_stream(&values),
            CMD_PLAY => self.handle_play(&values),
            CMD_PUBLISH => self.handle_publish(&values),
            CMD_PAUSE => self.handle_pause(&values),
            CMD_SEEK => self.handle_seek(&values),
            CMD_RESULT => self.handle_result(&values),
            CMD_ERROR => self.handle_error(&values),
            other => {
                tracing::debug!(peer = %self.transport.peer_addr(), command = %other, "unhandled command");
                Ok(())
            }
        }
    }

    fn handle_connect(&mut self, values: &[AmfValue]) -> Result<()> {
        let mut object_encoding = 0.0;
        if let Some(obj) = values.get(2) {
            if let Some(app) = obj.get_string("app") {
                self.app = app.to_string();
            }
            if let Some(tc_url) = obj.get_string("tcUrl") {
                self.tc_url = tc_url.to_string();
            }
            if let Some(encoding) = obj.get_number("objectEncoding") {
                object_encoding = encoding;
            }
        }
        tracing::debug!(
            peer = %self.transport.peer_addr(),
            app = %self.app,
            tc_url = %self.tc_url,
            "connect"
        );

        // initialize connection parameters before the result
        self.push_out_queue(Message::window_ack_size(self.ack_window_size))?;
        self.push_out_queue(Message::set_peer_bandwidth(
            DEFAULT_PEER_BANDWIDTH,
            BANDWIDTH_LIMIT_DYNAMIC,
        ))?;
        self.push_out_queue(Message::set_chunk_size(self.encoder.chunk_size()))?;

        let reply = [
            AmfValue::String(CMD_RESULT.into()),
            AmfValue::Number(1.0),
            AmfValue::Object(vec![
                ("fmsVer".into(), AmfValue::String(FMS_VERSION.into())),
                ("capabilities".into(), AmfValue::Number(FMS_CAPABILITIES)),
            ]),
            AmfValue::Object(vec![
                ("level".into(), AmfValue::String("status".into())),
                ("code".into(), AmfValue::String(NC_CONNECT_SUCCESS.into())),
                (
                    "description".into(),
                    AmfValue::String("Connection succeeded.".into()),
                ),
                ("objectEncoding".into(), AmfValue::Number(object_encoding)),
            ]),
        ];
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_CONTROL, &reply))
    }

    fn handle_create_stream(&mut self, values: &[AmfValue]) -> Result<()> {
        let transaction_id = values.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);
        let reply = [
            AmfValue::String(CMD_RESULT.into()),
            AmfValue::Number(transaction_id),
            AmfValue::Null,
            AmfValue::Number(MSID_STREAM as f64),
        ];
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_CONTROL, &reply))
    }

    fn handle_play(&mut self, values: &[AmfValue]) -> Result<()> {
        if let Some(name) = values.get(3).and_then(|v| v.as_str()) {
            self.name = name.to_string();
        }
        self.parse_name_and_tc_url();
        self.is_player = true;
        tracing::debug!(
            peer = %self.transport.peer_addr(),
            session = %self.session_name,
            param = %self.param,
            "play"
        );

        self.push_out_queue(Message::user_control(&UserControlEvent::StreamBegin(
            MSID_STREAM,
        )))?;
        self.send_status("status", NS_PLAY_START, "Start playing")?;

        if !self.handler.on_play(&self.session_name.clone(), &self.param.clone()) {
            tracing::warn!(peer = %self.transport.peer_addr(), session = %self.session_name, "play rejected");
            self.close();
        }
        Ok(())
    }

    fn handle_publish(&mut self, values: &[AmfValue]) -> Result<()> {
        if let Some(name) = values.get(3).and_then(|v| v.as_str()) {
            self.name = name.to_string();
        }
        self.parse_name_and_tc_url();
        self.is_player = false;
        tracing::debug!(
            peer = %self.transport.peer_addr(),
            session = %self.session_name,
            param = %self.param,
            "publish"
        );

        self.send_status("status", NS_PUBLISH_START, "Start publishing")?;

        if !self
            .handler
            .on_publish(&self.session_name.clone(), &self.param.clone())
        {
            tracing::warn!(peer = %self.transport.peer_addr(), session = %self.session_name, "publish rejected");
            self.close();
        }
        Ok(())
    }

    fn handle_pause(&mut self, values: &[AmfValue]) -> Result<()> {
        let paused = values.get(3).and_then(|v| v.as_bool()).unwrap_or(false);
        if self.handler.on_pause(paused) {
            let (code, description) = if paused {
                (NS_PAUSE_NOTIFY, "Paused")
            } else {
                (NS_UNPAUSE_NOTIFY, "Unpaused")
            };
            self.send_status("status", code, description)?;
        }
        Ok(())
    }

    fn handle_seek(&mut self, values: &[AmfValue]) -> Result<()> {
        if let Some(time) = values.get(3).and_then(|v| v.as_number()) {
            self.handler.on_seek(time);
        }
        Ok(())
    }

    /// Client-side continuation after a `_result` reply.
    fn handle_result(&mut self, values: &[AmfValue]) -> Result<()> {
        let transaction_id = values.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);
        tracing::trace!(peer = %self.transport.peer_addr(), transaction_id, "result");
        if transaction_id == 1.0 {
            // connect accepted
            self.send_create_stream()
        } else if transaction_id == 4.0 {
            // stream created
            if self.is_player {
                self.send_play()
            } else {
                self.send_publish()
            }
        } else {
            Ok(())
        }
    }

    fn handle_error(&mut self, values: &[AmfValue]) -> Result<()> {
        let description = values
            .get(3)
            .and_then(|v| v.get_string("description"))
            .unwrap_or("");
        tracing::error!(peer = %self.transport.peer_addr(), description = %description, "peer error");
        self.close();
        Ok(())
    }

    /// Derive `domain/app/stream` and query params from tcUrl + stream name.
    fn parse_name_and_tc_url(&mut self) {
        if let Some(pos) = self.name.find('?') {
            self.param = self.name[pos + 1..].to_string();
            self.name.truncate(pos);
        } else {
            self.param.clear();
        }

        let mut domain = String::new();
        let parts: Vec<&str> = self.tc_url.split('/').collect();
        if parts.len() == 6 {
            // rtmp://ip/domain/app/stream
            domain = parts[3].to_string();
            self.app = parts[4].to_string();
            self.name = parts[5].to_string();
        }
        if domain.is_empty() && self.tc_url.len() > 7 {
            // rtmp:// is 7 chars; host runs to the next ':' or '/'
            let rest = &self.tc_url[7..];
            let end = rest.find([':', '/']).unwrap_or(rest.len());
            domain = rest[..end].to_string();
        }

        self.session_name = format!("{}/{}/{}", domain, self.app, self.name);
    }

    // ------------------------------------------------------------------
    // outbound path
    // ------------------------------------------------------------------

    fn push_out_queue(&mut self, msg: Message) -> Result<()> {
        self.out_queue.push_back(msg);
        self.send()
    }

    /// Drain up to one batch of queued messages into a single write.
    fn send(&mut self) -> Result<()> {
        if self.sending {
            return Ok(());
        }

        let mut segments = Vec::new();
        for _ in 0..SEND_BATCH_SIZE {
            let msg = match self.out_queue.pop_front() {
                Some(msg) => msg,
                None => break,
            };
            let timestamp = msg.header.timestamp;
            self.encoder.build_chunk(&msg, timestamp, false, &mut segments)?;
        }
        if segments.is_empty() {
            return Ok(());
        }

        self.sending = true;
        self.transport.send(segments);
        Ok(())
    }

    fn check_and_send(&mut self) -> Result<()> {
        self.sending = false;
        self.encoder.release_scratch();
        if self.out_queue.is_empty() {
            self.handler.on_active();
            Ok(())
        } else {
            self.send()
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handler.on_connection_destroy();
        self.transport.force_close();
    }

    // ------------------------------------------------------------------
    // client-side command senders
    // ------------------------------------------------------------------

    fn send_connect(&mut self) -> Result<()> {
        let values = [
            AmfValue::String(CMD_CONNECT.into()),
            AmfValue::Number(1.0),
            AmfValue::Object(vec![
                ("app".into(), AmfValue::String(self.app.clone())),
                ("tcUrl".into(), AmfValue::String(self.tc_url.clone())),
                ("fpad".into(), AmfValue::Boolean(false)),
                ("capabilities".into(), AmfValue::Number(FMS_CAPABILITIES)),
                ("audioCodecs".into(), AmfValue::Number(1639.0)),
                ("videoCodecs".into(), AmfValue::Number(252.0)),
                ("videoFunction".into(), AmfValue::Number(1.0)),
            ]),
        ];
        tracing::debug!(peer = %self.transport.peer_addr(), app = %self.app, "sending connect");
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_CONTROL, &values))
    }

    fn send_create_stream(&mut self) -> Result<()> {
        let values = [
            AmfValue::String(CMD_CREATE_STREAM.into()),
            AmfValue::Number(4.0),
            AmfValue::Null,
        ];
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_CONTROL, &values))
    }

    fn send_play(&mut self) -> Result<()> {
        let values = [
            AmfValue::String(CMD_PLAY.into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::String(self.name.clone()),
            // -1000: play only a live stream by this name
            AmfValue::Number(-1000.0),
        ];
        tracing::debug!(peer = %self.transport.peer_addr(), name = %self.name, "sending play");
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_STREAM, &values))
    }

    fn send_publish(&mut self) -> Result<()> {
        let values = [
            AmfValue::String(CMD_PUBLISH.into()),
            AmfValue::Number(5.0),
            AmfValue::Null,
            AmfValue::String(self.name.clone()),
            AmfValue::String("live".into()),
        ];
        tracing::debug!(peer = %self.transport.peer_addr(), name = %self.name, "sending publish");
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_STREAM, &values))
    }

    fn send_status(&mut self, level: &str, code: &str, description: &str) -> Result<()> {
        let values = [
            AmfValue::String(CMD_ON_STATUS.into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::Object(vec![
                ("level".into(), AmfValue::String(level.into())),
                ("code".into(), AmfValue::String(code.into())),
                ("description".into(), AmfValue::String(description.into())),
            ]),
        ];
        self.push_out_queue(Message::command(CSID_COMMAND, MSID_STREAM, &values))
    }

    /// Queue an outbound media/metadata message.
    pub fn send_message(&mut self, msg: Message) -> Result<()> {
        self.push_out_queue(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MediaType;
    use bytes::BufMut;

    #[derive(Default)]
    struct MockTransport {
        outbox: VecDeque<Vec<Bytes>>,
        closed: bool,
    }

    impl Transport for MockTransport {
        fn send(&mut self, segments: Vec<Bytes>) {
            self.outbox.push_back(segments);
        }

        fn peer_addr(&self) -> String {
            "127.0.0.1:1935".to_string()
        }

        fn force_close(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        plays: Vec<(String, String)>,
        publishes: Vec<(String, String)>,
        media: Vec<(MediaType, u32)>,
        pauses: Vec<bool>,
        active: usize,
        destroyed: bool,
        reject_play: bool,
    }

    impl RtmpHandler for RecordingHandler {
        fn on_connection_destroy(&mut self) {
            self.destroyed = true;
        }

        fn on_play(&mut self, session_name: &str, param: &str) -> bool {
            self.plays.push((session_name.to_string(), param.to_string()));
            !self.reject_play
        }

        fn on_publish(&mut self, session_name: &str, param: &str) -> bool {
            self.publishes
                .push((session_name.to_string(), param.to_string()));
            true
        }

        fn on_pause(&mut self, paused: bool) -> bool {
            self.pauses.push(paused);
            true
        }

        fn on_recv(&mut self, media: MediaType, message: Message) {
            self.media.push((media, message.header.timestamp));
        }

        fn on_active(&mut self) {
            self.active += 1;
        }
    }

    type TestSession = RtmpSession<MockTransport, RecordingHandler>;

    /// Move every pending batch from `from` onto `inbound` (acking each
    /// flush), then let `to` parse what accumulated.
    fn transfer(from: &mut TestSession, to: &mut TestSession, inbound: &mut BytesMut) -> bool {
        let mut any = false;
        while let Some(batch) = from.transport.outbox.pop_front() {
            for segment in batch {
                inbound.extend_from_slice(&segment);
            }
            from.on_write_complete().unwrap();
            any = true;
        }
        if any {
            to.parse(inbound).unwrap();
        }
        any
    }

    fn run_to_idle(client: &mut TestSession, server: &mut TestSession) {
        let mut to_server = BytesMut::new();
        let mut to_client = BytesMut::new();
        loop {
            let a = transfer(client, server, &mut to_server);
            let b = transfer(server, client, &mut to_client);
            if !a && !b {
                break;
            }
        }
    }

    fn message_session() -> TestSession {
        let mut session =
            RtmpSession::new_server(MockTransport::default(), RecordingHandler::default());
        session.state = SessionState::Message;
        session
    }

    /// Decode everything the session has queued, acking each batch so
    /// follow-up batches flush too.
    fn drain_outbox(session: &mut TestSession) -> Vec<Message> {
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::new();
        while let Some(batch) = session.transport.outbox.pop_front() {
            for segment in batch {
                wire.extend_from_slice(&segment);
            }
            session.on_write_complete().unwrap();
        }
        let mut messages = Vec::new();
        while let Some(msg) = decoder.decode(&mut wire).unwrap() {
            // honor the session's chunk size announcement like a real peer
            if msg.header.message_type == MSG_SET_CHUNK_SIZE {
                let size = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]);
                decoder.set_chunk_size(size);
            }
            messages.push(msg);
        }
        messages
    }

    #[test]
    fn test_play_session_end_to_end() {
        let mut client = RtmpSession::new_client(
            MockTransport::default(),
            RecordingHandler::default(),
            "rtmp://localhost/live/stream1",
            true,
        );
        let mut server =
            RtmpSession::new_server(MockTransport::default(), RecordingHandler::default());

        client.start().unwrap();
        server.start().unwrap();
        run_to_idle(&mut client, &mut server);

        // both sides finished the handshake and traded the command flow
        assert_eq!(client.state, SessionState::Message);
        assert_eq!(server.state, SessionState::Message);
        assert_eq!(server.app, "live");
        assert_eq!(
            server.handler.plays,
            vec![("localhost/live/stream1".to_string(), String::new())]
        );
        assert!(server.is_player());
        // each side's SetChunkSize announcement reached the other's decoder
        assert_eq!(client.decoder.chunk_size(), DEFAULT_OUT_CHUNK_SIZE);
        assert_eq!(server.decoder.chunk_size(), DEFAULT_OUT_CHUNK_SIZE);
        assert!(!server.transport.closed);
        assert!(!client.transport.closed);
    }

    #[test]
    fn test_publish_session_end_to_end() {
        let mut client = RtmpSession::new_client(
            MockTransport::default(),
            RecordingHandler::default(),
            "rtmp://localhost/live/camera1",
            false,
        );
        let mut server =
            RtmpSession::new_server(MockTransport::default(), RecordingHandler::default());

        client.start().unwrap();
        server.start().unwrap();
        run_to_idle(&mut client, &mut server);

        assert_eq!(
            server.handler.publishes,
            vec![("localhost/live/camera1".to_string(), String::new())]
        );
        assert!(!server.is_player());
        assert!(server.handler.plays.is_empty());
    }

    #[test]
    fn test_play_rejection_closes_connection() {
        let mut client = RtmpSession::new_client(
            MockTransport::default(),
            RecordingHandler::default(),
            "rtmp://localhost/live/secret",
            true,
        );
        let mut server = RtmpSession::new_server(
            MockTransport::default(),
            RecordingHandler {
                reject_play: true,
                ..Default::default()
            },
        );

        client.start().unwrap();
        server.start().unwrap();
        run_to_idle(&mut client, &mut server);

        assert!(server.transport.closed);
        assert!(server.handler.destroyed);
    }

    #[test]
    fn test_connect_reply_sequence() {
        let mut server = message_session();

        let connect = Message::command(
            CSID_COMMAND,
            MSID_CONTROL,
            &[
                AmfValue::String("connect".into()),
                AmfValue::Number(1.0),
                AmfValue::Object(vec![
                    ("app".into(), AmfValue::String("live".into())),
                    (
                        "tcUrl".into(),
                        AmfValue::String("rtmp://host/live/stream1".into()),
                    ),
                ]),
            ],
        );
        let mut encoder = ChunkEncoder::new();
        let mut segments = Vec::new();
        encoder.build_chunk(&connect, 0, false, &mut segments).unwrap();
        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(segment);
        }
        server.parse(&mut wire).unwrap();

        let replies = drain_outbox(&mut server);
        let types: Vec<u8> = replies.iter().map(|m| m.header.message_type).collect();
        assert_eq!(
            types,
            vec![
                MSG_WINDOW_ACK_SIZE,
                MSG_SET_PEER_BANDWIDTH,
                MSG_SET_CHUNK_SIZE,
                MSG_COMMAND_AMF0
            ]
        );
        // control messages ride csid 2 / stream 0
        assert_eq!(replies[0].header.csid, CSID_PROTOCOL_CONTROL);
        assert_eq!(replies[0].header.message_stream_id, MSID_CONTROL);

        let values = amf0::decode_all(&replies[3].payload).unwrap();
        assert_eq!(values[0].as_str(), Some(CMD_RESULT));
        assert_eq!(values[1].as_number(), Some(1.0));
        assert_eq!(values[2].get_string("fmsVer"), Some(FMS_VERSION));
        assert_eq!(values[3].get_string("code"), Some(NC_CONNECT_SUCCESS));
    }

    #[test]
    fn test_ping_request_gets_response() {
        let mut server = message_session();

        let ping = Message::user_control(&UserControlEvent::PingRequest(42));
        let mut encoder = ChunkEncoder::new();
        let mut segments = Vec::new();
        encoder.build_chunk(&ping, 0, false, &mut segments).unwrap();
        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(segment);
        }
        server.parse(&mut wire).unwrap();

        let replies = drain_outbox(&mut server);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.message_type, MSG_USER_CONTROL);
        let event = UserControlEvent::parse(&replies[0].payload).unwrap();
        assert_eq!(event, UserControlEvent::PingResponse(42));
    }

    #[test]
    fn test_media_delivered_to_handler() {
        let mut server = message_session();

        let audio = Message::new(CSID_AUDIO, MSG_AUDIO, 1, 500, Bytes::from(vec![1u8; 64]));
        let mut encoder = ChunkEncoder::new();
        let mut segments = Vec::new();
        encoder.build_chunk(&audio, 500, false, &mut segments).unwrap();
        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(segment);
        }
        server.parse(&mut wire).unwrap();

        assert_eq!(server.handler.media, vec![(MediaType::Audio, 500)]);
    }

    #[test]
    fn test_ack_emitted_after_window() {
        let mut server = message_session();
        server.ack_window_size = 100;

        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        for i in 0..3u32 {
            let audio = Message::new(
                CSID_AUDIO,
                MSG_AUDIO,
                1,
                i * 10,
                Bytes::from(vec![0u8; 60]),
            );
            let mut segments = Vec::new();
            encoder.build_chunk(&audio, i * 10, false, &mut segments).unwrap();
            for segment in &segments {
                wire.extend_from_slice(segment);
            }
        }

        // feed in two reads so the counter spans parse invocations
        let split = wire.len() / 2;
        let mut first = BytesMut::from(&wire[..split]);
        server.parse(&mut first).unwrap();
        let mut rest = first;
        rest.put_slice(&wire[split..]);
        server.parse(&mut rest).unwrap();

        let acks: Vec<Message> = drain_outbox(&mut server)
            .into_iter()
            .filter(|m| m.header.message_type == MSG_ACKNOWLEDGEMENT)
            .collect();
        assert_eq!(acks.len(), 1);
        // the ack reports the bytes counted when the window tripped
        let counted = u32::from_be_bytes([acks[0].payload[0], acks[0].payload[1], acks[0].payload[2], acks[0].payload[3]]);
        assert!(counted >= 100);
    }

    #[test]
    fn test_send_batches_one_in_flight() {
        let mut session = message_session();

        for i in 0..12u32 {
            let msg = Message::new(
                CSID_AUDIO,
                MSG_AUDIO,
                1,
                i,
                Bytes::from(vec![0u8; 8]),
            );
            session.send_message(msg).unwrap();
        }

        // the first push flushed immediately; the rest queued behind it
        assert_eq!(session.transport.outbox.len(), 1);
        assert_eq!(session.out_queue.len(), 11);

        // acking the write drains one full batch
        session.on_write_complete().unwrap();
        assert_eq!(session.transport.outbox.len(), 2);
        assert_eq!(session.out_queue.len(), 1);
        assert_eq!(session.handler.active, 0);

        session.on_write_complete().unwrap();
        assert_eq!(session.transport.outbox.len(), 3);
        assert!(session.out_queue.is_empty());

        // final flush with an empty queue reports idle
        session.on_write_complete().unwrap();
        assert_eq!(session.handler.active, 1);
    }

    #[test]
    fn test_session_name_parsing() {
        let mut session = message_session();
        session.tc_url = "rtmp://example.com:1935/live".to_string();
        session.app = "live".to_string();
        session.name = "stream1?token=abc".to_string();
        session.parse_name_and_tc_url();
        assert_eq!(session.session_name, "example.com/live/stream1");
        assert_eq!(session.param, "token=abc");

        // six-part form carries an explicit domain
        session.tc_url = "rtmp://10.0.0.1/cdn.example.com/live/stream2".to_string();
        session.name = "ignored".to_string();
        session.parse_name_and_tc_url();
        assert_eq!(session.session_name, "cdn.example.com/live/stream2");
        assert!(session.param.is_empty());
    }

    #[test]
    fn test_error_command_closes() {
        let mut session = message_session();

        let error = Message::command(
            CSID_COMMAND,
            MSID_CONTROL,
            &[
                AmfValue::String("_error".into()),
                AmfValue::Number(1.0),
                AmfValue::Null,
                AmfValue::Object(vec![(
                    "description".into(),
                    AmfValue::String("No such stream".into()),
                )]),
            ],
        );
        let mut encoder = ChunkEncoder::new();
        let mut segments = Vec::new();
        encoder.build_chunk(&error, 0, false, &mut segments).unwrap();
        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(segment);
        }
        session.parse(&mut wire).unwrap();

        assert!(session.transport.closed);
        assert!(session.handler.destroyed);
    }

    #[test]
    fn test_pause_notify() {
        let mut session = message_session();

        let pause = Message::command(
            CSID_COMMAND,
            MSID_STREAM,
            &[
                AmfValue::String("pause".into()),
                AmfValue::Number(0.0),
                AmfValue::Null,
                AmfValue::Boolean(true),
                AmfValue::Number(2000.0),
            ],
        );
        let mut encoder = ChunkEncoder::new();
        let mut segments = Vec::new();
        encoder.build_chunk(&pause, 0, false, &mut segments).unwrap();
        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(segment);
        }
        session.parse(&mut wire).unwrap();

        assert_eq!(session.handler.pauses, vec![true]);
        let replies = drain_outbox(&mut session);
        let values = amf0::decode_all(&replies[0].payload).unwrap();
        assert_eq!(values[0].as_str(), Some(CMD_ON_STATUS));
        assert_eq!(values[3].get_string("code"), Some(NS_PAUSE_NOTIFY));
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let mut session = message_session();

        // fmt 1 chunk on a csid with no prior fmt 0 header
        let mut wire = BytesMut::from(&[0x45u8, 0, 0, 10, 0, 0, 4, 8][..]);
        assert!(session.parse(&mut wire).is_err());
        assert!(session.transport.closed);
        assert!(session.handler.destroyed);
    }
}
