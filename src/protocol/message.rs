//! RTMP message types
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-6): chunk/flow control
//! - Command Messages (types 17, 20): AMF-encoded commands
//! - Data Messages (types 15, 18): metadata
//! - Audio/Video Messages (types 8, 9): media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// Header of one logical RTMP message.
///
/// `csid` is the chunk-stream the message travels on; `message_stream_id`
/// is the NetStream it belongs to. Both are carried per message so the
/// encoder can pick chunk header formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub csid: u32,
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type: u8,
    pub message_stream_id: u32,
}

/// One complete RTMP message, immutable once reassembled.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    pub fn new(csid: u32, message_type: u8, message_stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Message {
            header: MessageHeader {
                csid,
                timestamp,
                message_length: payload.len() as u32,
                message_type,
                message_stream_id,
            },
            payload,
        }
    }

    pub fn message_type(&self) -> u8 {
        self.header.message_type
    }

    /// Business-level classification of a media/metadata message
    pub fn media_type(&self) -> Option<MediaType> {
        MediaType::from_message_type(self.header.message_type)
    }

    pub fn is_command(&self) -> bool {
        self.header.message_type == MSG_COMMAND_AMF0 || self.header.message_type == MSG_COMMAND_AMF3
    }

    /// Set Chunk Size control message (type 1)
    pub fn set_chunk_size(size: u32) -> Self {
        let mut body = BytesMut::with_capacity(4);
        body.put_u32(size);
        Self::control(MSG_SET_CHUNK_SIZE, body.freeze())
    }

    /// Acknowledgement control message (type 3)
    pub fn bytes_read(count: u32) -> Self {
        let mut body = BytesMut::with_capacity(4);
        body.put_u32(count);
        Self::control(MSG_ACKNOWLEDGEMENT, body.freeze())
    }

    /// Window Acknowledgement Size control message (type 5)
    pub fn window_ack_size(size: u32) -> Self {
        let mut body = BytesMut::with_capacity(4);
        body.put_u32(size);
        Self::control(MSG_WINDOW_ACK_SIZE, body.freeze())
    }

    /// Set Peer Bandwidth control message (type 6)
    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Self {
        let mut body = BytesMut::with_capacity(5);
        body.put_u32(size);
        body.put_u8(limit_type);
        Self::control(MSG_SET_PEER_BANDWIDTH, body.freeze())
    }

    /// User Control message (type 4)
    pub fn user_control(event: &UserControlEvent) -> Self {
        Self::control(MSG_USER_CONTROL, event.encode())
    }

    /// AMF0 command message from a positional value sequence
    pub fn command(csid: u32, message_stream_id: u32, values: &[AmfValue]) -> Self {
        Message::new(csid, MSG_COMMAND_AMF0, message_stream_id, 0, amf0::encode_all(values))
    }

    fn control(message_type: u8, payload: Bytes) -> Self {
        Message::new(CSID_PROTOCOL_CONTROL, message_type, MSID_CONTROL, 0, payload)
    }
}

/// User Control event (message type 4 body)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
}

impl UserControlEvent {
    /// Parse a User Control body (2-byte event type + payload)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }
        let mut buf = payload;
        let event_type = buf.get_u16();
        let value = buf.get_u32();

        match event_type {
            UC_STREAM_BEGIN => Ok(UserControlEvent::StreamBegin(value)),
            UC_STREAM_EOF => Ok(UserControlEvent::StreamEof(value)),
            UC_STREAM_DRY => Ok(UserControlEvent::StreamDry(value)),
            UC_SET_BUFFER_LENGTH => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(UserControlEvent::SetBufferLength {
                    stream_id: value,
                    buffer_ms: buf.get_u32(),
                })
            }
            UC_STREAM_IS_RECORDED => Ok(UserControlEvent::StreamIsRecorded(value)),
            UC_PING_REQUEST => Ok(UserControlEvent::PingRequest(value)),
            UC_PING_RESPONSE => Ok(UserControlEvent::PingResponse(value)),
            other => Err(ProtocolError::InvalidCommand(format!("user control event {}", other)).into()),
        }
    }

    pub fn event_type(&self) -> u16 {
        match self {
            UserControlEvent::StreamBegin(_) => UC_STREAM_BEGIN,
            UserControlEvent::StreamEof(_) => UC_STREAM_EOF,
            UserControlEvent::StreamDry(_) => UC_STREAM_DRY,
            UserControlEvent::SetBufferLength { .. } => UC_SET_BUFFER_LENGTH,
            UserControlEvent::StreamIsRecorded(_) => UC_STREAM_IS_RECORDED,
            UserControlEvent::PingRequest(_) => UC_PING_REQUEST,
            UserControlEvent::PingResponse(_) => UC_PING_RESPONSE,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u16(self.event_type());
        match self {
            UserControlEvent::StreamBegin(v)
            | UserControlEvent::StreamEof(v)
            | UserControlEvent::StreamDry(v)
            | UserControlEvent::StreamIsRecorded(v)
            | UserControlEvent::PingRequest(v)
            | UserControlEvent::PingResponse(v) => buf.put_u32(*v),
            UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
                buf.put_u32(*stream_id);
                buf.put_u32(*buffer_ms);
            }
        }
        buf.freeze()
    }
}

/// Business-level media classification of inbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    /// AMF0 metadata (onMetaData etc.)
    Meta,
    /// AMF3 metadata
    Meta3,
}

impl MediaType {
    pub fn from_message_type(message_type: u8) -> Option<Self> {
        match message_type {
            MSG_AUDIO => Some(MediaType::Audio),
            MSG_VIDEO => Some(MediaType::Video),
            MSG_DATA_AMF0 => Some(MediaType::Meta),
            MSG_DATA_AMF3 => Some(MediaType::Meta3),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_constructors() {
        let msg = Message::set_chunk_size(4096);
        assert_eq!(msg.header.csid, CSID_PROTOCOL_CONTROL);
        assert_eq!(msg.header.message_stream_id, MSID_CONTROL);
        assert_eq!(msg.header.message_type, MSG_SET_CHUNK_SIZE);
        assert_eq!(&msg.payload[..], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(msg.header.message_length, 4);

        let msg = Message::window_ack_size(2_500_000);
        assert_eq!(msg.header.message_type, MSG_WINDOW_ACK_SIZE);
        assert_eq!(&msg.payload[..], &2_500_000u32.to_be_bytes());

        let msg = Message::set_peer_bandwidth(2_500_000, BANDWIDTH_LIMIT_DYNAMIC);
        assert_eq!(msg.payload.len(), 5);
        assert_eq!(msg.payload[4], BANDWIDTH_LIMIT_DYNAMIC);

        let msg = Message::bytes_read(100);
        assert_eq!(msg.header.message_type, MSG_ACKNOWLEDGEMENT);
    }

    #[test]
    fn test_user_control_roundtrip() {
        let events = [
            UserControlEvent::StreamBegin(1),
            UserControlEvent::StreamEof(1),
            UserControlEvent::SetBufferLength {
                stream_id: 1,
                buffer_ms: 3000,
            },
            UserControlEvent::PingRequest(0x01020304),
        ];
        for event in events {
            let encoded = event.encode();
            let parsed = UserControlEvent::parse(&encoded).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn test_user_control_truncated() {
        assert!(UserControlEvent::parse(&[0x00, 0x00]).is_err());
        // SetBufferLength needs a second value word
        assert!(UserControlEvent::parse(&[0x00, 0x03, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_media_type_remap() {
        assert_eq!(MediaType::from_message_type(MSG_AUDIO), Some(MediaType::Audio));
        assert_eq!(MediaType::from_message_type(MSG_VIDEO), Some(MediaType::Video));
        assert_eq!(MediaType::from_message_type(MSG_DATA_AMF0), Some(MediaType::Meta));
        assert_eq!(MediaType::from_message_type(MSG_DATA_AMF3), Some(MediaType::Meta3));
        assert_eq!(MediaType::from_message_type(MSG_COMMAND_AMF0), None);
    }

    #[test]
    fn test_command_body() {
        let msg = Message::command(
            CSID_COMMAND,
            MSID_CONTROL,
            &[
                AmfValue::String("connect".into()),
                AmfValue::Number(1.0),
                AmfValue::Null,
            ],
        );
        assert!(msg.is_command());
        let values = amf0::decode_all(&msg.payload).unwrap();
        assert_eq!(values[0].as_str(), Some("connect"));
        assert_eq!(values[1].as_number(), Some(1.0));
    }
}
