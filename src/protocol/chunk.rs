//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a
//! header that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+-----------------+-------------------+
//! | Basic Header| Message Header  | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)        |
//! +-------------+-----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! Extended timestamp (4 bytes) follows when the 3-byte field is 0xFFFFFF.
//! ```
//!
//! The decoder consumes nothing from the input buffer unless the chunk's
//! basic header, message header, and available payload slice are all
//! present, so a short read never corrupts parser state.
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::bytes::{read_u24, read_u32, ScratchWriter};
use crate::protocol::constants::*;
use crate::protocol::message::{Message, MessageHeader};

/// Per-chunk-stream inbound state
#[derive(Debug, Default)]
struct InboundState {
    /// Header of the message in progress (or last completed)
    header: MessageHeader,
    /// Timestamp delta of the previous chunk, inherited by fmt 3
    last_delta: u32,
    /// Whether the previous chunk carried an extended timestamp
    has_extended_timestamp: bool,
    /// Reassembly buffer for the message in progress
    partial: BytesMut,
}

/// Outcome of attempting to parse one chunk from the front of the buffer
enum ChunkStep {
    /// Buffer under-filled; nothing may be consumed
    NeedMoreData,
    /// One chunk parsed: consume `consumed` bytes, optionally yielding a
    /// completed message
    Parsed {
        consumed: usize,
        complete: Option<Message>,
    },
}

/// Chunk stream decoder
///
/// Demultiplexes an inbound byte stream into complete messages,
/// reassembling each csid's chunks independently.
pub struct ChunkDecoder {
    /// Negotiated inbound chunk size
    chunk_size: u32,
    /// Per-csid reassembly state
    streams: HashMap<u32, InboundState>,
    /// Sanity limit on message_length
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Apply a peer SetChunkSize
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Decode the next complete message from the buffer.
    ///
    /// Consumes whole chunks until a message completes (`Ok(Some)`) or the
    /// buffer runs out of complete chunks (`Ok(None)`). Call repeatedly
    /// until `None` to drain a read.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            if buf.is_empty() {
                return Ok(None);
            }
            match self.parse_chunk(&buf[..])? {
                ChunkStep::NeedMoreData => return Ok(None),
                ChunkStep::Parsed { consumed, complete } => {
                    buf.advance(consumed);
                    if complete.is_some() {
                        return Ok(complete);
                    }
                }
            }
        }
    }

    /// Parse a single chunk without consuming input.
    ///
    /// Every length check happens before any per-stream state is touched,
    /// so a `NeedMoreData` retry observes identical state.
    fn parse_chunk(&mut self, data: &[u8]) -> Result<ChunkStep> {
        let (fmt, csid, basic_len) = match parse_basic_header(data) {
            Some(v) => v,
            None => return Ok(ChunkStep::NeedMoreData),
        };

        // fmt 1/2/3 inherit fields, so the csid must already be known
        if fmt != CHUNK_FMT_0 && !self.streams.contains_key(&csid) {
            return Err(ProtocolError::MissingChunkContext(csid).into());
        }
        let state = self.streams.entry(csid).or_default();

        let msg_header_len = match fmt {
            CHUNK_FMT_0 => 11,
            CHUNK_FMT_1 => 7,
            CHUNK_FMT_2 => 3,
            _ => 0,
        };
        if data.len() < basic_len + msg_header_len {
            return Ok(ChunkStep::NeedMoreData);
        }
        let fields = &data[basic_len..];

        // Raw 3-byte timestamp field; 0xFFFFFF flags an extended one
        let extended = if fmt == CHUNK_FMT_3 {
            state.has_extended_timestamp
        } else {
            read_u24(fields) >= EXTENDED_TIMESTAMP_THRESHOLD
        };
        let ext_len = if extended { 4 } else { 0 };
        if data.len() < basic_len + msg_header_len + ext_len {
            return Ok(ChunkStep::NeedMoreData);
        }

        // Timestamp value: absolute for fmt 0, a delta otherwise
        let time_value = if fmt == CHUNK_FMT_3 {
            if extended {
                read_u32(&fields[msg_header_len..])
            } else {
                state.last_delta
            }
        } else if extended {
            read_u32(&fields[msg_header_len..])
        } else {
            read_u24(fields)
        };

        let continuation = fmt == CHUNK_FMT_3 && !state.partial.is_empty();

        // A fmt 0/1/2 header may not interrupt a message in progress on
        // the same chunk stream; peers abort with an Abort message instead
        if !continuation && !state.partial.is_empty() {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        let message_length = match fmt {
            CHUNK_FMT_0 | CHUNK_FMT_1 => read_u24(&fields[3..]),
            _ => state.header.message_length,
        };
        if message_length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length,
                max: self.max_message_size,
            }
            .into());
        }

        let remaining = message_length as usize - state.partial.len();
        let payload_len = remaining.min(self.chunk_size as usize);
        let header_total = basic_len + msg_header_len + ext_len;
        if data.len() < header_total + payload_len {
            return Ok(ChunkStep::NeedMoreData);
        }

        // the whole chunk is present; commit header state
        if !continuation {
            match fmt {
                CHUNK_FMT_0 => {
                    state.header.timestamp = time_value;
                    state.header.message_length = message_length;
                    state.header.message_type = fields[6];
                    // stream id travels little-endian, no byte swap
                    state.header.message_stream_id =
                        u32::from_le_bytes([fields[7], fields[8], fields[9], fields[10]]);
                    state.last_delta = 0;
                }
                CHUNK_FMT_1 => {
                    state.header.timestamp = state.header.timestamp.wrapping_add(time_value);
                    state.header.message_length = message_length;
                    state.header.message_type = fields[6];
                    state.last_delta = time_value;
                }
                CHUNK_FMT_2 => {
                    state.header.timestamp = state.header.timestamp.wrapping_add(time_value);
                    state.last_delta = time_value;
                }
                _ => {
                    // fmt 3 starting a new message reuses the last delta
                    state.header.timestamp = state.header.timestamp.wrapping_add(time_value);
                    state.last_delta = time_value;
                }
            }
            state.header.csid = csid;
            state.has_extended_timestamp = extended;
        }

        if state.partial.is_empty() {
            state.partial.reserve(message_length as usize);
        }
        state
            .partial
            .put_slice(&data[header_total..header_total + payload_len]);

        let complete = if state.partial.len() == message_length as usize {
            let payload = state.partial.split().freeze();
            Some(Message {
                header: state.header,
                payload,
            })
        } else {
            None
        };

        Ok(ChunkStep::Parsed {
            consumed: header_total + payload_len,
            complete,
        })
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a basic header from the front of the buffer, returning
/// (fmt, csid, header length), or `None` on under-fill.
fn parse_basic_header(data: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *data.first()?;
    let fmt = first >> 6;
    match first & 0x3F {
        0 => {
            // 2-byte form: csid = 64 + next byte
            let b1 = *data.get(1)?;
            Some((fmt, 64 + b1 as u32, 2))
        }
        1 => {
            // 3-byte form: csid = 64 + b1 + b2 * 256
            let b1 = *data.get(1)?;
            let b2 = *data.get(2)?;
            Some((fmt, 64 + b1 as u32 + (b2 as u32) * 256, 3))
        }
        csid => Some((fmt, csid as u32, 1)),
    }
}

/// Per-chunk-stream outbound state
#[derive(Debug)]
struct OutboundState {
    header: MessageHeader,
    last_delta: u32,
}

/// Chunk stream encoder
///
/// Splits outbound messages into chunks, compressing headers against the
/// previous message on each csid. Header bytes go through the bounded
/// scratch writer; the produced segment list alternates header and body
/// slices for one vectored write.
pub struct ChunkEncoder {
    /// Announced outbound chunk size
    chunk_size: u32,
    streams: HashMap<u32, OutboundState>,
    scratch: ScratchWriter,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_OUT_CHUNK_SIZE,
            streams: HashMap::new(),
            scratch: ScratchWriter::new(),
        }
    }

    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Reclaim the header scratch once a send batch has flushed.
    pub fn release_scratch(&mut self) {
        self.scratch.reset();
    }

    /// Chunk one message into `segments`.
    ///
    /// `timestamp` overrides the header timestamp (media relay restamps
    /// here); `force_fmt0` disables header compression for the message.
    /// Scratch exhaustion is a fatal send error.
    pub fn build_chunk(
        &mut self,
        msg: &Message,
        timestamp: u32,
        force_fmt0: bool,
        segments: &mut Vec<Bytes>,
    ) -> Result<()> {
        let header = &msg.header;
        let csid = header.csid;
        let length = msg.payload.len() as u32;

        let prev = self.streams.get(&csid);
        let (fmt, delta) = match prev {
            Some(prev)
                if !force_fmt0
                    && header.message_stream_id == prev.header.message_stream_id
                    && timestamp >= prev.header.timestamp =>
            {
                let delta = timestamp - prev.header.timestamp;
                if length != prev.header.message_length
                    || header.message_type != prev.header.message_type
                {
                    (CHUNK_FMT_1, delta)
                } else if delta == prev.last_delta {
                    (CHUNK_FMT_3, delta)
                } else {
                    (CHUNK_FMT_2, delta)
                }
            }
            _ => (CHUNK_FMT_0, 0),
        };

        // 0xFFFFFF in the 3-byte field flags the 4-byte extended form
        let time_value = if fmt == CHUNK_FMT_0 { timestamp } else { delta };
        let extended = time_value >= EXTENDED_TIMESTAMP_THRESHOLD;
        let field = if extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            time_value
        };

        write_basic_header(&mut self.scratch, fmt, csid)?;
        match fmt {
            CHUNK_FMT_0 => {
                self.scratch.put_u24(field)?;
                self.scratch.put_u24(length)?;
                self.scratch.put_u8(header.message_type)?;
                self.scratch.put_u32_le(header.message_stream_id)?;
            }
            CHUNK_FMT_1 => {
                self.scratch.put_u24(field)?;
                self.scratch.put_u24(length)?;
                self.scratch.put_u8(header.message_type)?;
            }
            CHUNK_FMT_2 => {
                self.scratch.put_u24(field)?;
            }
            _ => {}
        }
        if extended {
            self.scratch.put_u32(time_value)?;
        }
        segments.push(self.scratch.split_segment());

        // First chunk's payload slice, then fmt 3 continuations
        let chunk_size = self.chunk_size as usize;
        let first_len = msg.payload.len().min(chunk_size);
        segments.push(msg.payload.slice(..first_len));

        let mut offset = first_len;
        while offset < msg.payload.len() {
            write_basic_header(&mut self.scratch, CHUNK_FMT_3, csid)?;
            if extended {
                self.scratch.put_u32(time_value)?;
            }
            segments.push(self.scratch.split_segment());

            let piece = (msg.payload.len() - offset).min(chunk_size);
            segments.push(msg.payload.slice(offset..offset + piece));
            offset += piece;
        }

        self.streams.insert(
            csid,
            OutboundState {
                header: MessageHeader {
                    csid,
                    timestamp,
                    message_length: length,
                    message_type: header.message_type,
                    message_stream_id: header.message_stream_id,
                },
                last_delta: if fmt == CHUNK_FMT_0 { 0 } else { delta },
            },
        );
        Ok(())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(scratch: &mut ScratchWriter, fmt: u8, csid: u32) -> Result<()> {
    if csid < 64 {
        scratch.put_u8((fmt << 6) | csid as u8)?;
    } else if csid < 320 {
        scratch.put_u8(fmt << 6)?;
        scratch.put_u8((csid - 64) as u8)?;
    } else {
        scratch.put_u8((fmt << 6) | 1)?;
        let ext = csid - 64;
        scratch.put_u8((ext & 0xFF) as u8)?;
        scratch.put_u8((ext >> 8) as u8)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(segments: &[Bytes]) -> BytesMut {
        let mut out = BytesMut::new();
        for seg in segments {
            out.extend_from_slice(seg);
        }
        out
    }

    fn encode_one(encoder: &mut ChunkEncoder, msg: &Message, timestamp: u32) -> BytesMut {
        let mut segments = Vec::new();
        encoder.build_chunk(msg, timestamp, false, &mut segments).unwrap();
        flatten(&segments)
    }

    fn media_message(csid: u32, message_type: u8, sid: u32, timestamp: u32, len: usize) -> Message {
        Message::new(csid, message_type, sid, timestamp, Bytes::from(vec![0xABu8; len]))
    }

    #[test]
    fn test_basic_header_parsing() {
        assert_eq!(parse_basic_header(&[0x03]), Some((0, 3, 1)));
        assert_eq!(parse_basic_header(&[0xC2]), Some((3, 2, 1)));
        assert_eq!(parse_basic_header(&[0x40, 0x00]), Some((1, 64, 2)));
        assert_eq!(parse_basic_header(&[0x01, 0x00, 0x01]), Some((0, 320, 3)));
        // under-filled extension bytes
        assert_eq!(parse_basic_header(&[0x00]), None);
        assert_eq!(parse_basic_header(&[0x01, 0x00]), None);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = Message::new(
            CSID_COMMAND,
            MSG_COMMAND_AMF0,
            0,
            1000,
            Bytes::from_static(b"test payload data"),
        );

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let mut encoded = encode_one(&mut encoder, &original, 1000);

        let decoded = decoder.decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.header, original.header);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_large_message_chunking() {
        // larger than the inbound chunk size, forcing continuations
        let original = media_message(CSID_VIDEO, MSG_VIDEO, 1, 0, 500);

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(128);
        let mut decoder = ChunkDecoder::new();

        let mut segments = Vec::new();
        encoder.build_chunk(&original, 0, false, &mut segments).unwrap();
        // 4 chunks, each a header segment plus a body segment
        assert_eq!(segments.len(), 8);
        // continuation headers are fmt 3 on the same csid
        assert_eq!(segments[2][0], 0xC0 | CSID_VIDEO as u8);

        let mut encoded = flatten(&segments);
        let decoded = decoder.decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 500);
        assert_eq!(decoded.header.message_stream_id, 1);
    }

    #[test]
    fn test_fmt3_delta_reuse() {
        let mut encoder = ChunkEncoder::new();

        let fmts: Vec<u8> = [0u32, 40, 80, 120, 161]
            .iter()
            .map(|&ts| {
                let msg = media_message(CSID_AUDIO, MSG_AUDIO, 1, ts, 10);
                let bytes = encode_one(&mut encoder, &msg, ts);
                bytes[0] >> 6
            })
            .collect();

        // first message full header, delta 40 established by fmt 2, then
        // repeated deltas collapse to fmt 3; the 41 delta forces fmt 2
        assert_eq!(fmts, vec![0, 2, 3, 3, 2]);
    }

    #[test]
    fn test_fmt3_sequence_decodes_with_accumulated_timestamps() {
        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let stamps = [0u32, 40, 80, 120, 161];

        let mut wire = BytesMut::new();
        for &ts in &stamps {
            let msg = media_message(CSID_AUDIO, MSG_AUDIO, 1, ts, 10);
            wire.extend_from_slice(&encode_one(&mut encoder, &msg, ts));
        }

        let mut decoded = Vec::new();
        while let Some(msg) = decoder.decode(&mut wire).unwrap() {
            decoded.push(msg.header.timestamp);
        }
        assert_eq!(decoded, stamps);
    }

    #[test]
    fn test_length_change_selects_fmt1() {
        let mut encoder = ChunkEncoder::new();
        let m1 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 0, 10);
        let m2 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 20, 24);
        encode_one(&mut encoder, &m1, 0);
        let bytes = encode_one(&mut encoder, &m2, 20);
        assert_eq!(bytes[0] >> 6, CHUNK_FMT_1);
    }

    #[test]
    fn test_stream_id_change_forces_fmt0() {
        let mut encoder = ChunkEncoder::new();
        let m1 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 0, 10);
        let m2 = media_message(CSID_AUDIO, MSG_AUDIO, 2, 20, 10);
        encode_one(&mut encoder, &m1, 0);
        let bytes = encode_one(&mut encoder, &m2, 20);
        assert_eq!(bytes[0] >> 6, CHUNK_FMT_0);
    }

    #[test]
    fn test_timestamp_regression_forces_fmt0() {
        let mut encoder = ChunkEncoder::new();
        let m1 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 100, 10);
        let m2 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 50, 10);
        encode_one(&mut encoder, &m1, 100);
        let bytes = encode_one(&mut encoder, &m2, 50);
        assert_eq!(bytes[0] >> 6, CHUNK_FMT_0);
    }

    #[test]
    fn test_interleaved_csids() {
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(64);
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(64);

        let audio = media_message(CSID_AUDIO, MSG_AUDIO, 1, 10, 100);
        let video = media_message(CSID_VIDEO, MSG_VIDEO, 1, 12, 200);

        // interleave the two messages' chunks on the wire
        let mut a_segs = Vec::new();
        let mut v_segs = Vec::new();
        encoder.build_chunk(&audio, 10, false, &mut a_segs).unwrap();
        encoder.build_chunk(&video, 12, false, &mut v_segs).unwrap();

        let mut wire = BytesMut::new();
        // audio chunk 1, video chunk 1, audio chunk 2, video rest
        wire.extend_from_slice(&a_segs[0]);
        wire.extend_from_slice(&a_segs[1]);
        wire.extend_from_slice(&v_segs[0]);
        wire.extend_from_slice(&v_segs[1]);
        for seg in &a_segs[2..] {
            wire.extend_from_slice(seg);
        }
        for seg in &v_segs[2..] {
            wire.extend_from_slice(seg);
        }

        let first = decoder.decode(&mut wire).unwrap().unwrap();
        let second = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first.header.message_type, MSG_AUDIO);
        assert_eq!(first.payload, audio.payload);
        assert_eq!(second.header.message_type, MSG_VIDEO);
        assert_eq!(second.payload, video.payload);
    }

    #[test]
    fn test_byte_at_a_time_equivalence() {
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(128);
        let messages: Vec<Message> = (0..3)
            .map(|i| media_message(CSID_AUDIO, MSG_AUDIO, 1, i * 20, 150 + i as usize))
            .collect();

        let mut wire = BytesMut::new();
        for msg in &messages {
            let mut segs = Vec::new();
            encoder
                .build_chunk(msg, msg.header.timestamp, false, &mut segs)
                .unwrap();
            wire.extend_from_slice(&flatten(&segs));
        }

        // all at once
        let mut all_decoder = ChunkDecoder::new();
        let mut all_buf = wire.clone();
        let mut all = Vec::new();
        while let Some(msg) = all_decoder.decode(&mut all_buf).unwrap() {
            all.push(msg);
        }

        // one byte at a time
        let mut inc_decoder = ChunkDecoder::new();
        let mut inc_buf = BytesMut::new();
        let mut incremental = Vec::new();
        for byte in wire.iter() {
            inc_buf.put_u8(*byte);
            while let Some(msg) = inc_decoder.decode(&mut inc_buf).unwrap() {
                incremental.push(msg);
            }
        }

        assert_eq!(all.len(), messages.len());
        assert_eq!(all.len(), incremental.len());
        for (a, b) in all.iter().zip(incremental.iter()) {
            assert_eq!(a.header, b.header);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_incomplete_chunk_consumes_nothing() {
        let mut encoder = ChunkEncoder::new();
        let msg = media_message(CSID_AUDIO, MSG_AUDIO, 1, 0, 100);
        let wire = encode_one(&mut encoder, &msg, 0);

        let mut decoder = ChunkDecoder::new();
        // headers present, payload short by one byte
        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        let before = partial.len();
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);

        // remaining byte completes the message
        partial.put_u8(wire[wire.len() - 1]);
        let decoded = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 100);
    }

    #[test]
    fn test_header_mid_message_rejected() {
        // a fresh fmt 0/1 header on a csid whose message is still being
        // reassembled is corrupt input, even if it shrinks the length
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(128);
        let big = media_message(CSID_VIDEO, MSG_VIDEO, 1, 0, 200);
        let small = media_message(CSID_VIDEO, MSG_VIDEO, 1, 20, 10);

        let mut big_segs = Vec::new();
        let mut small_segs = Vec::new();
        encoder.build_chunk(&big, 0, false, &mut big_segs).unwrap();
        encoder.build_chunk(&small, 20, false, &mut small_segs).unwrap();

        // first chunk of the big message, then the small one's header
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&big_segs[0]);
        wire.extend_from_slice(&big_segs[1]);
        wire.extend_from_slice(&small_segs[0]);
        wire.extend_from_slice(&small_segs[1]);

        let mut decoder = ChunkDecoder::new();
        let err = decoder.decode(&mut wire).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Protocol(ProtocolError::InvalidChunkHeader)
        ));
    }

    #[test]
    fn test_incremental_feed_applies_delta_once() {
        // a starved fmt 2 chunk must not re-apply its delta on each retry
        let mut encoder = ChunkEncoder::new();
        let m1 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 0, 10);
        let m2 = media_message(CSID_AUDIO, MSG_AUDIO, 1, 20, 10);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_one(&mut encoder, &m1, 0));
        wire.extend_from_slice(&encode_one(&mut encoder, &m2, 20));

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        let mut timestamps = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                timestamps.push(msg.header.timestamp);
            }
        }
        assert_eq!(timestamps, vec![0, 20]);
    }

    #[test]
    fn test_fmt1_without_context_rejected() {
        let mut decoder = ChunkDecoder::new();
        // fmt 1 on never-seen csid 5
        let mut buf = BytesMut::from(&[0x45u8, 0, 0, 10, 0, 0, 4, 8][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Protocol(ProtocolError::MissingChunkContext(5))
        ));
    }

    #[test]
    fn test_extended_timestamp_roundtrip() {
        let ts = 0x0100_0000u32; // above the 24-bit field
        let original = media_message(CSID_VIDEO, MSG_VIDEO, 1, ts, 32);

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let mut wire = encode_one(&mut encoder, &original, ts);

        // 3-byte field carries the sentinel
        assert_eq!(read_u24(&wire[1..]), EXTENDED_TIMESTAMP_THRESHOLD);

        let decoded = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.header.timestamp, ts);
    }

    #[test]
    fn test_extended_timestamp_repeats_on_continuation() {
        let ts = 0x0100_0000u32;
        let original = media_message(CSID_VIDEO, MSG_VIDEO, 1, ts, 300);

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(128);
        let mut segments = Vec::new();
        encoder.build_chunk(&original, ts, false, &mut segments).unwrap();

        // continuation header = fmt3 basic byte + 4-byte extended ts
        assert_eq!(segments[2].len(), 5);
        assert_eq!(read_u32(&segments[2][1..]), ts);

        let mut decoder = ChunkDecoder::new();
        let mut wire = flatten(&segments);
        let decoded = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.header.timestamp, ts);
        assert_eq!(decoded.payload.len(), 300);
    }

    #[test]
    fn test_wide_csid_roundtrip() {
        for csid in [64u32, 319, 320, 1000] {
            let original = media_message(csid, MSG_AUDIO, 1, 5, 16);
            let mut encoder = ChunkEncoder::new();
            let mut decoder = ChunkDecoder::new();
            let mut wire = encode_one(&mut encoder, &original, 5);
            let decoded = decoder.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded.header.csid, csid);
            assert_eq!(decoded.payload, original.payload);
        }
    }

    #[test]
    fn test_zero_length_message() {
        let original = media_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, 0);
        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let mut wire = encode_one(&mut encoder, &original, 0);
        let decoded = decoder.decode(&mut wire).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }
}
