//! Big-endian wire primitives and the bounded outbound header scratch
//!
//! RTMP is big-endian on the wire except where noted (chunk basic-header
//! csid extension, Set Peer Bandwidth's limit byte). These helpers read
//! from plain slices so callers decide when bytes are actually consumed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::HEADER_SCRATCH_SIZE;

/// Read a big-endian u16 from the start of `buf`.
///
/// Panics if `buf` is shorter than 2 bytes; callers check length first.
pub fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Read a big-endian 24-bit value from the start of `buf`.
pub fn read_u24(buf: &[u8]) -> u32 {
    ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32)
}

/// Read a big-endian u32 from the start of `buf`.
pub fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Read a big-endian u64 from the start of `buf`.
pub fn read_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

/// Write a 24-bit big-endian value.
pub fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

/// Bounds-checked writer over the per-batch header scratch buffer.
///
/// Chunk headers for one send batch are built here and split off as
/// `Bytes` segments. The capacity is a hard cap: running out is a fatal
/// protocol error rather than a reallocation, so a send batch can never
/// grow headers without bound.
pub struct ScratchWriter {
    buf: BytesMut,
    capacity: usize,
    used: usize,
}

impl ScratchWriter {
    pub fn new() -> Self {
        ScratchWriter {
            buf: BytesMut::with_capacity(HEADER_SCRATCH_SIZE),
            capacity: HEADER_SCRATCH_SIZE,
            used: 0,
        }
    }

    /// Bytes written since the last `reset` or `split_segment`.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&mut self, n: usize) -> Result<()> {
        if self.used + n > self.capacity {
            return Err(ProtocolError::HeaderScratchOverflow.into());
        }
        self.used += n;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.ensure(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.ensure(2)?;
        self.buf.put_u16(value);
        Ok(())
    }

    pub fn put_u24(&mut self, value: u32) -> Result<()> {
        self.ensure(3)?;
        put_u24(&mut self.buf, value);
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.ensure(4)?;
        self.buf.put_u32(value);
        Ok(())
    }

    /// Little-endian u32, used only for message stream id in fmt 0 headers.
    pub fn put_u32_le(&mut self, value: u32) -> Result<()> {
        self.ensure(4)?;
        self.buf.put_u32_le(value);
        Ok(())
    }

    /// Detach everything written since the last split as one segment.
    pub fn split_segment(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Reclaim the whole scratch for the next send batch.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.used = 0;
    }
}

impl Default for ScratchWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_read_helpers() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u16(&buf), 0x0102);
        assert_eq!(read_u24(&buf), 0x010203);
        assert_eq!(read_u32(&buf), 0x01020304);
        assert_eq!(read_u64(&buf), 0x0102030405060708);
    }

    #[test]
    fn test_put_u24() {
        let mut buf = BytesMut::new();
        put_u24(&mut buf, 0xABCDEF);
        assert_eq!(&buf[..], &[0xAB, 0xCD, 0xEF]);

        let mut buf = BytesMut::new();
        put_u24(&mut buf, 0x1FFFFFF); // top byte dropped
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_scratch_segments() {
        let mut w = ScratchWriter::new();
        w.put_u8(0x03).unwrap();
        w.put_u24(0x000102).unwrap();
        let seg1 = w.split_segment();
        assert_eq!(&seg1[..], &[0x03, 0x00, 0x01, 0x02]);

        w.put_u32_le(1).unwrap();
        let seg2 = w.split_segment();
        assert_eq!(&seg2[..], &[0x01, 0x00, 0x00, 0x00]);

        // earlier segment is unaffected by later writes
        assert_eq!(&seg1[..], &[0x03, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_scratch_overflow_is_fatal() {
        let mut w = ScratchWriter::new();
        for _ in 0..HEADER_SCRATCH_SIZE / 4 {
            w.put_u32(0xDEADBEEF).unwrap();
        }
        let err = w.put_u8(0).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::HeaderScratchOverflow)
        ));

        // reset reclaims the full capacity
        w.reset();
        w.put_u32(1).unwrap();
    }

    #[test]
    fn test_scratch_cap_survives_splits() {
        // splitting segments hands memory out, it must not reset the cap
        let mut w = ScratchWriter::new();
        for _ in 0..HEADER_SCRATCH_SIZE / 8 {
            w.put_u64_chunk();
        }
        assert!(w.put_u8(0).is_err());
    }

    impl ScratchWriter {
        fn put_u64_chunk(&mut self) {
            self.put_u32(0).unwrap();
            self.put_u32(0).unwrap();
            let _ = self.split_segment();
        }
    }
}
