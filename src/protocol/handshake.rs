//! RTMP handshake implementation
//!
//! The handshake exchanges three packets in each direction:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes) -------------->|
//!   |                                        |
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes) ---------------|
//!   |<------ S2 (1536 bytes) ---------------|
//!   |                                        |
//!   |------- C2 (1536 bytes) -------------->|
//!   |                                        |
//!   |          [Handshake Complete]          |
//! ```
//!
//! Packets are generated in complex (digest) mode: an HMAC-SHA256 digest
//! is embedded at an offset derived from the packet bytes and verified
//! against the peer's role key. A peer whose C1/S1 carries an all-zero
//! version field downgrades the exchange to the simple handshake with no
//! verification. Received C2/S2 is not verified in either mode.
//!
//! Reference: RTMP Specification Section 5.2

use bytes::{Buf, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{
    HANDSHAKE_CLIENT_VERSION, HANDSHAKE_DIGEST_SIZE, HANDSHAKE_PLAYER_KEY,
    HANDSHAKE_PLAYER_SIGN_SIZE, HANDSHAKE_SERVER_KEY, HANDSHAKE_SERVER_SIGN_SIZE,
    HANDSHAKE_SERVER_VERSION, HANDSHAKE_SIZE, RTMP_VERSION,
};

type HmacSha256 = Hmac<Sha256>;

/// Handshake role (client or server)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// Outcome of feeding inbound bytes to the handshake
#[derive(Debug)]
pub enum HandshakeProgress {
    /// Not enough buffered bytes for the next packet; nothing consumed
    NeedMoreData,
    /// A packet was consumed and the returned bytes must be sent
    InProgress(Bytes),
    /// Client consumed S0S1 and a buffered S2 in one pass; send the
    /// returned C2, then only the write completion remains
    Continue(Bytes),
    /// Handshake complete
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Server waits for the client's C0C1
    WaitC0C1,
    /// Server flushed S0S1; S2 follows on write completion
    PostS0S1,
    /// Server flushing S2
    PostS2,
    /// Server waits for the client's C2
    WaitC2,
    /// Client flushing C0C1
    PostC0C1,
    /// Client waits for S0S1
    WaitS0S1,
    /// Client flushing C2 (S2 not yet received)
    PostC2,
    /// Client flushing C2 with S2 already consumed
    Doning,
    Done,
}

/// Handshake state machine
///
/// Drive it with [`start`](Handshake::start), feed inbound bytes to
/// [`handshake`](Handshake::handshake), and report each flushed write via
/// [`write_complete`](Handshake::write_complete), which may hand back the
/// next packet to send.
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    complex: bool,
    /// Our C0+C1 (or S0+S1), version byte included
    first_packet: [u8; HANDSHAKE_SIZE + 1],
    /// C2/S2 built when the peer's first packet checks out
    response: [u8; HANDSHAKE_SIZE],
    /// Peer digest stored at verification time, keys the response digest
    peer_digest: Option<[u8; HANDSHAKE_DIGEST_SIZE]>,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        let mut hs = Handshake {
            role,
            state: match role {
                HandshakeRole::Client => HandshakeState::PostC0C1,
                HandshakeRole::Server => HandshakeState::WaitC0C1,
            },
            complex: true,
            first_packet: [0u8; HANDSHAKE_SIZE + 1],
            response: [0u8; HANDSHAKE_SIZE],
            peer_digest: None,
        };
        create_first_packet(&mut hs.first_packet, role, &mut rand::thread_rng());
        hs
    }

    /// Check if the handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Kick off the exchange.
    ///
    /// The client returns C0C1 to send; the server arms itself to wait
    /// for the client's C0C1 and returns `None`.
    pub fn start(&mut self) -> Option<Bytes> {
        match self.role {
            HandshakeRole::Client => Some(Bytes::copy_from_slice(&self.first_packet)),
            HandshakeRole::Server => None,
        }
    }

    /// Feed inbound bytes.
    ///
    /// Consumes exactly the packets it can act on; with an under-filled
    /// buffer nothing is consumed and `NeedMoreData` is returned.
    pub fn handshake(&mut self, buf: &mut BytesMut) -> Result<HandshakeProgress> {
        match self.state {
            HandshakeState::WaitC0C1 => {
                if buf.len() < HANDSHAKE_SIZE + 1 {
                    return Ok(HandshakeProgress::NeedMoreData);
                }
                self.check_first_packet(&buf[..HANDSHAKE_SIZE + 1])?;
                buf.advance(HANDSHAKE_SIZE + 1);
                self.state = HandshakeState::PostS0S1;
                Ok(HandshakeProgress::InProgress(Bytes::copy_from_slice(
                    &self.first_packet,
                )))
            }
            HandshakeState::WaitS0S1 => {
                if buf.len() < HANDSHAKE_SIZE + 1 {
                    return Ok(HandshakeProgress::NeedMoreData);
                }
                self.check_first_packet(&buf[..HANDSHAKE_SIZE + 1])?;
                buf.advance(HANDSHAKE_SIZE + 1);

                let c2 = Bytes::copy_from_slice(&self.response);
                if buf.len() >= HANDSHAKE_SIZE {
                    // S2 arrived in the same read; consume it unverified
                    buf.advance(HANDSHAKE_SIZE);
                    self.state = HandshakeState::Doning;
                    Ok(HandshakeProgress::Continue(c2))
                } else {
                    self.state = HandshakeState::PostC2;
                    Ok(HandshakeProgress::InProgress(c2))
                }
            }
            HandshakeState::WaitC2 => {
                if buf.len() < HANDSHAKE_SIZE {
                    return Ok(HandshakeProgress::NeedMoreData);
                }
                // C2 is consumed but not verified
                buf.advance(HANDSHAKE_SIZE);
                self.state = HandshakeState::Done;
                Ok(HandshakeProgress::Done)
            }
            HandshakeState::Done => Ok(HandshakeProgress::Done),
            _ => Ok(HandshakeProgress::NeedMoreData),
        }
    }

    /// Report that the previous outbound packet was flushed.
    ///
    /// Returns the next packet to send, if any (the server's S2 follows
    /// its S0S1 flush).
    pub fn write_complete(&mut self) -> Option<Bytes> {
        match self.state {
            HandshakeState::PostS0S1 => {
                self.state = HandshakeState::PostS2;
                Some(Bytes::copy_from_slice(&self.response))
            }
            HandshakeState::PostS2 => {
                self.state = HandshakeState::WaitC2;
                None
            }
            HandshakeState::PostC0C1 => {
                self.state = HandshakeState::WaitS0S1;
                None
            }
            HandshakeState::PostC2 | HandshakeState::Doning => {
                self.state = HandshakeState::Done;
                None
            }
            _ => None,
        }
    }

    /// Validate the peer's C0C1/S0S1 and pre-build our C2/S2.
    fn check_first_packet(&mut self, data: &[u8]) -> Result<()> {
        if data[0] != RTMP_VERSION {
            return Err(HandshakeError::InvalidVersion(data[0]).into());
        }

        let body = &data[1..HANDSHAKE_SIZE + 1];
        if body[4..8] == [0, 0, 0, 0] {
            // Peer runs the simple handshake; downgrade, never retried
            self.complex = false;
        }

        if self.complex {
            let (key, sign_len) = self.peer_sign_key();
            let mut offset = digest_offset(body, 8);
            if !verify_digest(body, offset, &key[..sign_len]) {
                offset = digest_offset(body, 772);
                if !verify_digest(body, offset, &key[..sign_len]) {
                    return Err(HandshakeError::DigestMismatch.into());
                }
            }
            let mut peer_digest = [0u8; HANDSHAKE_DIGEST_SIZE];
            peer_digest.copy_from_slice(&body[offset..offset + HANDSHAKE_DIGEST_SIZE]);
            self.peer_digest = Some(peer_digest);
        }

        self.create_response(body);
        Ok(())
    }

    /// Build C2/S2 from the peer's verified first packet.
    fn create_response(&mut self, peer_body: &[u8]) {
        rand::thread_rng().fill(&mut self.response[..]);

        match self.peer_digest {
            Some(peer_digest) => {
                // Derive the response key from the peer's digest, then
                // sign everything before the trailing digest field
                let own_key = self.own_full_key();
                let key = hmac_sha256(own_key, &peer_digest);
                let tail = HANDSHAKE_SIZE - HANDSHAKE_DIGEST_SIZE;
                let digest = hmac_sha256(&key, &self.response[..tail]);
                self.response[tail..].copy_from_slice(&digest);
            }
            None => {
                // Simple mode echoes the peer's time and version words,
                // stamping our own receive time over the first
                self.response[..8].copy_from_slice(&peer_body[..8]);
                self.response[..4].copy_from_slice(&now_millis().to_be_bytes());
            }
        }
    }

    /// Key material used to verify the peer's first packet.
    fn peer_sign_key(&self) -> (&'static [u8], usize) {
        match self.role {
            // A client checks S1 against the media-server key
            HandshakeRole::Client => (&HANDSHAKE_SERVER_KEY, HANDSHAKE_SERVER_SIGN_SIZE),
            // A server checks C1 against the player key
            HandshakeRole::Server => (&HANDSHAKE_PLAYER_KEY, HANDSHAKE_PLAYER_SIGN_SIZE),
        }
    }

    /// Full role key used to derive the C2/S2 response key.
    fn own_full_key(&self) -> &'static [u8] {
        match self.role {
            HandshakeRole::Client => &HANDSHAKE_PLAYER_KEY,
            HandshakeRole::Server => &HANDSHAKE_SERVER_KEY,
        }
    }
}

/// Locate the digest within a 1536-byte packet body.
///
/// The four bytes at `base` sum to an offset into the 728-byte window
/// that follows them.
fn digest_offset(body: &[u8], base: usize) -> usize {
    let sum = body[base] as usize
        + body[base + 1] as usize
        + body[base + 2] as usize
        + body[base + 3] as usize;
    sum % 728 + base + 4
}

/// HMAC-SHA256 over the packet body with the digest bytes excluded.
fn digest_over_gap(body: &[u8], offset: usize, key: &[u8]) -> [u8; HANDSHAKE_DIGEST_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&body[..offset]);
    mac.update(&body[offset + HANDSHAKE_DIGEST_SIZE..]);
    mac.finalize().into_bytes().into()
}

fn verify_digest(body: &[u8], offset: usize, key: &[u8]) -> bool {
    let expected = digest_over_gap(body, offset, key);
    body[offset..offset + HANDSHAKE_DIGEST_SIZE] == expected
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; HANDSHAKE_DIGEST_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Generate C0+C1 (or S0+S1): version byte, zero time, version marker,
/// random fill, embedded digest.
fn create_first_packet<R: Rng>(packet: &mut [u8; HANDSHAKE_SIZE + 1], role: HandshakeRole, rng: &mut R) {
    rng.fill(&mut packet[..]);
    packet[0] = RTMP_VERSION;
    packet[1..5].copy_from_slice(&[0, 0, 0, 0]);

    let (marker, key, sign_len) = match role {
        HandshakeRole::Client => (
            HANDSHAKE_CLIENT_VERSION,
            &HANDSHAKE_PLAYER_KEY[..],
            HANDSHAKE_PLAYER_SIGN_SIZE,
        ),
        HandshakeRole::Server => (
            HANDSHAKE_SERVER_VERSION,
            &HANDSHAKE_SERVER_KEY[..],
            HANDSHAKE_SERVER_SIGN_SIZE,
        ),
    };
    packet[5..9].copy_from_slice(&marker);

    let body_start = 1;
    let offset = digest_offset(&packet[body_start..], 8);
    let digest = digest_over_gap(&packet[body_start..], offset, &key[..sign_len]);
    packet[body_start + offset..body_start + offset + HANDSHAKE_DIGEST_SIZE]
        .copy_from_slice(&digest);
}
