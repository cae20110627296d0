//! RTMP handshake implementation (server side)
//!
//! ```text
//! Client                                   Server
//!   |                                        |   Uninitialized
//!   |                                        |   start()  -> AwaitingC1
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|   -> AwaitingC2
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |                                        |   -> Done
//! ```
//!
//! Only the plain handshake is implemented (no HMAC digest). Bytes are taken
//! from the session read buffer exactly as far as the current stage needs;
//! anything after C2 is left in place for the chunk decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Handshake stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Connection accepted, nothing expected yet
    Uninitialized,
    /// Waiting for C0 + C1
    AwaitingC1,
    /// S0S1S2 sent, waiting for C2
    AwaitingC2,
    /// Chunk stream traffic may flow
    Done,
    /// Terminal; the session must be closed
    Failed,
}

/// Server handshake state machine
#[derive(Debug)]
pub struct Handshake {
    stage: HandshakeStage,
    /// Check that C2 echoes the random part of S1
    verify_response: bool,
    /// Our S1 packet, kept until C2 has been verified
    s1: Option<Box<[u8; HANDSHAKE_SIZE]>>,
}

impl Handshake {
    pub fn new(verify_response: bool) -> Self {
        Self {
            stage: HandshakeStage::Uninitialized,
            verify_response,
            s1: None,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Check if handshake is complete
    pub fn is_done(&self) -> bool {
        self.stage == HandshakeStage::Done
    }

    /// Bytes needed before the next state transition
    pub fn bytes_needed(&self) -> usize {
        match self.stage {
            HandshakeStage::AwaitingC1 => 1 + HANDSHAKE_SIZE,
            HandshakeStage::AwaitingC2 => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Arm the state machine once the connection is accepted
    pub fn start(&mut self) -> Result<()> {
        if self.stage != HandshakeStage::Uninitialized {
            return Err(self.fail(HandshakeError::InvalidState));
        }
        self.stage = HandshakeStage::AwaitingC1;
        Ok(())
    }

    /// Consume handshake bytes from `buf`
    ///
    /// Returns S0+S1+S2 once C0C1 has arrived, `None` while more bytes are
    /// needed or after C2 completes the exchange.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.stage {
            HandshakeStage::AwaitingC1 => self.process_c0c1(buf),
            HandshakeStage::AwaitingC2 => self.process_c2(buf),
            _ => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Err(self.fail(HandshakeError::InvalidState))
                }
            }
        }
    }

    fn process_c0c1(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < 1 + HANDSHAKE_SIZE {
            return Ok(None);
        }

        // C0: encoders in the wild send values above 3, only reject older ones
        let version = buf.get_u8();
        if version < RTMP_VERSION {
            return Err(self.fail(HandshakeError::InvalidVersion(version)));
        }

        let c1 = buf.split_to(HANDSHAKE_SIZE);

        let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
        response.put_u8(RTMP_VERSION);

        let s1 = generate_packet();
        response.put_slice(&s1[..]);

        // S2: echo of C1 with our read time in bytes 4-7
        response.put_slice(&c1[..4]);
        response.put_u32(now_millis());
        response.put_slice(&c1[8..]);

        self.s1 = Some(Box::new(s1));
        self.stage = HandshakeStage::AwaitingC2;
        Ok(Some(response.freeze()))
    }

    fn process_c2(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < HANDSHAKE_SIZE {
            return Ok(None);
        }

        let c2 = buf.split_to(HANDSHAKE_SIZE);
        let s1 = self.s1.take();

        if self.verify_response {
            let echoed = s1.map(|s1| s1[8..] == c2[8..]).unwrap_or(false);
            if !echoed {
                return Err(self.fail(HandshakeError::ResponseMismatch));
            }
        }

        self.stage = HandshakeStage::Done;
        Ok(None)
    }

    fn fail(&mut self, err: HandshakeError) -> crate::error::Error {
        self.stage = HandshakeStage::Failed;
        self.s1 = None;
        err.into()
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Generate S1
///
/// Format (1536 bytes):
/// - Bytes 0-3: Timestamp (32-bit, big-endian)
/// - Bytes 4-7: Zero (plain handshake)
/// - Bytes 8-1535: Pseudo-random data
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = now_millis();
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    // The handshake does not need cryptographic randomness
    let mut seed = (timestamp as u64) | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len();
        chunk.copy_from_slice(&bytes[..len]);
    }

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{client_c0c1, client_c2};

    fn started(verify: bool) -> Handshake {
        let mut hs = Handshake::new(verify);
        hs.start().unwrap();
        hs
    }

    #[test]
    fn test_full_exchange() {
        let mut hs = started(true);
        assert_eq!(hs.stage(), HandshakeStage::AwaitingC1);

        let mut buf = BytesMut::from(&client_c0c1()[..]);
        let s0s1s2 = hs.process(&mut buf).unwrap().expect("S0S1S2");
        assert_eq!(s0s1s2.len(), 1 + HANDSHAKE_SIZE * 2);
        assert_eq!(s0s1s2[0], RTMP_VERSION);
        assert!(buf.is_empty());
        assert_eq!(hs.stage(), HandshakeStage::AwaitingC2);

        let mut buf = BytesMut::from(&client_c2(&s0s1s2)[..]);
        buf.put_slice(b"chunk data");
        assert!(hs.process(&mut buf).unwrap().is_none());
        assert!(hs.is_done());
        // Bytes after C2 belong to the chunk stream
        assert_eq!(&buf[..], b"chunk data");
    }

    #[test]
    fn test_s2_echoes_c1() {
        let mut hs = started(true);
        let c0c1 = client_c0c1();
        let mut buf = BytesMut::from(&c0c1[..]);
        let response = hs.process(&mut buf).unwrap().unwrap();

        let s2 = &response[1 + HANDSHAKE_SIZE..];
        assert_eq!(&s2[..4], &c0c1[1..5]);
        assert_eq!(&s2[8..], &c0c1[9..]);
    }

    #[test]
    fn test_s1_layout() {
        let packet = generate_packet();
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert!(packet[8..].iter().any(|b| *b != 0));
    }

    #[test]
    fn test_partial_input_waits() {
        let mut hs = started(true);
        let c0c1 = client_c0c1();

        let mut buf = BytesMut::from(&c0c1[..100]);
        assert!(hs.process(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 100);
        assert_eq!(hs.bytes_needed(), 1 + HANDSHAKE_SIZE);

        buf.put_slice(&c0c1[100..]);
        assert!(hs.process(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_c2_mismatch_fails() {
        let mut hs = started(true);
        let mut buf = BytesMut::from(&client_c0c1()[..]);
        hs.process(&mut buf).unwrap();

        // C2 shifted by one byte, as a short C2 followed by chunk data would be
        let mut buf = BytesMut::from(&[0u8; HANDSHAKE_SIZE][..]);
        assert!(hs.process(&mut buf).is_err());
        assert_eq!(hs.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_c2_not_verified_when_disabled() {
        let mut hs = started(false);
        let mut buf = BytesMut::from(&client_c0c1()[..]);
        hs.process(&mut buf).unwrap();

        let mut buf = BytesMut::from(&[0u8; HANDSHAKE_SIZE][..]);
        hs.process(&mut buf).unwrap();
        assert!(hs.is_done());
    }

    #[test]
    fn test_old_version_rejected() {
        let mut hs = started(true);
        let mut c0c1 = client_c0c1().to_vec();
        c0c1[0] = 2;
        let mut buf = BytesMut::from(&c0c1[..]);
        assert!(hs.process(&mut buf).is_err());
        assert_eq!(hs.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_bytes_before_start_fail() {
        let mut hs = Handshake::new(true);
        let mut buf = BytesMut::from(&[RTMP_VERSION][..]);
        assert!(hs.process(&mut buf).is_err());
        assert_eq!(hs.stage(), HandshakeStage::Failed);

        // Failed is terminal
        assert!(hs.start().is_err());
    }
}
