//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a header
//! that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+----------------+-------------------+
//! | Basic Header| Message Header | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)       |
//! +-------------+----------------+-------------------+
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
//! Extended timestamp (4 bytes) is appended when the 3-byte field is 0xFFFFFF
//! ```
//!
//! The decoder is resumable: a chunk is only consumed from the input once its
//! header and data are both available, so it can be fed whatever the socket
//! produced and called again when more arrives.
//!
//! After a type 0 header the stored delta is the absolute timestamp, so a
//! type 3 header starting a new message adds it again (the same convention
//! ffmpeg and librtmp use). Encoder and decoder agree on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// Header of an RTMP message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Message timestamp (milliseconds, wraps at 2^32)
    pub timestamp: u32,
    /// Message length in bytes
    pub length: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub stream_id: u32,
}

/// A complete RTMP message (reassembled from chunks, or about to be chunked)
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl RtmpPacket {
    /// Build a packet; the header length is taken from the payload
    pub fn new(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: PacketHeader {
                csid,
                timestamp,
                length: payload.len() as u32,
                type_id,
                stream_id,
            },
            payload,
        }
    }

    pub fn type_id(&self) -> u8 {
        self.header.type_id
    }
}

/// Per-chunk-stream reassembly slot
#[derive(Debug, Default)]
struct ReassemblySlot {
    /// Header of the current (or last) message; timestamp is absolute
    header: PacketHeader,
    /// Last timestamp delta
    timestamp_delta: u32,
    /// Whether the last header carried an extended timestamp
    extended: bool,
    /// Payload bytes accumulated so far
    payload: BytesMut,
    /// Bytes still missing from the current message; 0 when idle
    remaining: u32,
}

/// Everything learned from peeking at one chunk, before it is committed
#[derive(Debug)]
struct ChunkInfo {
    csid: u32,
    header: PacketHeader,
    timestamp_delta: u32,
    extended: bool,
    /// Starts a new message rather than continuing one
    new_message: bool,
    /// Basic + message + extended header bytes
    header_len: usize,
    data_len: usize,
}

/// Chunk stream decoder
///
/// Handles chunk demultiplexing and message reassembly.
pub struct ChunkDecoder {
    /// Incoming chunk size
    chunk_size: u32,
    /// Per-chunk-stream state
    slots: HashMap<u32, ReassemblySlot>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
    /// Maximum number of distinct chunk stream ids on this session
    max_chunk_streams: usize,
}

impl ChunkDecoder {
    /// Create a new decoder with default chunk size
    pub fn new() -> Self {
        Self::with_limits(MAX_MESSAGE_SIZE, 64)
    }

    pub fn with_limits(max_message_size: u32, max_chunk_streams: usize) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            slots: HashMap::new(),
            max_message_size,
            max_chunk_streams,
        }
    }

    /// Set the chunk size (called when receiving SetChunkSize message)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of chunk streams seen so far
    pub fn chunk_streams(&self) -> usize {
        self.slots.len()
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Consumes as many whole chunks as are available. Returns `Ok(Some)` as
    /// soon as one completes a message, `Ok(None)` when the buffer holds no
    /// further whole chunk.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpPacket>> {
        loop {
            let info = match self.peek_chunk(buf)? {
                Some(info) => info,
                None => return Ok(None),
            };

            buf.advance(info.header_len);
            let data = buf.split_to(info.data_len);

            let slot = self.slots.entry(info.csid).or_default();
            if info.new_message {
                slot.header = info.header;
                slot.timestamp_delta = info.timestamp_delta;
                slot.extended = info.extended;
                slot.remaining = info.header.length;
                // Grows with the data actually received, not the declared length
                slot.payload.clear();
            }

            slot.payload.put_slice(&data);
            slot.remaining -= info.data_len as u32;

            if slot.remaining == 0 {
                return Ok(Some(RtmpPacket {
                    header: slot.header,
                    payload: slot.payload.split().freeze(),
                }));
            }
        }
    }

    /// Parse the next chunk without consuming anything
    fn peek_chunk(&self, buf: &[u8]) -> Result<Option<ChunkInfo>> {
        let mut cur = buf;

        let (fmt, csid) = match parse_basic_header(&mut cur) {
            Some(v) => v,
            None => return Ok(None),
        };

        let slot = self.slots.get(&csid);
        if slot.is_none() {
            if fmt != CHUNK_FMT_0 {
                return Err(ProtocolError::MissingPreviousHeader(csid).into());
            }
            if self.slots.len() >= self.max_chunk_streams {
                return Err(ProtocolError::TooManyChunkStreams {
                    limit: self.max_chunk_streams,
                }
                .into());
            }
        }

        let in_progress = slot.map(|s| s.remaining > 0).unwrap_or(false);
        if in_progress && fmt != CHUNK_FMT_3 {
            // A new header while a message is still incomplete
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        let msg_header_size = match fmt {
            CHUNK_FMT_0 => 11,
            CHUNK_FMT_1 => 7,
            CHUNK_FMT_2 => 3,
            _ => 0,
        };
        if cur.remaining() < msg_header_size {
            return Ok(None);
        }

        let prev = slot.map(|s| s.header).unwrap_or_default();
        let prev_delta = slot.map(|s| s.timestamp_delta).unwrap_or(0);
        let prev_extended = slot.map(|s| s.extended).unwrap_or(false);

        let mut header = prev;
        header.csid = csid;

        let timestamp_field = match fmt {
            CHUNK_FMT_0 => {
                let ts = cur.get_uint(3) as u32;
                header.length = cur.get_uint(3) as u32;
                header.type_id = cur.get_u8();
                header.stream_id = cur.get_u32_le(); // Stream ID is little-endian!
                Some(ts)
            }
            CHUNK_FMT_1 => {
                let ts = cur.get_uint(3) as u32;
                header.length = cur.get_uint(3) as u32;
                header.type_id = cur.get_u8();
                Some(ts)
            }
            CHUNK_FMT_2 => Some(cur.get_uint(3) as u32),
            _ => None,
        };

        let extended = match timestamp_field {
            Some(ts) => ts >= EXTENDED_TIMESTAMP_THRESHOLD,
            None => prev_extended,
        };

        let mut timestamp_value = timestamp_field.unwrap_or(prev_delta);
        if extended {
            if cur.remaining() < 4 {
                return Ok(None);
            }
            let ext = cur.get_u32();
            if timestamp_field.is_some() {
                timestamp_value = ext;
            }
        }

        if header.length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: header.length,
                max: self.max_message_size,
            }
            .into());
        }

        let (timestamp_delta, remaining) = if in_progress {
            // Continuation: the header is the one the message started with
            let s = slot.ok_or(ProtocolError::InvalidChunkHeader)?;
            header = s.header;
            (s.timestamp_delta, s.remaining)
        } else {
            header.timestamp = if fmt == CHUNK_FMT_0 {
                timestamp_value
            } else {
                prev.timestamp.wrapping_add(timestamp_value)
            };
            (timestamp_value, header.length)
        };

        let data_len = remaining.min(self.chunk_size) as usize;
        if cur.remaining() < data_len {
            return Ok(None);
        }

        Ok(Some(ChunkInfo {
            csid,
            header,
            timestamp_delta,
            extended,
            new_message: !in_progress,
            header_len: buf.len() - cur.len(),
            data_len,
        }))
    }

    /// Abort a message on a chunk stream (when receiving Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(slot) = self.slots.get_mut(&csid) {
            slot.payload.clear();
            slot.remaining = 0;
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse basic header and return (fmt, csid), advancing `cur`
fn parse_basic_header(cur: &mut &[u8]) -> Option<(u8, u32)> {
    let first = *cur.first()?;
    let fmt = (first >> 6) & 0x03;

    match first & 0x3F {
        0 => {
            // 2-byte header: csid = 64 + second byte
            if cur.len() < 2 {
                return None;
            }
            let csid = 64 + cur[1] as u32;
            cur.advance(2);
            Some((fmt, csid))
        }
        1 => {
            // 3-byte header: csid = 64 + second + third*256
            if cur.len() < 3 {
                return None;
            }
            let csid = 64 + cur[1] as u32 + (cur[2] as u32) * 256;
            cur.advance(3);
            Some((fmt, csid))
        }
        low => {
            cur.advance(1);
            Some((fmt, low as u32))
        }
    }
}

/// Last header sent on a chunk stream
#[derive(Debug, Clone, Copy)]
struct OutputSlot {
    header: PacketHeader,
    timestamp_delta: u32,
}

/// A message being written out chunk by chunk
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    header: PacketHeader,
    payload: Bytes,
    offset: usize,
    started: bool,
    /// Extended timestamp value repeated on every type 3 chunk, if any
    extended: Option<u32>,
}

impl OutgoingMessage {
    pub fn new(packet: RtmpPacket) -> Self {
        let mut header = packet.header;
        header.length = packet.payload.len() as u32;
        Self {
            header,
            payload: packet.payload,
            offset: 0,
            started: false,
            extended: None,
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Chunk size carried by a Set Chunk Size message
    pub fn announced_chunk_size(&self) -> Option<u32> {
        if self.header.type_id != MSG_SET_CHUNK_SIZE || self.payload.len() < 4 {
            return None;
        }
        let size = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Some(size & 0x7FFFFFFF)
    }
}

/// Chunk stream encoder
///
/// Encodes messages into chunks for transmission, compressing headers
/// against the last header sent on the same chunk stream.
pub struct ChunkEncoder {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Per-chunk-stream state for compression
    slots: HashMap<u32, OutputSlot>,
}

impl ChunkEncoder {
    /// Create a new encoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            slots: HashMap::new(),
        }
    }

    /// Set the chunk size (call after announcing it with SetChunkSize)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Upper bound of bytes one chunk can occupy
    pub fn max_chunk_len(&self) -> usize {
        self.chunk_size as usize + MAX_CHUNK_HEADER
    }

    /// Encode a whole message into `buf`
    pub fn encode(&mut self, packet: &RtmpPacket, buf: &mut BytesMut) {
        let mut msg = OutgoingMessage::new(packet.clone());
        while !self.write_chunk(&mut msg, buf) {}
    }

    /// Write the next chunk of `msg` into `buf`
    ///
    /// The header format is chosen, and the compression cache updated, when
    /// the first chunk is written. Returns true once the message is complete.
    pub fn write_chunk(&mut self, msg: &mut OutgoingMessage, buf: &mut BytesMut) -> bool {
        let csid = msg.header.csid;

        if !msg.started {
            let prev = self.slots.get(&csid).copied();
            let fmt = select_format(&msg.header, prev.as_ref());

            let delta = prev
                .map(|p| msg.header.timestamp.wrapping_sub(p.header.timestamp))
                .unwrap_or(msg.header.timestamp);
            let value = if fmt == CHUNK_FMT_0 {
                msg.header.timestamp
            } else {
                delta
            };
            let extended = value >= EXTENDED_TIMESTAMP_THRESHOLD;
            let field = value.min(EXTENDED_TIMESTAMP_THRESHOLD);

            write_basic_header(csid, fmt, buf);
            match fmt {
                CHUNK_FMT_0 => {
                    write_u24(field, buf);
                    write_u24(msg.header.length, buf);
                    buf.put_u8(msg.header.type_id);
                    buf.put_u32_le(msg.header.stream_id);
                }
                CHUNK_FMT_1 => {
                    write_u24(field, buf);
                    write_u24(msg.header.length, buf);
                    buf.put_u8(msg.header.type_id);
                }
                CHUNK_FMT_2 => {
                    write_u24(field, buf);
                }
                _ => {}
            }
            if extended {
                buf.put_u32(value);
                msg.extended = Some(value);
            }

            self.slots.insert(
                csid,
                OutputSlot {
                    header: msg.header,
                    timestamp_delta: value,
                },
            );
            msg.started = true;
        } else {
            write_basic_header(csid, CHUNK_FMT_3, buf);
            if let Some(value) = msg.extended {
                buf.put_u32(value);
            }
        }

        let len = (msg.payload.len() - msg.offset).min(self.chunk_size as usize);
        buf.put_slice(&msg.payload[msg.offset..msg.offset + len]);
        msg.offset += len;

        msg.offset >= msg.payload.len()
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Select the most compact header format the peer can still decode
fn select_format(header: &PacketHeader, prev: Option<&OutputSlot>) -> u8 {
    let prev = match prev {
        Some(p) => p,
        None => return CHUNK_FMT_0,
    };

    if header.stream_id != prev.header.stream_id
        || header.timestamp < prev.header.timestamp
    {
        return CHUNK_FMT_0;
    }

    if header.type_id != prev.header.type_id || header.length != prev.header.length {
        return CHUNK_FMT_1;
    }

    let delta = header.timestamp.wrapping_sub(prev.header.timestamp);
    if delta == prev.timestamp_delta {
        return CHUNK_FMT_3;
    }

    CHUNK_FMT_2
}

/// Write basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        let csid_offset = csid - 64;
        buf.put_u8((csid_offset & 0xFF) as u8);
        buf.put_u8(((csid_offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

/// Write 24-bit big-endian value
fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn packet(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, len: usize) -> RtmpPacket {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        RtmpPacket::new(csid, timestamp, type_id, stream_id, Bytes::from(payload))
    }

    fn roundtrip(packets: &[RtmpPacket], chunk_size: u32) -> Vec<RtmpPacket> {
        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        encoder.set_chunk_size(chunk_size);
        decoder.set_chunk_size(chunk_size);

        let mut wire = BytesMut::new();
        for p in packets {
            encoder.encode(p, &mut wire);
        }

        let mut out = Vec::new();
        while let Some(p) = decoder.decode(&mut wire).unwrap() {
            out.push(p);
        }
        assert!(wire.is_empty());
        out
    }

    #[test]
    fn test_basic_header_parsing() {
        let mut cur: &[u8] = &[0x03];
        assert_eq!(parse_basic_header(&mut cur), Some((0, 3)));

        let mut cur: &[u8] = &[0x00, 0x00];
        assert_eq!(parse_basic_header(&mut cur), Some((0, 64)));

        let mut cur: &[u8] = &[0x41, 0x00, 0x01];
        assert_eq!(parse_basic_header(&mut cur), Some((1, 320)));
        assert!(cur.is_empty());

        let mut cur: &[u8] = &[0x01, 0x00];
        assert_eq!(parse_basic_header(&mut cur), None);
    }

    #[test]
    fn test_framing_across_chunk_sizes() {
        let len = 1000;
        let original = packet(CSID_VIDEO, 1000, MSG_VIDEO, 1, len);

        for chunk_size in [1, 128, 4096, len as u32, len as u32 + 1] {
            let decoded = roundtrip(std::slice::from_ref(&original), chunk_size);
            assert_eq!(decoded, vec![original.clone()], "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_compressed_sequence_roundtrip() {
        let packets = vec![
            packet(CSID_AUDIO, 0, MSG_AUDIO, 1, 300),
            packet(CSID_AUDIO, 23, MSG_AUDIO, 1, 300),  // fmt 2
            packet(CSID_AUDIO, 46, MSG_AUDIO, 1, 300),  // fmt 3
            packet(CSID_AUDIO, 69, MSG_AUDIO, 1, 17),   // fmt 1
            packet(CSID_AUDIO, 10, MSG_AUDIO, 1, 17),   // backwards: fmt 0
            packet(CSID_AUDIO, 10, MSG_AUDIO, 2, 0),    // other stream, empty
            packet(400, 5, MSG_DATA_AMF0, 1, 40),       // 3-byte basic header
        ];
        assert_eq!(roundtrip(&packets, 128), packets);
    }

    #[test]
    fn test_second_header_is_shorter() {
        let mut encoder = ChunkEncoder::new();

        let mut first = BytesMut::new();
        encoder.encode(&packet(CSID_VIDEO, 0, MSG_VIDEO, 1, 50), &mut first);
        let mut second = BytesMut::new();
        encoder.encode(&packet(CSID_VIDEO, 40, MSG_VIDEO, 1, 50), &mut second);
        let mut third = BytesMut::new();
        encoder.encode(&packet(CSID_VIDEO, 80, MSG_VIDEO, 1, 50), &mut third);

        assert_eq!(first.len() - 50, 12);
        assert_eq!(second.len() - 50, 4);
        assert_eq!(second[0] >> 6, CHUNK_FMT_2);
        assert_eq!(third.len() - 50, 1);
        assert_eq!(third[0] >> 6, CHUNK_FMT_3);
    }

    #[test]
    fn test_extended_timestamp() {
        let packets = vec![
            packet(CSID_VIDEO, 0x0100_0000, MSG_VIDEO, 1, 300),
            packet(CSID_VIDEO, 0x0200_0000, MSG_VIDEO, 1, 300),
            packet(CSID_VIDEO, 0x0300_0000, MSG_VIDEO, 1, 300),
        ];

        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&packets[0], &mut wire);
        // fmt 0, timestamp field saturated, extended timestamp follows
        assert_eq!(&wire[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&wire[12..16], &0x0100_0000u32.to_be_bytes());

        assert_eq!(roundtrip(&packets, 128), packets);
    }

    #[test]
    fn test_timestamp_wraps() {
        let packets = vec![
            packet(CSID_AUDIO, u32::MAX - 10, MSG_AUDIO, 1, 10),
            packet(CSID_AUDIO, 5, MSG_AUDIO, 1, 10),
        ];
        assert_eq!(roundtrip(&packets, 128), packets);
    }

    #[test]
    fn test_declared_length_not_preallocated() {
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::new();
        for csid in 3..11u8 {
            // fmt 0 claiming a 16 MiB message, followed by one chunk of data
            wire.put_u8(csid);
            wire.put_slice(&[0, 0, 0]);
            wire.put_slice(&[0xFF, 0xFF, 0xFF]);
            wire.put_u8(MSG_VIDEO);
            wire.put_u32_le(1);
            wire.put_slice(&[0u8; 128]);
        }

        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
        assert!(wire.is_empty());
        assert_eq!(decoder.chunk_streams(), 8);

        let reserved: usize = decoder.slots.values().map(|s| s.payload.capacity()).sum();
        assert!(reserved < 64 * 1024, "reserved {} bytes", reserved);
    }

    #[test]
    fn test_resumes_across_partial_reads() {
        let original = packet(CSID_VIDEO, 33, MSG_VIDEO, 1, 700);
        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&original, &mut wire);

        let mut decoder = ChunkDecoder::new();
        let mut input = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            input.put_u8(*byte);
            if let Some(p) = decoder.decode(&mut input).unwrap() {
                assert!(decoded.is_none());
                decoded = Some(p);
            }
        }
        assert_eq!(decoded, Some(original));
        assert!(input.is_empty());
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let audio = packet(CSID_AUDIO, 10, MSG_AUDIO, 1, 200);
        let video = packet(CSID_VIDEO, 10, MSG_VIDEO, 1, 200);

        let mut encoder = ChunkEncoder::new();
        let mut a = OutgoingMessage::new(audio.clone());
        let mut v = OutgoingMessage::new(video.clone());
        let mut wire = BytesMut::new();
        encoder.write_chunk(&mut a, &mut wire);
        encoder.write_chunk(&mut v, &mut wire);
        assert!(encoder.write_chunk(&mut a, &mut wire));
        assert!(encoder.write_chunk(&mut v, &mut wire));

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(audio));
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(video));
    }

    #[test]
    fn test_zero_length_message() {
        let empty = packet(CSID_COMMAND, 0, MSG_COMMAND_AMF0, 0, 0);
        assert_eq!(roundtrip(std::slice::from_ref(&empty), 128), vec![empty]);
    }

    #[test]
    fn test_continuation_without_header_fails() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&[0xC3, 0x00][..]); // fmt 3 on csid 3
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MissingPreviousHeader(3))
        ));
    }

    #[test]
    fn test_new_header_mid_message_fails() {
        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        let mut msg = OutgoingMessage::new(packet(CSID_VIDEO, 0, MSG_VIDEO, 1, 300));
        encoder.write_chunk(&mut msg, &mut wire);
        // Another full header on the same csid before the first message ends
        encoder.encode(&packet(CSID_VIDEO, 0, MSG_AUDIO, 2, 10), &mut wire);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut wire).is_err());
    }

    #[test]
    fn test_message_too_large() {
        let mut decoder = ChunkDecoder::with_limits(100, 8);
        let mut wire = BytesMut::new();
        ChunkEncoder::new().encode(&packet(CSID_VIDEO, 0, MSG_VIDEO, 1, 101), &mut wire);
        assert!(matches!(
            decoder.decode(&mut wire),
            Err(Error::Protocol(ProtocolError::MessageTooLarge { size: 101, max: 100 }))
        ));
    }

    #[test]
    fn test_chunk_stream_limit() {
        let mut decoder = ChunkDecoder::with_limits(MAX_MESSAGE_SIZE, 2);
        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        for csid in [3, 4, 5] {
            encoder.encode(&packet(csid, 0, MSG_AUDIO, 1, 4), &mut wire);
        }

        assert!(decoder.decode(&mut wire).unwrap().is_some());
        assert!(decoder.decode(&mut wire).unwrap().is_some());
        assert!(matches!(
            decoder.decode(&mut wire),
            Err(Error::Protocol(ProtocolError::TooManyChunkStreams { limit: 2 }))
        ));
    }

    #[test]
    fn test_abort_discards_partial_message() {
        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        let mut msg = OutgoingMessage::new(packet(CSID_VIDEO, 0, MSG_VIDEO, 1, 300));
        encoder.write_chunk(&mut msg, &mut wire);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        decoder.abort(CSID_VIDEO);

        // After the abort a fresh type 1 header is accepted on the same csid
        let next = packet(CSID_VIDEO, 40, MSG_VIDEO, 1, 20);
        let mut wire = BytesMut::new();
        encoder.encode(&next, &mut wire);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(next));
    }
}
