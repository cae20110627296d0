//! Test doubles shared by unit tests

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use crate::amf::AmfValue;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpPacket};
use crate::protocol::constants::*;
use crate::protocol::message::{Command, RtmpMessage};
use crate::session::Transport;

/// C0 + C1 as a plain client sends them
pub(crate) fn client_c0c1() -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
    buf.put_u8(RTMP_VERSION);
    buf.put_u32(0);
    buf.put_u32(0);
    for i in 8..HANDSHAKE_SIZE {
        buf.put_u8((i % 251) as u8);
    }
    buf.freeze()
}

/// C2 echoing the S1 found in a server's S0S1S2
pub(crate) fn client_c2(s0s1s2: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&s0s1s2[1..1 + HANDSHAKE_SIZE])
}

/// In-memory transport with scriptable backpressure
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    inbound: BytesMut,
    closed: bool,
    written: Vec<u8>,
    /// Bytes that may still be written before writes block
    write_limit: Option<usize>,
    would_block: bool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.put_slice(data);
    }

    /// Reads return EOF once the inbound bytes are drained
    pub(crate) fn close_inbound(&mut self) {
        self.closed = true;
    }

    pub(crate) fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    pub(crate) fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    pub(crate) fn set_would_block(&mut self, block: bool) {
        self.would_block = block;
    }
}

impl Transport for MockTransport {
    fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if self.inbound.is_empty() {
            if self.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.inbound.len();
        buf.put_slice(&self.inbound.split());
        Ok(n)
    }

    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.would_block {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = match self.write_limit {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(limit) => {
                let n = data.len().min(limit);
                self.write_limit = Some(limit - n);
                n
            }
            None => data.len(),
        };
        self.written.extend_from_slice(&data[..n]);
        Ok(n)
    }
}

/// Client side of a connection: builds chunked input and decodes server output
pub(crate) struct TestClient {
    encoder: ChunkEncoder,
    decoder: ChunkDecoder,
    inbound: BytesMut,
}

impl TestClient {
    pub(crate) fn new() -> Self {
        Self {
            encoder: ChunkEncoder::new(),
            decoder: ChunkDecoder::new(),
            inbound: BytesMut::new(),
        }
    }

    pub(crate) fn c0c1(&self) -> Bytes {
        client_c0c1()
    }

    pub(crate) fn c2(&self, s0s1s2: &[u8]) -> Bytes {
        client_c2(s0s1s2)
    }

    fn encode(&mut self, packet: RtmpPacket) -> Bytes {
        let mut buf = BytesMut::new();
        self.encoder.encode(&packet, &mut buf);
        buf.freeze()
    }

    pub(crate) fn command(
        &mut self,
        name: &str,
        transaction_id: f64,
        stream_id: u32,
        command_object: AmfValue,
        arguments: Vec<AmfValue>,
    ) -> Bytes {
        let cmd = Command {
            name: name.into(),
            transaction_id,
            command_object,
            arguments,
            stream_id,
        };
        let csid = if stream_id == 0 {
            CSID_COMMAND
        } else {
            CSID_STREAM_COMMAND
        };
        self.encode(RtmpMessage::Command(cmd).into_packet(csid, 0, stream_id))
    }

    pub(crate) fn media(&mut self, type_id: u8, timestamp: u32, stream_id: u32, payload: &[u8]) -> Bytes {
        let csid = if type_id == MSG_AUDIO { CSID_AUDIO } else { CSID_VIDEO };
        self.encode(RtmpPacket::new(
            csid,
            timestamp,
            type_id,
            stream_id,
            Bytes::copy_from_slice(payload),
        ))
    }

    pub(crate) fn control(&mut self, msg: RtmpMessage) -> Bytes {
        self.encode(msg.into_control_packet())
    }

    /// A message with an arbitrary payload on the command chunk stream
    pub(crate) fn raw_message(&mut self, type_id: u8, stream_id: u32, payload: &[u8]) -> Bytes {
        self.encode(RtmpPacket::new(
            CSID_COMMAND,
            0,
            type_id,
            stream_id,
            Bytes::copy_from_slice(payload),
        ))
    }

    /// Decode server output, following its chunk size announcements
    pub(crate) fn receive_packets(&mut self, bytes: &[u8]) -> Vec<RtmpPacket> {
        self.inbound.put_slice(bytes);
        let mut packets = Vec::new();
        while let Some(packet) = self.decoder.decode(&mut self.inbound).unwrap() {
            if let Ok(RtmpMessage::SetChunkSize(size)) = RtmpMessage::parse(&packet) {
                self.decoder.set_chunk_size(size);
            }
            packets.push(packet);
        }
        packets
    }

    pub(crate) fn receive(&mut self, bytes: &[u8]) -> Vec<RtmpMessage> {
        self.receive_packets(bytes)
            .iter()
            .map(|p| RtmpMessage::parse(p).unwrap())
            .collect()
    }
}
