//! RTMP session state management
//!
//! A [`Session`] is one connection as the engine sees it: the handshake,
//! chunk codec state in both directions, flow-control bookkeeping, the
//! outbound queue and the command-level [`SessionState`]. It never blocks;
//! bytes come from and go to a [`Transport`] supplied by the reactor.

pub mod output;

pub use output::{BufferPool, FlushStatus, OutputQueue};

use std::io;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpPacket};
use crate::protocol::constants::*;
use crate::protocol::control::ControlState;
use crate::protocol::handshake::{Handshake, HandshakeStage};
use crate::protocol::message::{Command, RtmpMessage};
use crate::registry::Role;
use crate::server::config::EngineConfig;

/// Unique session identifier within a worker
pub type SessionId = u64;

/// Non-blocking byte pipe provided by the reactor
pub trait Transport {
    /// Append whatever bytes are available to `buf`
    ///
    /// Returns `Ok(0)` once the peer has closed and `WouldBlock` when
    /// nothing is available right now.
    fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write a prefix of `data` without blocking
    ///
    /// Returns the number of bytes taken, or `WouldBlock` when none fit.
    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// A session's place in a broadcast group, tied to one NetStream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMembership {
    pub name: String,
    pub role: Role,
    /// Message stream id the publish or play command arrived on
    pub stream_id: u32,
    pub receive_audio: bool,
    pub receive_video: bool,
    pub paused: bool,
}

impl StreamMembership {
    pub fn new(name: impl Into<String>, role: Role, stream_id: u32) -> Self {
        Self {
            name: name.into(),
            role,
            stream_id,
            receive_audio: true,
            receive_video: true,
            paused: false,
        }
    }

    /// Whether a relayed message of `type_id` should reach this subscriber
    pub fn accepts(&self, type_id: u8) -> bool {
        if self.paused {
            return false;
        }
        match type_id {
            MSG_AUDIO => self.receive_audio,
            MSG_VIDEO => self.receive_video,
            _ => true,
        }
    }
}

/// Command-level state of a session
#[derive(Debug)]
pub struct SessionState {
    pub id: SessionId,
    /// `connect` succeeded
    pub connected: bool,
    /// Application name from `connect`
    pub app: String,
    /// Broadcast membership, set by publish/play
    pub membership: Option<StreamMembership>,
    next_stream_id: u32,
    open_streams: Vec<u32>,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            connected: false,
            app: String::new(),
            membership: None,
            next_stream_id: 1,
            open_streams: Vec::new(),
        }
    }

    /// Allocate a message stream id, or `None` past `max` open streams
    pub fn allocate_stream(&mut self, max: u32) -> Option<u32> {
        if self.open_streams.len() >= max as usize {
            return None;
        }
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
        self.open_streams.push(id);
        Some(id)
    }

    /// Forget a message stream id; false if it was not open
    pub fn release_stream(&mut self, stream_id: u32) -> bool {
        let before = self.open_streams.len();
        self.open_streams.retain(|id| *id != stream_id);
        self.open_streams.len() != before
    }

    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.open_streams.contains(&stream_id)
    }

    pub fn open_streams(&self) -> &[u32] {
        &self.open_streams
    }
}

/// Per-connection engine state
pub struct Session<T> {
    state: SessionState,
    transport: T,
    handshake: Handshake,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    control: ControlState,
    read_buf: BytesMut,
    output: OutputQueue,
    read_size: usize,
    max_pending: usize,
}

impl<T: Transport> Session<T> {
    pub fn new(id: SessionId, transport: T, config: &EngineConfig) -> Self {
        Self {
            state: SessionState::new(id),
            transport,
            handshake: Handshake::new(config.verify_handshake),
            decoder: ChunkDecoder::with_limits(config.max_message_size, config.max_chunk_streams),
            encoder: ChunkEncoder::new(),
            control: ControlState::new(config.window_ack_size),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            output: OutputQueue::new(config.max_queued_chunks),
            read_size: config.read_buffer_size,
            max_pending: config.max_pending_messages,
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handshake_stage(&self) -> HandshakeStage {
        self.handshake.stage()
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    /// Arm the handshake; called once on accept
    pub fn start(&mut self) -> Result<()> {
        self.handshake.start()
    }

    /// Drain the transport into the read buffer
    ///
    /// Returns `Ok(false)` once the peer has closed.
    pub fn fill_read_buffer(&mut self) -> io::Result<bool> {
        loop {
            self.read_buf.reserve(self.read_size);
            match self.transport.read_available(&mut self.read_buf) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance the handshake with buffered bytes
    ///
    /// Returns true once it has completed, in which case the output chunk
    /// size is announced and chunk traffic may be decoded.
    pub fn drive_handshake(&mut self, out_chunk_size: u32) -> Result<bool> {
        if self.handshake.is_done() {
            return Ok(true);
        }

        while !self.handshake.is_done() {
            let before = self.handshake.stage();
            if let Some(response) = self.handshake.process(&mut self.read_buf)? {
                self.output.push_raw(response);
            }
            if self.handshake.stage() == before {
                return Ok(false);
            }
        }

        tracing::debug!(session_id = self.state.id, "Handshake complete");
        self.send(RtmpMessage::SetChunkSize(out_chunk_size).into_control_packet())?;
        Ok(true)
    }

    /// Next complete message from the read buffer
    pub fn next_packet(&mut self) -> Result<Option<RtmpPacket>> {
        let before = self.read_buf.len();
        let packet = self.decoder.decode(&mut self.read_buf)?;
        let consumed = before - self.read_buf.len();

        if let Some(ack) = self.control.on_bytes_received(consumed) {
            self.send(ack.into_control_packet())?;
        }
        Ok(packet)
    }

    /// Apply a protocol or user control message and queue its reply
    pub fn handle_control(&mut self, msg: &RtmpMessage) -> Result<()> {
        if let Some(reply) = self.control.handle(msg, &mut self.decoder)? {
            self.send(reply.into_control_packet())?;
        }
        Ok(())
    }

    /// Queue a message for sending
    ///
    /// Fails once too many messages are waiting; the caller closes the
    /// session rather than dropping data.
    pub fn send(&mut self, packet: RtmpPacket) -> Result<()> {
        if self.output.pending_messages() >= self.max_pending {
            return Err(Error::Rejected(format!(
                "{} outbound messages pending",
                self.output.pending_messages()
            )));
        }
        self.output.push(packet);
        Ok(())
    }

    /// Queue a command on the command chunk stream for its message stream
    pub fn send_command(&mut self, cmd: Command) -> Result<()> {
        let csid = if cmd.stream_id == 0 {
            CSID_COMMAND
        } else {
            CSID_STREAM_COMMAND
        };
        let stream_id = cmd.stream_id;
        self.send(RtmpMessage::Command(cmd).into_packet(csid, 0, stream_id))
    }

    /// Queue raw bytes ahead of any later message
    pub fn send_raw(&mut self, data: Bytes) {
        self.output.push_raw(data);
    }

    /// Hand queued output to the transport
    pub fn flush(&mut self, pool: &mut BufferPool) -> io::Result<FlushStatus> {
        self.output
            .flush(&mut self.transport, &mut self.encoder, pool)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Return pooled buffers; called on the close path
    pub fn release(&mut self, pool: &mut BufferPool) {
        self.output.release_all(pool);
    }
}
