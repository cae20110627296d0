//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Handshake (C0C1C2/S0S1S2 exchange)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and parsing
//! - Protocol and user control messages

pub mod chunk;
pub mod constants;
pub mod control;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, OutgoingMessage, PacketHeader, RtmpPacket};
pub use control::ControlState;
pub use handshake::{Handshake, HandshakeStage};
pub use message::{Command, ConnectParams, RtmpMessage, UserControlEvent};
