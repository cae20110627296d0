//! Protocol and user control message handling
//!
//! Purely reactive: every inbound control message yields at most one reply,
//! computed synchronously. Invalid values are fatal to the session.

use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::ChunkDecoder;
use crate::protocol::constants::*;
use crate::protocol::message::{RtmpMessage, UserControlEvent};

/// Flow-control and bandwidth state negotiated with the peer
#[derive(Debug)]
pub struct ControlState {
    /// Bytes the peer may send before expecting our Acknowledgement
    ack_window: u32,
    /// Bytes received since the handshake (wraps like the wire field)
    bytes_received: u32,
    /// Value of `bytes_received` at our last Acknowledgement
    last_ack: u32,
    /// Last sequence number the peer acknowledged
    peer_acked: u32,
    /// Outbound bandwidth limit set by the peer
    peer_bandwidth: u32,
    /// Limit type of the last Set Peer Bandwidth received
    last_limit: Option<u8>,
    /// Window we announced, updated by hard bandwidth limits
    window_ack_size: u32,
}

impl ControlState {
    pub fn new(window_ack_size: u32) -> Self {
        Self {
            ack_window: 0,
            bytes_received: 0,
            last_ack: 0,
            peer_acked: 0,
            peer_bandwidth: 0,
            last_limit: None,
            window_ack_size,
        }
    }

    pub fn ack_window(&self) -> u32 {
        self.ack_window
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    pub fn peer_acked(&self) -> u32 {
        self.peer_acked
    }

    pub fn peer_bandwidth(&self) -> u32 {
        self.peer_bandwidth
    }

    pub fn window_ack_size(&self) -> u32 {
        self.window_ack_size
    }

    /// Count received bytes; returns an Acknowledgement once a window has passed
    pub fn on_bytes_received(&mut self, n: usize) -> Option<RtmpMessage> {
        self.bytes_received = self.bytes_received.wrapping_add(n as u32);

        if self.ack_window == 0 {
            return None;
        }
        if self.bytes_received.wrapping_sub(self.last_ack) < self.ack_window {
            return None;
        }

        self.last_ack = self.bytes_received;
        Some(RtmpMessage::Acknowledgement {
            sequence: self.bytes_received,
        })
    }

    /// Apply a control message
    ///
    /// Returns the reply to queue, if any. `msg` must be a protocol or user
    /// control message; anything else is ignored.
    pub fn handle(
        &mut self,
        msg: &RtmpMessage,
        decoder: &mut ChunkDecoder,
    ) -> Result<Option<RtmpMessage>> {
        match msg {
            RtmpMessage::SetChunkSize(size) => {
                if *size == 0 || *size > MAX_CHUNK_SIZE {
                    return Err(ProtocolError::InvalidChunkSize(*size).into());
                }
                tracing::debug!(size = size, "Peer set chunk size");
                decoder.set_chunk_size(*size);
                Ok(None)
            }

            RtmpMessage::Abort { csid } => {
                tracing::debug!(csid = csid, "Peer aborted chunk stream");
                decoder.abort(*csid);
                Ok(None)
            }

            RtmpMessage::Acknowledgement { sequence } => {
                self.peer_acked = *sequence;
                Ok(None)
            }

            RtmpMessage::WindowAckSize(size) => {
                tracing::debug!(size = size, "Peer window ack size");
                self.ack_window = *size;
                Ok(None)
            }

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                Ok(self.set_peer_bandwidth(*size, *limit_type))
            }

            RtmpMessage::UserControl(event) => Ok(self.handle_user_control(event)),

            _ => Ok(None),
        }
    }

    fn set_peer_bandwidth(&mut self, size: u32, limit_type: u8) -> Option<RtmpMessage> {
        let hard = match limit_type {
            BANDWIDTH_LIMIT_HARD => true,
            BANDWIDTH_LIMIT_DYNAMIC => self.last_limit == Some(BANDWIDTH_LIMIT_HARD),
            _ => false,
        };

        // Dynamic takes the type of the limit it resolved to
        self.last_limit = Some(if hard {
            BANDWIDTH_LIMIT_HARD
        } else {
            BANDWIDTH_LIMIT_SOFT
        });
        self.peer_bandwidth = size;

        tracing::debug!(size = size, limit_type = limit_type, hard = hard, "Peer bandwidth");

        if hard && size != self.window_ack_size {
            self.window_ack_size = size;
            return Some(RtmpMessage::WindowAckSize(size));
        }
        None
    }

    fn handle_user_control(&mut self, event: &UserControlEvent) -> Option<RtmpMessage> {
        match event {
            UserControlEvent::PingRequest(timestamp) => Some(RtmpMessage::UserControl(
                UserControlEvent::PingResponse(*timestamp),
            )),
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                tracing::trace!(stream_id = stream_id, buffer_ms = buffer_ms, "Set buffer length");
                None
            }
            other => {
                tracing::trace!(event = ?other, "User control event");
                None
            }
        }
    }
}
