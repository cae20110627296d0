//! RTMP message types and parsing
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-3, 5, 6): Chunk/flow control
//! - User Control Messages (type 4): Stream lifecycle and ping
//! - Command Messages (types 17, 20): AMF-encoded commands
//! - Data Messages (types 15, 18): Metadata
//! - Audio/Video/Aggregate Messages (types 8, 9, 22): Media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfKind, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::protocol::chunk::RtmpPacket;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// AMF0 Command (type 20)
    Command(Command),

    /// AMF3 Command (type 17); only the AMF0-compatible body is understood
    CommandAmf3(Command),

    /// AMF0 Data message (type 18) - metadata, etc.
    Data(DataMessage),

    /// Aggregate message (type 22)
    Aggregate { timestamp: u32, data: Bytes },

    /// Anything else, including AMF3 data (type 15)
    Unknown { type_id: u8, data: Bytes },
}

/// User Control Event
#[derive(Debug, Clone, PartialEq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, publish, play, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID
    pub transaction_id: f64,
    /// Command object (often null for NetStream commands)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID (from chunk)
    pub stream_id: u32,
}

/// Data message (@setDataFrame, onMetaData, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    /// Handler name (e.g., "@setDataFrame", "onMetaData")
    pub name: String,
    /// Data values
    pub values: Vec<AmfValue>,
    /// Message stream ID
    pub stream_id: u32,
}

/// Connect command parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    /// Application name
    pub app: String,
    /// Flash version
    pub flash_ver: Option<String>,
    /// TC URL (full RTMP URL)
    pub tc_url: Option<String>,
    /// Page URL
    pub page_url: Option<String>,
    /// Object encoding (AMF version)
    pub object_encoding: f64,
}

impl ConnectParams {
    /// Parse from AMF command object
    pub fn from_amf(obj: &AmfValue) -> Self {
        let mut params = ConnectParams::default();

        if let Some(props) = obj.as_object() {
            for (key, value) in props {
                match key.as_str() {
                    "app" => {
                        if let Some(s) = value.as_str() {
                            params.app = s.to_string();
                        }
                    }
                    "flashVer" | "flashver" => {
                        params.flash_ver = value.as_str().map(|s| s.to_string());
                    }
                    "tcUrl" | "tcurl" => {
                        params.tc_url = value.as_str().map(|s| s.to_string());
                    }
                    "pageUrl" | "pageurl" => {
                        params.page_url = value.as_str().map(|s| s.to_string());
                    }
                    "objectEncoding" | "objectencoding" => {
                        params.object_encoding = value.as_number().unwrap_or(0.0);
                    }
                    _ => {}
                }
            }
        }

        params
    }
}

fn require(payload: &Bytes, type_id: u8, len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(ProtocolError::MalformedControl {
            type_id,
            len: payload.len(),
        }
        .into());
    }
    Ok(())
}

impl RtmpMessage {
    /// Parse a message from a reassembled packet
    ///
    /// Control payloads shorter than their type requires are protocol errors.
    /// Command bodies that fail to decode are AMF errors, which the caller
    /// may treat as recoverable.
    pub fn parse(packet: &RtmpPacket) -> Result<Self> {
        let mut payload = packet.payload.clone();
        let type_id = packet.header.type_id;

        match type_id {
            MSG_SET_CHUNK_SIZE => {
                require(&payload, type_id, 4)?;
                let size = payload.get_u32() & 0x7FFFFFFF; // MSB is reserved
                Ok(RtmpMessage::SetChunkSize(size))
            }

            MSG_ABORT => {
                require(&payload, type_id, 4)?;
                Ok(RtmpMessage::Abort {
                    csid: payload.get_u32(),
                })
            }

            MSG_ACKNOWLEDGEMENT => {
                require(&payload, type_id, 4)?;
                Ok(RtmpMessage::Acknowledgement {
                    sequence: payload.get_u32(),
                })
            }

            MSG_USER_CONTROL => Self::parse_user_control(&mut payload),

            MSG_WINDOW_ACK_SIZE => {
                require(&payload, type_id, 4)?;
                Ok(RtmpMessage::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                require(&payload, type_id, 5)?;
                let size = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(RtmpMessage::Audio {
                timestamp: packet.header.timestamp,
                data: payload,
            }),

            MSG_VIDEO => Ok(RtmpMessage::Video {
                timestamp: packet.header.timestamp,
                data: payload,
            }),

            MSG_COMMAND_AMF0 => {
                let cmd = Command::parse(&mut payload, packet.header.stream_id)?;
                Ok(RtmpMessage::Command(cmd))
            }

            MSG_COMMAND_AMF3 => {
                // Leading format selector byte, then an AMF0 body
                if payload.first() == Some(&0x00) {
                    payload.advance(1);
                }
                let cmd = Command::parse(&mut payload, packet.header.stream_id)?;
                Ok(RtmpMessage::CommandAmf3(cmd))
            }

            MSG_DATA_AMF0 => {
                let data = DataMessage::parse(&mut payload, packet.header.stream_id)?;
                Ok(RtmpMessage::Data(data))
            }

            MSG_AGGREGATE => Ok(RtmpMessage::Aggregate {
                timestamp: packet.header.timestamp,
                data: payload,
            }),

            _ => Ok(RtmpMessage::Unknown {
                type_id,
                data: payload,
            }),
        }
    }

    /// Parse User Control message
    fn parse_user_control(payload: &mut Bytes) -> Result<Self> {
        require(payload, MSG_USER_CONTROL, 6)?;

        let event_type = payload.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(payload.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(payload.get_u32()),
            UC_STREAM_DRY => UserControlEvent::StreamDry(payload.get_u32()),
            UC_SET_BUFFER_LENGTH => {
                if payload.len() < 8 {
                    return Err(ProtocolError::MalformedControl {
                        type_id: MSG_USER_CONTROL,
                        len: payload.len() + 2,
                    }
                    .into());
                }
                let stream_id = payload.get_u32();
                let buffer_ms = payload.get_u32();
                UserControlEvent::SetBufferLength {
                    stream_id,
                    buffer_ms,
                }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(payload.get_u32()),
            UC_PING_REQUEST => UserControlEvent::PingRequest(payload.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(payload.get_u32()),
            _ => UserControlEvent::Unknown {
                event_type,
                data: payload.clone(),
            },
        };

        Ok(RtmpMessage::UserControl(event))
    }

    /// Encode message to (type id, payload)
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => (MSG_SET_CHUNK_SIZE, u32_payload(*size)),

            RtmpMessage::Abort { csid } => (MSG_ABORT, u32_payload(*csid)),

            RtmpMessage::Acknowledgement { sequence } => {
                (MSG_ACKNOWLEDGEMENT, u32_payload(*sequence))
            }

            RtmpMessage::WindowAckSize(size) => (MSG_WINDOW_ACK_SIZE, u32_payload(*size)),

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }

            RtmpMessage::UserControl(event) => (MSG_USER_CONTROL, event.encode()),

            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),

            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),

            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, cmd.encode()),

            RtmpMessage::CommandAmf3(cmd) => {
                let body = cmd.encode();
                let mut buf = BytesMut::with_capacity(body.len() + 1);
                buf.put_u8(0x00);
                buf.put_slice(&body);
                (MSG_COMMAND_AMF3, buf.freeze())
            }

            RtmpMessage::Data(data) => (MSG_DATA_AMF0, data.encode()),

            RtmpMessage::Aggregate { data, .. } => (MSG_AGGREGATE, data.clone()),

            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        }
    }

    /// Wrap into a packet ready for the chunk encoder
    pub fn into_packet(self, csid: u32, timestamp: u32, stream_id: u32) -> RtmpPacket {
        let (type_id, payload) = self.encode();
        RtmpPacket::new(csid, timestamp, type_id, stream_id, payload)
    }

    /// Protocol control messages travel on chunk stream 2, message stream 0
    pub fn into_control_packet(self) -> RtmpPacket {
        self.into_packet(CSID_PROTOCOL_CONTROL, 0, 0)
    }
}

fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

impl UserControlEvent {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            UserControlEvent::StreamBegin(id) => {
                buf.put_u16(UC_STREAM_BEGIN);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamEof(id) => {
                buf.put_u16(UC_STREAM_EOF);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamDry(id) => {
                buf.put_u16(UC_STREAM_DRY);
                buf.put_u32(*id);
            }
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                buf.put_u16(UC_SET_BUFFER_LENGTH);
                buf.put_u32(*stream_id);
                buf.put_u32(*buffer_ms);
            }
            UserControlEvent::StreamIsRecorded(id) => {
                buf.put_u16(UC_STREAM_IS_RECORDED);
                buf.put_u32(*id);
            }
            UserControlEvent::PingRequest(ts) => {
                buf.put_u16(UC_PING_REQUEST);
                buf.put_u32(*ts);
            }
            UserControlEvent::PingResponse(ts) => {
                buf.put_u16(UC_PING_RESPONSE);
                buf.put_u32(*ts);
            }
            UserControlEvent::Unknown { event_type, data } => {
                buf.put_u16(*event_type);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }
}

impl Command {
    /// Decode a command body: name, transaction id, command object, arguments
    pub fn parse(payload: &mut Bytes, stream_id: u32) -> std::result::Result<Self, AmfError> {
        let mut decoder = Amf0Decoder::new();

        let head = decoder.decode_shape(payload, &[AmfKind::String, AmfKind::Number])?;
        let mut head = head.into_iter();
        let name = match head.next() {
            Some(AmfValue::String(s)) | Some(AmfValue::LongString(s)) => s,
            _ => return Err(AmfError::UnexpectedEof),
        };
        // Some encoders omit the transaction id on notifications
        let transaction_id = head.next().and_then(|v| v.as_number()).unwrap_or(0.0);

        let command_object = if payload.has_remaining() {
            decoder.decode(payload)?
        } else {
            AmfValue::Null
        };

        let arguments = decoder.decode_all(payload)?;

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
        })
    }

    /// Encode to an AMF0 body
    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.command_object);
        encoder.encode_all(&self.arguments);
        encoder.finish()
    }

    /// Argument at `index`, or Null when absent
    pub fn arg(&self, index: usize) -> &AmfValue {
        static NULL: AmfValue = AmfValue::Null;
        self.arguments.get(index).unwrap_or(&NULL)
    }

    /// Create a _result response
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Create an _error response
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_ERROR.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Create an onStatus notification on a message stream
    pub fn on_status(
        stream_id: u32,
        transaction_id: f64,
        level: &str,
        code: &str,
        description: &str,
    ) -> Self {
        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments: vec![status_info(level, code, description)],
            stream_id,
        }
    }

    /// Create a server-initiated call such as onFCPublish
    pub fn notify(name: &str, stream_id: u32, info: AmfValue) -> Self {
        Command {
            name: name.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![info],
            stream_id,
        }
    }
}

/// Info object carried by status replies
pub fn status_info(level: &str, code: &str, description: &str) -> AmfValue {
    AmfValue::object([
        ("level", level),
        ("code", code),
        ("description", description),
    ])
}

impl DataMessage {
    fn parse(payload: &mut Bytes, stream_id: u32) -> std::result::Result<Self, AmfError> {
        let mut decoder = Amf0Decoder::new();
        let mut values = decoder.decode_all(payload)?;

        let name = match values.first() {
            Some(v) if v.as_str().is_some() => match values.remove(0) {
                AmfValue::String(s) | AmfValue::LongString(s) => s,
                _ => String::new(),
            },
            _ => String::new(),
        };

        Ok(DataMessage {
            name,
            values,
            stream_id,
        })
    }

    fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode_all(&self.values);
        encoder.finish()
    }
}
