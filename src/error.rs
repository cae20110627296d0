//! Unified error types for rtmp-engine
//!
//! Everything that reaches the session close path is an [`Error`]. Command
//! level failures are not errors in this sense: the dispatcher answers them
//! with an `_error`/`onStatus` reply and the session stays open.

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error reported by the transport
    Io(io::Error),
    /// RTMP protocol violation (chunk framing or control message)
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Session rejected by the engine (slow consumer, too many streams)
    Rejected(String),
    /// Connection was closed by the peer
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Rejected(msg) => write!(f, "Session rejected: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Amf(e) => Some(e),
            Error::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

/// Protocol-level errors; all of them are fatal to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidChunkHeader,
    MessageTooLarge { size: u32, max: u32 },
    /// fmt 1/2/3 chunk on a chunk stream that never carried a full header
    MissingPreviousHeader(u32),
    TooManyChunkStreams { limit: usize },
    InvalidChunkSize(u32),
    /// Control message whose payload is shorter than its type requires
    MalformedControl { type_id: u8, len: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::MissingPreviousHeader(id) => {
                write!(f, "No previous header on chunk stream {}", id)
            }
            ProtocolError::TooManyChunkStreams { limit } => {
                write!(f, "Too many concurrent chunk streams (limit {})", limit)
            }
            ProtocolError::InvalidChunkSize(size) => write!(f, "Invalid chunk size: {}", size),
            ProtocolError::MalformedControl { type_id, len } => {
                write!(f, "Malformed control message type {} ({} bytes)", type_id, len)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    NestingTooDeep,
    InvalidObjectEnd,
    /// Boolean byte other than 0x00 or 0x01
    InvalidBoolean(u8),
    /// Value decoded fine but is not the type the caller asked for
    TypeMismatch { expected: &'static str, marker: u8 },
    /// AVM+ marker: AMF3 payloads are recognized but not decoded
    Amf3NotSupported,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
            AmfError::InvalidBoolean(b) => write!(f, "Invalid AMF boolean: 0x{:02x}", b),
            AmfError::TypeMismatch { expected, marker } => {
                write!(f, "Expected AMF {}, found marker 0x{:02x}", expected, marker)
            }
            AmfError::Amf3NotSupported => write!(f, "AMF3 values are not supported"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    InvalidVersion(u8),
    /// Bytes arrived while the handshake was not expecting any
    InvalidState,
    /// C2 does not echo S1
    ResponseMismatch,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
            HandshakeError::ResponseMismatch => write!(f, "Handshake response mismatch"),
        }
    }
}

impl std::error::Error for HandshakeError {}
