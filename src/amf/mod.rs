//! AMF (Action Message Format) implementation
//!
//! AMF0 is the serialization used by RTMP command messages. AMF3 is only
//! recognized (avmplus-object marker 0x11, command type 17) and never decoded.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfKind, AmfValue, Properties};
