//! AMF0 encoder and decoder
//!
//! Reference: AMF0 File Format Specification
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! 0x11 - AVM+ (switch to AMF3, recognized but rejected)
//! ```
//!
//! Every length read from the wire is checked against the bytes actually
//! remaining before anything is allocated for it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfKind, AmfValue, Properties};
use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_AVMPLUS: u8 = 0x11;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
#[derive(Debug, Default)]
pub struct Amf0Decoder {
    /// Current nesting depth
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode the next value, failing if it is not of the expected shape
    ///
    /// The marker is checked before the value body is read, so a mismatch
    /// leaves `buf` untouched.
    pub fn expect(&mut self, buf: &mut Bytes, kind: AmfKind) -> Result<AmfValue, AmfError> {
        let marker = *buf.first().ok_or(AmfError::UnexpectedEof)?;
        if !kind.accepts(marker) {
            return Err(AmfError::TypeMismatch {
                expected: kind.name(),
                marker,
            });
        }
        self.decode(buf)
    }

    /// Decode values following a declared shape
    ///
    /// Stops once every kind in `shape` has been matched, leaving any further
    /// elements in `buf`. A buffer that ends cleanly between two elements
    /// yields a shorter result; trailing command arguments are optional on
    /// the wire.
    pub fn decode_shape(
        &mut self,
        buf: &mut Bytes,
        shape: &[AmfKind],
    ) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::with_capacity(shape.len());
        for kind in shape {
            if !buf.has_remaining() {
                break;
            }
            values.push(self.expect(buf, *kind)?);
        }
        Ok(values)
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => self.decode_number(buf),
            MARKER_BOOLEAN => self.decode_boolean(buf),
            MARKER_STRING => Ok(AmfValue::String(self.read_utf8(buf)?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.read_properties(buf)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => self.decode_ecma_array(buf),
            MARKER_STRICT_ARRAY => self.decode_strict_array(buf),
            MARKER_DATE => self.decode_date(buf),
            MARKER_LONG_STRING => Ok(AmfValue::LongString(self.read_utf8_long(buf)?)),
            MARKER_AVMPLUS => Err(AmfError::Amf3NotSupported),
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    fn decode_number(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 8 {
            return Err(AmfError::UnexpectedEof);
        }
        Ok(AmfValue::Number(buf.get_f64()))
    }

    fn decode_boolean(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }
        // Only the canonical bytes re-encode to themselves
        match buf.get_u8() {
            0 => Ok(AmfValue::Boolean(false)),
            1 => Ok(AmfValue::Boolean(true)),
            b => Err(AmfError::InvalidBoolean(b)),
        }
    }

    fn decode_ecma_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::UnexpectedEof);
        }

        // Count hint, not trusted for allocation
        let len = buf.get_u32();
        let properties = self.read_properties(buf)?;
        Ok(AmfValue::EcmaArray { len, properties })
    }

    fn decode_strict_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::UnexpectedEof);
        }

        let count = buf.get_u32() as usize;

        // Each element takes at least its marker byte
        if count > buf.remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            elements.push(self.decode(buf)?);
        }

        Ok(AmfValue::StrictArray(elements))
    }

    fn decode_date(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 10 {
            return Err(AmfError::UnexpectedEof);
        }

        let millis = buf.get_f64();
        let timezone = buf.get_i16();

        Ok(AmfValue::Date { millis, timezone })
    }

    /// Read key/value pairs up to and including the 0x000009 terminator
    fn read_properties(&mut self, buf: &mut Bytes) -> Result<Properties, AmfError> {
        let mut properties = Vec::new();

        loop {
            let key = self.read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::InvalidObjectEnd);
                }
                break;
            }

            let value = self.decode(buf)?;
            properties.push((key, value));
        }

        Ok(properties)
    }

    /// Read UTF-8 string with 16-bit length prefix
    fn read_utf8(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 2 {
            return Err(AmfError::UnexpectedEof);
        }

        let len = buf.get_u16() as usize;
        self.read_utf8_body(buf, len)
    }

    /// Read UTF-8 string with 32-bit length prefix
    fn read_utf8_long(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::UnexpectedEof);
        }

        let len = buf.get_u32() as usize;
        self.read_utf8_body(buf, len)
    }

    fn read_utf8_body(&mut self, buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }

        let bytes = buf.split_to(len);
        std::str::from_utf8(&bytes)
            .map(str::to_owned)
            .map_err(|_| AmfError::InvalidUtf8)
    }
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Continue appending to an existing buffer
    pub fn from_buf(buf: BytesMut) -> Self {
        Self { buf }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Give back the underlying buffer
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    /// Get current encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if encoder is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.write_utf8_long(s);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.write_utf8(s);
                }
            }
            AmfValue::LongString(s) => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.write_utf8_long(s);
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray { len, properties } => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(*len);
                self.write_properties(properties);
            }
            AmfValue::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Date { millis, timezone } => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(*timezone);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &Properties) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }

    fn write_utf8_long(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Append values to `buf`, growing it as needed
pub fn encode_into(values: &[AmfValue], buf: &mut BytesMut) {
    let mut encoder = Amf0Encoder::from_buf(std::mem::take(buf));
    encoder.encode_all(values);
    *buf = encoder.into_inner();
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode(&mut buf)
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode_all(&mut buf)
}
