//! AMF value types
//!
//! Objects keep their properties in wire order so that a decoded command can
//! be re-encoded byte for byte.

/// Ordered key/value pairs of an AMF object or ECMA array
pub type Properties = Vec<(String, AmfValue)>;

/// AMF0 value representation
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// IEEE 754 double-precision floating point (0x00)
    Number(f64),

    /// Boolean value (0x01)
    Boolean(bool),

    /// UTF-8 string with 16-bit length prefix (0x02)
    String(String),

    /// Anonymous object (0x03)
    Object(Properties),

    /// Null value (0x05)
    #[default]
    Null,

    /// Undefined value (0x06)
    Undefined,

    /// Associative array (0x08). `len` is the count hint carried on the wire,
    /// which encoders do not always set to the real number of entries.
    EcmaArray { len: u32, properties: Properties },

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),

    /// Milliseconds since Unix epoch plus the (deprecated) timezone field (0x0B)
    Date { millis: f64, timezone: i16 },

    /// UTF-8 string with 32-bit length prefix (0x0C)
    LongString(String),
}

/// Shape a caller expects from the next AMF0 element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmfKind {
    Number,
    Boolean,
    /// Short or long string
    String,
    /// Anonymous object or ECMA array
    Object,
    /// Null or undefined
    Null,
    /// Any value
    Any,
}

impl AmfKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            AmfKind::Number => "number",
            AmfKind::Boolean => "boolean",
            AmfKind::String => "string",
            AmfKind::Object => "object",
            AmfKind::Null => "null",
            AmfKind::Any => "value",
        }
    }

    /// Whether a value of this shape may follow `marker`
    pub(crate) fn accepts(self, marker: u8) -> bool {
        match self {
            AmfKind::Number => marker == 0x00,
            AmfKind::Boolean => marker == 0x01,
            AmfKind::String => marker == 0x02 || marker == 0x0C,
            AmfKind::Object => marker == 0x03 || marker == 0x08,
            AmfKind::Null => marker == 0x05 || marker == 0x06,
            AmfKind::Any => true,
        }
    }
}

impl AmfValue {
    /// Build an ECMA array whose count hint matches its entries
    pub fn ecma_array(properties: Properties) -> Self {
        AmfValue::EcmaArray {
            len: properties.len() as u32,
            properties,
        }
    }

    /// Build an object from `(&str, value)` pairs
    pub fn object<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<AmfValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        AmfValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) | AmfValue::LongString(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get the properties of an object or ECMA array
    pub fn as_object(&self) -> Option<&Properties> {
        match self {
            AmfValue::Object(props) => Some(props),
            AmfValue::EcmaArray { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object value (first match in wire order)
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::StrictArray(v.into_iter().map(|x| x.into()).collect())
    }
}
