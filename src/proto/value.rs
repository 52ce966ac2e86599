use std::fmt;

/// Value type tag.
///
/// The discriminants are the bitmask values used for type filters in
/// entry queries; the wire uses its own tags (see `codec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueType {
    Unassigned = 0x00,
    Boolean = 0x01,
    Double = 0x02,
    String = 0x04,
    Raw = 0x08,
    BooleanArray = 0x10,
    DoubleArray = 0x20,
    StringArray = 0x40,
    Rpc = 0x80,
}

impl ValueType {
    pub fn mask(self) -> u32 {
        self as u32
    }

    /// Whether `types` (an OR of masks, 0 meaning "any") selects this type.
    pub fn matches_filter(
        self,
        types: u32,
    ) -> bool {
        types == 0 || (types & self.mask()) != 0
    }
}

/// Entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    /// RPC definition blob
    Rpc(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
            Value::Rpc(_) => ValueType::Rpc,
        }
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self, Value::Rpc(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BooleanArray(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleArray(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Raw(v) => write!(f, "raw[{}]", v.len()),
            Value::BooleanArray(v) => write!(f, "{v:?}"),
            Value::DoubleArray(v) => write!(f, "{v:?}"),
            Value::StringArray(v) => write!(f, "{v:?}"),
            Value::Rpc(v) => write!(f, "rpc[{}]", v.len()),
        }
    }
}
