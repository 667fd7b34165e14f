//! Binary property list (`bplist00`) codec for control-channel bodies

mod decode;
mod encode;


pub use decode::decode;
pub use encode::encode;

use std::collections::BTreeMap;
use thiserror::Error;

/// Reasons a `bplist00` body is refused
#[derive(Debug, Error)]
pub enum PlistError {
    /// Missing `bplist00` magic
    #[error("not a binary plist")]
    InvalidHeader,

    /// Trailer fields are inconsistent with the buffer
    #[error("invalid trailer")]
    InvalidTrailer,

    /// A read ran past the end of the buffer
    #[error("truncated at offset {0}")]
    Truncated(usize),

    /// Object reference points outside the object table
    #[error("invalid object reference {0}")]
    InvalidReference(u64),

    /// Unknown or unsupported object marker byte
    #[error("unsupported object marker 0x{0:02x}")]
    UnsupportedMarker(u8),

    /// Dictionary key is not a string
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// String bytes are not valid text
    #[error("invalid string encoding")]
    InvalidString,

    /// Nesting deeper than the decoder allows (also catches cycles)
    #[error("nesting too deep")]
    TooDeep,
}

/// Decoded property list object
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    /// Boolean value
    Boolean(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Real(f64),
    /// Date as seconds since 2001-01-01 00:00:00 UTC
    Date(f64),
    /// Text
    String(String),
    /// Binary data
    Data(Vec<u8>),
    /// Array of values
    Array(Vec<PlistValue>),
    /// Dictionary with sorted keys
    Dictionary(BTreeMap<String, PlistValue>),
}

impl PlistValue {
    /// Dictionary from key/value pairs
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, PlistValue)>,
    {
        PlistValue::Dictionary(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Integer payload
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        let PlistValue::Integer(i) = self else {
            return None;
        };
        Some(*i)
    }

    /// Non-negative integer payload
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        u64::try_from(self.as_i64()?).ok()
    }

    /// String payload
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        let PlistValue::String(s) = self else {
            return None;
        };
        Some(s)
    }

    /// Data payload
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        let PlistValue::Data(d) = self else {
            return None;
        };
        Some(d)
    }

    /// Array elements
    #[must_use]
    pub fn as_array(&self) -> Option<&[PlistValue]> {
        let PlistValue::Array(a) = self else {
            return None;
        };
        Some(a)
    }

    /// Dictionary entry, `None` for non-dictionaries
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        let PlistValue::Dictionary(d) = self else {
            return None;
        };
        d.get(key)
    }
}

macro_rules! plist_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for PlistValue {
            fn from($v: $ty) -> Self {
                $body
            }
        })*
    };
}

plist_from! {
    bool => |v| PlistValue::Boolean(v),
    i64 => |v| PlistValue::Integer(v),
    u32 => |v| PlistValue::Integer(i64::from(v)),
    u16 => |v| PlistValue::Integer(i64::from(v)),
    f64 => |v| PlistValue::Real(v),
    &str => |v| PlistValue::String(v.to_owned()),
    String => |v| PlistValue::String(v),
    Vec<u8> => |v| PlistValue::Data(v),
    Vec<PlistValue> => |v| PlistValue::Array(v),
}
