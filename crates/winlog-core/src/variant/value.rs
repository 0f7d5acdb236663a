//! Owned variant values

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::VariantKind;
use crate::error::{DecodeError, DecodeResult};
use crate::time::FileTime;

/// A decoded variant that no longer borrows the render buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum VariantValue {
    Null,
    String(String),
    AnsiString(String),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    Guid(Guid),
    SizeT(u64),
    FileTime(FileTime),
    SysTime(DateTime<Utc>),
    Sid(Sid),
    HexInt32(u32),
    HexInt64(u64),
    Handle(u64),
    Xml(String),
    Array {
        kind: VariantKind,
        items: Vec<VariantValue>,
    },
}

impl VariantValue {
    /// The native type tag this value is stored under
    pub fn kind(&self) -> VariantKind {
        match self {
            Self::Null => VariantKind::Null,
            Self::String(_) => VariantKind::String,
            Self::AnsiString(_) => VariantKind::AnsiString,
            Self::SByte(_) => VariantKind::SByte,
            Self::Byte(_) => VariantKind::Byte,
            Self::Int16(_) => VariantKind::Int16,
            Self::UInt16(_) => VariantKind::UInt16,
            Self::Int32(_) => VariantKind::Int32,
            Self::UInt32(_) => VariantKind::UInt32,
            Self::Int64(_) => VariantKind::Int64,
            Self::UInt64(_) => VariantKind::UInt64,
            Self::Single(_) => VariantKind::Single,
            Self::Double(_) => VariantKind::Double,
            Self::Boolean(_) => VariantKind::Boolean,
            Self::Binary(_) => VariantKind::Binary,
            Self::Guid(_) => VariantKind::Guid,
            Self::SizeT(_) => VariantKind::SizeT,
            Self::FileTime(_) => VariantKind::FileTime,
            Self::SysTime(_) => VariantKind::SysTime,
            Self::Sid(_) => VariantKind::Sid,
            Self::HexInt32(_) => VariantKind::HexInt32,
            Self::HexInt64(_) => VariantKind::HexInt64,
            Self::Handle(_) => VariantKind::EvtHandle,
            Self::Xml(_) => VariantKind::EvtXml,
            Self::Array { kind, .. } => *kind,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::AnsiString(s) | Self::Xml(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::String(s) | Self::AnsiString(s) | Self::Xml(s) => f.write_str(s),
            Self::SByte(v) => write!(f, "{}", v),
            Self::Byte(v) => write!(f, "{}", v),
            Self::Int16(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::UInt64(v) | Self::SizeT(v) => write!(f, "{}", v),
            Self::Single(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Binary(bytes) => f.write_str(&hex::encode_upper(bytes)),
            Self::Guid(g) => write!(f, "{}", g),
            Self::FileTime(t) => write!(f, "{}", t),
            Self::SysTime(t) => write!(f, "{}", t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            Self::Sid(s) => write!(f, "{}", s),
            Self::HexInt32(v) => write!(f, "{:#x}", v),
            Self::HexInt64(v) | Self::Handle(v) => write!(f, "{:#x}", v),
            Self::Array { items, .. } => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for VariantValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for VariantValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u32> for VariantValue {
    fn from(v: u32) -> Self {
        Self::UInt32(v)
    }
}

impl From<u64> for VariantValue {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<i32> for VariantValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<bool> for VariantValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

/// A native GUID, displayed in registry form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(pub Uuid);

impl Guid {
    /// Decode the native mixed-endian 16-byte layout
    pub fn from_native_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        let array: [u8; 16] = bytes
            .get(..16)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DecodeError::malformed("short GUID"))?;
        Ok(Self(Uuid::from_bytes_le(array)))
    }

    pub fn to_native_bytes(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Parse with or without braces
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Uuid::encode_buffer();
        f.write_str(self.0.braced().encode_upper(&mut buf))
    }
}

/// A binary security identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(Vec<u8>);

impl Sid {
    const MAX_SUB_AUTHORITIES: u8 = 15;

    /// Total encoded length for a SID with `sub_authorities` entries
    pub fn encoded_len(sub_authorities: u8) -> usize {
        8 + 4 * sub_authorities as usize
    }

    pub fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        if bytes.len() < 8 {
            return Err(DecodeError::malformed("short SID"));
        }
        let subs = bytes[1];
        if subs > Self::MAX_SUB_AUTHORITIES {
            return Err(DecodeError::malformed(format!("SID with {} sub-authorities", subs)));
        }
        let len = Self::encoded_len(subs);
        if bytes.len() < len {
            return Err(DecodeError::malformed("truncated SID"));
        }
        Ok(Self(bytes[..len].to_vec()))
    }

    /// Parse the `S-R-I-S-S...` string form
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.strip_prefix("S-")?.split('-');
        let revision: u8 = parts.next()?.parse().ok()?;
        let authority: u64 = parts.next()?.parse().ok()?;
        if authority >= 1 << 48 {
            return None;
        }
        let subs = parts
            .map(|p| p.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        if subs.len() > Self::MAX_SUB_AUTHORITIES as usize {
            return None;
        }
        let mut bytes = vec![revision, subs.len() as u8];
        bytes.extend_from_slice(&authority.to_be_bytes()[2..]);
        for sub in subs {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut authority = [0u8; 8];
        authority[2..].copy_from_slice(&self.0[2..8]);
        write!(f, "S-{}-{}", self.0[0], u64::from_be_bytes(authority))?;
        for sub in self.0[8..].chunks_exact(4) {
            write!(f, "-{}", u32::from_le_bytes([sub[0], sub[1], sub[2], sub[3]]))?;
        }
        Ok(())
    }
}

impl Serialize for Sid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Sid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Sid::parse(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid SID: {}", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_string_form() {
        let sid = Sid::parse("S-1-5-18").unwrap();
        assert_eq!(sid.as_bytes(), &[1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0]);
        assert_eq!(sid.to_string(), "S-1-5-18");
        assert!(Sid::parse("X-1-5").is_none());
    }

    #[test]
    fn test_guid_native_layout() {
        let guid = Guid::parse("{00112233-4455-6677-8899-AABBCCDDEEFF}").unwrap();
        let bytes = guid.to_native_bytes();
        assert_eq!(&bytes[..4], &[0x33, 0x22, 0x11, 0x00]);
        assert_eq!(Guid::from_native_bytes(&bytes).unwrap(), guid);
        assert_eq!(guid.to_string(), "{00112233-4455-6677-8899-AABBCCDDEEFF}");
    }

    #[test]
    fn test_display_as_strings() {
        assert_eq!(VariantValue::Null.to_string(), "");
        assert_eq!(VariantValue::HexInt32(255).to_string(), "0xff");
        assert_eq!(VariantValue::Binary(vec![0xab, 0x01]).to_string(), "AB01");
        assert_eq!(VariantValue::from("text").to_string(), "text");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&VariantValue::UInt32(7)).unwrap();
        assert_eq!(json, r#"{"type":"UInt32","value":7}"#);
        let sid: VariantValue =
            serde_json::from_str(r#"{"type":"Sid","value":"S-1-5-32-544"}"#).unwrap();
        assert_eq!(sid.to_string(), "S-1-5-32-544");
    }
}
