//! Safe decoding of rendered variant arrays
//!
//! A value render fills a caller buffer with a packed array of 16-byte
//! variant records followed by whatever those records point at (strings,
//! binary blobs, GUIDs, SIDs). Each record is:
//!
//! ```text
//! offset 0   8-byte payload union (inline value or pointer)
//! offset 8   u32 count (array length, binary length)
//! offset 12  u32 type code, bit 0x80 set for arrays
//! ```
//!
//! [`RenderedValueSet`] owns such a buffer and [`Variant`] reads one record.
//! Every accessor checks the stored type code before touching the payload,
//! and every pointer payload is resolved as an offset into the owned buffer
//! with bounds checks, so a mismatched accessor or a corrupt pointer becomes
//! a [`DecodeError`] instead of a read of arbitrary memory.

pub mod layout;
mod value;

pub use value::{Guid, Sid, VariantValue};

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};
use crate::handle::RawHandle;
use crate::time::FileTime;

/// Size of one variant record in bytes
pub const VARIANT_SIZE: usize = 16;

/// Type-code bit marking an array payload
pub const VARIANT_ARRAY_FLAG: u32 = 0x80;

/// Mask selecting the base type code
pub const VARIANT_TYPE_MASK: u32 = 0x7f;

/// The type tag of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum VariantKind {
    Null = 0,
    String = 1,
    AnsiString = 2,
    SByte = 3,
    Byte = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Single = 11,
    Double = 12,
    Boolean = 13,
    Binary = 14,
    Guid = 15,
    SizeT = 16,
    FileTime = 17,
    SysTime = 18,
    Sid = 19,
    HexInt32 = 20,
    HexInt64 = 21,
    EvtHandle = 32,
    EvtXml = 35,
}

impl VariantKind {
    pub fn from_code(code: u32) -> DecodeResult<Self> {
        let kind = match code {
            0 => Self::Null,
            1 => Self::String,
            2 => Self::AnsiString,
            3 => Self::SByte,
            4 => Self::Byte,
            5 => Self::Int16,
            6 => Self::UInt16,
            7 => Self::Int32,
            8 => Self::UInt32,
            9 => Self::Int64,
            10 => Self::UInt64,
            11 => Self::Single,
            12 => Self::Double,
            13 => Self::Boolean,
            14 => Self::Binary,
            15 => Self::Guid,
            16 => Self::SizeT,
            17 => Self::FileTime,
            18 => Self::SysTime,
            19 => Self::Sid,
            20 => Self::HexInt32,
            21 => Self::HexInt64,
            32 => Self::EvtHandle,
            35 => Self::EvtXml,
            other => return Err(DecodeError::UnknownKind(other)),
        };
        Ok(kind)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Element width for kinds stored by value inside arrays
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::SByte | Self::Byte => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::HexInt32 | Self::Single | Self::Boolean => Some(4),
            Self::Int64 | Self::UInt64 | Self::HexInt64 | Self::Double | Self::FileTime => Some(8),
            Self::SizeT => Some(std::mem::size_of::<usize>()),
            Self::Guid | Self::SysTime => Some(16),
            _ => None,
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A rendered value buffer together with its variant count
///
/// The buffer is stored as `u64` words so the variant records are 8-byte
/// aligned; `byte_len` is the number of bytes the native layer actually used.
pub struct RenderedValueSet {
    storage: Vec<u64>,
    byte_len: usize,
    count: usize,
}

impl RenderedValueSet {
    /// Wrap a filled buffer; `count` variants must fit inside `byte_len`
    pub fn from_aligned(storage: Vec<u64>, byte_len: usize, count: u32) -> DecodeResult<Self> {
        let count = count as usize;
        if byte_len > storage.len() * 8 {
            return Err(DecodeError::malformed(format!(
                "used length {} exceeds buffer of {} bytes",
                byte_len,
                storage.len() * 8
            )));
        }
        let needed = count
            .checked_mul(VARIANT_SIZE)
            .ok_or_else(|| DecodeError::malformed("variant count overflows"))?;
        if needed > byte_len {
            return Err(DecodeError::malformed(format!(
                "{} variants need {} bytes, buffer holds {}",
                count, needed, byte_len
            )));
        }
        Ok(Self {
            storage,
            byte_len,
            count,
        })
    }

    /// A set with no values, as produced by a zero-length render
    pub fn empty() -> Self {
        Self {
            storage: Vec::new(),
            byte_len: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes of the buffer the native layer filled
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.storage)[..self.byte_len]
    }

    fn base(&self) -> u64 {
        self.storage.as_ptr() as usize as u64
    }

    /// Decode the record at `index`
    pub fn get(&self, index: usize) -> DecodeResult<Variant<'_>> {
        if index >= self.count {
            return Err(DecodeError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        let bytes = self.as_bytes();
        let at = index * VARIANT_SIZE;
        let raw = read_u64(bytes, at);
        let count = read_u32(bytes, at + 8);
        let code = read_u32(bytes, at + 12);
        let kind = VariantKind::from_code(code & VARIANT_TYPE_MASK)?;
        Ok(Variant {
            set: self,
            index,
            kind,
            array: code & VARIANT_ARRAY_FLAG != 0,
            count,
            raw,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = DecodeResult<Variant<'_>>> + '_ {
        (0..self.count).map(move |i| self.get(i))
    }

    /// Decode every record into owned values
    ///
    /// Records are decoded independently. One that fails becomes
    /// [`VariantValue::Null`] and its error is kept in [`DecodedValues::errors`].
    pub fn to_values(&self) -> DecodedValues {
        let mut decoded = DecodedValues {
            values: Vec::with_capacity(self.count),
            errors: Vec::new(),
        };
        for index in 0..self.count {
            match self.get(index).and_then(|v| v.to_value()) {
                Ok(value) => decoded.values.push(value),
                Err(error) => {
                    decoded.values.push(VariantValue::Null);
                    decoded.errors.push((index, error));
                }
            }
        }
        decoded
    }

    /// Resolve a payload pointer to `len` bytes inside the buffer
    fn slice_at(&self, ptr: u64, len: usize) -> DecodeResult<&[u8]> {
        let bytes = self.as_bytes();
        let start = self.offset_of(ptr)?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                DecodeError::malformed(format!(
                    "payload of {} bytes at offset {} runs past the buffer",
                    len, start
                ))
            })?;
        Ok(&bytes[start..end])
    }

    fn offset_of(&self, ptr: u64) -> DecodeResult<usize> {
        if ptr == 0 {
            return Err(DecodeError::malformed("null payload pointer"));
        }
        ptr.checked_sub(self.base())
            .map(|off| off as usize)
            .filter(|off| *off < self.byte_len)
            .ok_or_else(|| DecodeError::malformed(format!("pointer {:#x} is outside the buffer", ptr)))
    }

    /// Read a NUL-terminated UTF-16 string starting at `ptr`
    ///
    /// A non-zero `recorded` length must match the decoded length, which
    /// catches strings cut short by an embedded NUL.
    fn utf16_at(&self, ptr: u64, recorded: u32) -> DecodeResult<String> {
        let start = self.offset_of(ptr)?;
        if start % 2 != 0 {
            return Err(DecodeError::malformed("misaligned wide string"));
        }
        let tail = &self.as_bytes()[start..];
        let units = tail
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]));
        let mut text = Vec::new();
        for unit in units {
            if unit == 0 {
                check_recorded_len(text.len(), recorded)?;
                return String::from_utf16(&text)
                    .map_err(|e| DecodeError::encoding(format!("invalid UTF-16: {}", e)));
            }
            text.push(unit);
        }
        Err(DecodeError::encoding("wide string is not NUL-terminated"))
    }

    /// Read a NUL-terminated narrow string starting at `ptr`
    fn ansi_at(&self, ptr: u64, recorded: u32) -> DecodeResult<String> {
        let start = self.offset_of(ptr)?;
        let tail = &self.as_bytes()[start..];
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DecodeError::encoding("narrow string is not NUL-terminated"))?;
        check_recorded_len(end, recorded)?;
        String::from_utf8(tail[..end].to_vec())
            .map_err(|e| DecodeError::encoding(format!("invalid narrow string: {}", e)))
    }
}

/// Reject a string whose terminator comes before its recorded length
fn check_recorded_len(decoded: usize, recorded: u32) -> DecodeResult<()> {
    if recorded != 0 && decoded != recorded as usize {
        return Err(DecodeError::encoding(format!(
            "string of {} units ends after {}, embedded NUL",
            recorded, decoded
        )));
    }
    Ok(())
}

/// The result of decoding a whole value set record by record
#[derive(Debug, Default)]
pub struct DecodedValues {
    /// One value per record, `Null` where decoding failed
    pub values: Vec<VariantValue>,
    /// Record index and error for every record that failed
    pub errors: Vec<(usize, DecodeError)>,
}

impl DecodedValues {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// All values, or the first record's error if any failed
    pub fn into_result(self) -> DecodeResult<Vec<VariantValue>> {
        match self.errors.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(self.values),
        }
    }
}

impl fmt::Debug for RenderedValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedValueSet")
            .field("count", &self.count)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(word)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(word)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([bytes[at], bytes[at + 1]])
}

/// One decoded variant record borrowed from a [`RenderedValueSet`]
#[derive(Clone, Copy)]
pub struct Variant<'a> {
    set: &'a RenderedValueSet,
    index: usize,
    kind: VariantKind,
    array: bool,
    count: u32,
    raw: u64,
}

impl<'a> Variant<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> VariantKind {
        self.kind
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    /// Array length, or byte length for binary payloads
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_null(&self) -> bool {
        self.kind == VariantKind::Null
    }

    fn scalar(&self, expected: VariantKind) -> DecodeResult<u64> {
        if self.kind != expected {
            return Err(DecodeError::TypeMismatch {
                expected,
                actual: self.kind,
            });
        }
        if self.array {
            return Err(DecodeError::ShapeMismatch {
                kind: self.kind,
                array: true,
            });
        }
        Ok(self.raw)
    }

    fn pointer(&self) -> u64 {
        self.raw as usize as u64
    }

    pub fn as_string(&self) -> DecodeResult<String> {
        self.scalar(VariantKind::String)?;
        self.set.utf16_at(self.pointer(), self.count)
    }

    pub fn as_ansi_string(&self) -> DecodeResult<String> {
        self.scalar(VariantKind::AnsiString)?;
        self.set.ansi_at(self.pointer(), self.count)
    }

    pub fn as_xml(&self) -> DecodeResult<String> {
        self.scalar(VariantKind::EvtXml)?;
        self.set.utf16_at(self.pointer(), self.count)
    }

    pub fn as_bool(&self) -> DecodeResult<bool> {
        Ok(self.scalar(VariantKind::Boolean)? as u32 != 0)
    }

    pub fn as_i8(&self) -> DecodeResult<i8> {
        Ok(self.scalar(VariantKind::SByte)? as u8 as i8)
    }

    pub fn as_u8(&self) -> DecodeResult<u8> {
        Ok(self.scalar(VariantKind::Byte)? as u8)
    }

    pub fn as_i16(&self) -> DecodeResult<i16> {
        Ok(self.scalar(VariantKind::Int16)? as u16 as i16)
    }

    pub fn as_u16(&self) -> DecodeResult<u16> {
        Ok(self.scalar(VariantKind::UInt16)? as u16)
    }

    pub fn as_i32(&self) -> DecodeResult<i32> {
        Ok(self.scalar(VariantKind::Int32)? as u32 as i32)
    }

    pub fn as_u32(&self) -> DecodeResult<u32> {
        Ok(self.scalar(VariantKind::UInt32)? as u32)
    }

    pub fn as_i64(&self) -> DecodeResult<i64> {
        Ok(self.scalar(VariantKind::Int64)? as i64)
    }

    pub fn as_u64(&self) -> DecodeResult<u64> {
        self.scalar(VariantKind::UInt64)
    }

    pub fn as_f32(&self) -> DecodeResult<f32> {
        Ok(f32::from_bits(self.scalar(VariantKind::Single)? as u32))
    }

    pub fn as_f64(&self) -> DecodeResult<f64> {
        Ok(f64::from_bits(self.scalar(VariantKind::Double)?))
    }

    pub fn as_size_t(&self) -> DecodeResult<u64> {
        Ok(self.scalar(VariantKind::SizeT)? as usize as u64)
    }

    pub fn as_hex_i32(&self) -> DecodeResult<u32> {
        Ok(self.scalar(VariantKind::HexInt32)? as u32)
    }

    pub fn as_hex_i64(&self) -> DecodeResult<u64> {
        self.scalar(VariantKind::HexInt64)
    }

    pub fn as_file_time(&self) -> DecodeResult<FileTime> {
        Ok(FileTime(self.scalar(VariantKind::FileTime)?))
    }

    pub fn as_sys_time(&self) -> DecodeResult<DateTime<Utc>> {
        self.scalar(VariantKind::SysTime)?;
        let bytes = self.set.slice_at(self.pointer(), 16)?;
        system_time_from_bytes(bytes)
    }

    pub fn as_guid(&self) -> DecodeResult<Guid> {
        self.scalar(VariantKind::Guid)?;
        let bytes = self.set.slice_at(self.pointer(), 16)?;
        Guid::from_native_bytes(bytes)
    }

    pub fn as_sid(&self) -> DecodeResult<Sid> {
        self.scalar(VariantKind::Sid)?;
        let header = self.set.slice_at(self.pointer(), 8)?;
        let len = Sid::encoded_len(header[1]);
        let bytes = self.set.slice_at(self.pointer(), len)?;
        Sid::from_bytes(bytes)
    }

    pub fn as_binary(&self) -> DecodeResult<&'a [u8]> {
        self.scalar(VariantKind::Binary)?;
        if self.count == 0 {
            return Ok(&[]);
        }
        self.set.slice_at(self.pointer(), self.count as usize)
    }

    pub fn as_handle(&self) -> DecodeResult<RawHandle> {
        Ok(RawHandle(self.scalar(VariantKind::EvtHandle)?))
    }

    /// Any unsigned integer kind, widened
    pub fn as_unsigned(&self) -> DecodeResult<u64> {
        if self.array {
            return Err(DecodeError::ShapeMismatch {
                kind: self.kind,
                array: true,
            });
        }
        match self.kind {
            VariantKind::Byte => Ok(self.raw as u8 as u64),
            VariantKind::UInt16 => Ok(self.raw as u16 as u64),
            VariantKind::UInt32 | VariantKind::HexInt32 => Ok(self.raw as u32 as u64),
            VariantKind::UInt64 | VariantKind::HexInt64 => Ok(self.raw),
            VariantKind::SizeT => Ok(self.raw as usize as u64),
            actual => Err(DecodeError::TypeMismatch {
                expected: VariantKind::UInt64,
                actual,
            }),
        }
    }

    /// Any signed integer kind, widened
    pub fn as_signed(&self) -> DecodeResult<i64> {
        if self.array {
            return Err(DecodeError::ShapeMismatch {
                kind: self.kind,
                array: true,
            });
        }
        match self.kind {
            VariantKind::SByte => Ok(self.raw as u8 as i8 as i64),
            VariantKind::Int16 => Ok(self.raw as u16 as i16 as i64),
            VariantKind::Int32 => Ok(self.raw as u32 as i32 as i64),
            VariantKind::Int64 => Ok(self.raw as i64),
            actual => Err(DecodeError::TypeMismatch {
                expected: VariantKind::Int64,
                actual,
            }),
        }
    }

    /// Decode into an owned value of whatever kind is stored
    pub fn to_value(&self) -> DecodeResult<VariantValue> {
        if self.array {
            return self.array_value();
        }
        let value = match self.kind {
            VariantKind::Null => VariantValue::Null,
            VariantKind::String => VariantValue::String(self.as_string()?),
            VariantKind::AnsiString => VariantValue::AnsiString(self.as_ansi_string()?),
            VariantKind::Binary => VariantValue::Binary(self.as_binary()?.to_vec()),
            VariantKind::Guid => VariantValue::Guid(self.as_guid()?),
            VariantKind::SysTime => VariantValue::SysTime(self.as_sys_time()?),
            VariantKind::Sid => VariantValue::Sid(self.as_sid()?),
            VariantKind::EvtHandle => VariantValue::Handle(self.raw),
            VariantKind::EvtXml => VariantValue::Xml(self.as_xml()?),
            kind => {
                let width = kind.fixed_size().unwrap_or(8);
                fixed_value(kind, &self.raw.to_ne_bytes()[..width])?
            }
        };
        Ok(value)
    }

    fn array_value(&self) -> DecodeResult<VariantValue> {
        let len = self.count as usize;
        let mut items = Vec::new();
        if len > 0 {
            if let Some(width) = self.kind.fixed_size() {
                let bytes = self.set.slice_at(self.pointer(), array_bytes(width, len)?)?;
                items.reserve(len);
                for chunk in bytes.chunks_exact(width) {
                    items.push(fixed_value(self.kind, chunk)?);
                }
            } else {
                let ptr_width = std::mem::size_of::<usize>();
                let table = self.set.slice_at(self.pointer(), array_bytes(ptr_width, len)?)?;
                items.reserve(len);
                for chunk in table.chunks_exact(ptr_width) {
                    let mut word = [0u8; 8];
                    word[..ptr_width].copy_from_slice(chunk);
                    let ptr = u64::from_ne_bytes(word);
                    let item = match self.kind {
                        VariantKind::String => VariantValue::String(self.set.utf16_at(ptr, 0)?),
                        VariantKind::AnsiString => {
                            VariantValue::AnsiString(self.set.ansi_at(ptr, 0)?)
                        }
                        VariantKind::Sid => {
                            let header = self.set.slice_at(ptr, 8)?;
                            let bytes = self.set.slice_at(ptr, Sid::encoded_len(header[1]))?;
                            VariantValue::Sid(Sid::from_bytes(bytes)?)
                        }
                        other => {
                            return Err(DecodeError::malformed(format!(
                                "arrays of {} are not supported",
                                other
                            )));
                        }
                    };
                    items.push(item);
                }
            }
        }
        Ok(VariantValue::Array {
            kind: self.kind,
            items,
        })
    }
}

impl fmt::Debug for Variant<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("array", &self.array)
            .field("count", &self.count)
            .finish()
    }
}

/// Byte length of `len` elements of `width`, rejecting counts that overflow
fn array_bytes(width: usize, len: usize) -> DecodeResult<usize> {
    width
        .checked_mul(len)
        .ok_or_else(|| DecodeError::malformed(format!("array of {} elements overflows", len)))
}

/// Decode one fixed-width element from native-endian bytes
fn fixed_value(kind: VariantKind, bytes: &[u8]) -> DecodeResult<VariantValue> {
    let mut word = [0u8; 8];
    let width = bytes.len().min(8);
    word[..width].copy_from_slice(&bytes[..width]);
    let raw = u64::from_ne_bytes(word);
    let value = match kind {
        VariantKind::SByte => VariantValue::SByte(raw as u8 as i8),
        VariantKind::Byte => VariantValue::Byte(raw as u8),
        VariantKind::Int16 => VariantValue::Int16(raw as u16 as i16),
        VariantKind::UInt16 => VariantValue::UInt16(raw as u16),
        VariantKind::Int32 => VariantValue::Int32(raw as u32 as i32),
        VariantKind::UInt32 => VariantValue::UInt32(raw as u32),
        VariantKind::Int64 => VariantValue::Int64(raw as i64),
        VariantKind::UInt64 => VariantValue::UInt64(raw),
        VariantKind::Single => VariantValue::Single(f32::from_bits(raw as u32)),
        VariantKind::Double => VariantValue::Double(f64::from_bits(raw)),
        VariantKind::Boolean => VariantValue::Boolean(raw as u32 != 0),
        VariantKind::SizeT => VariantValue::SizeT(raw),
        VariantKind::FileTime => VariantValue::FileTime(FileTime(raw)),
        VariantKind::HexInt32 => VariantValue::HexInt32(raw as u32),
        VariantKind::HexInt64 => VariantValue::HexInt64(raw),
        VariantKind::Guid => VariantValue::Guid(Guid::from_native_bytes(bytes)?),
        VariantKind::SysTime => VariantValue::SysTime(system_time_from_bytes(bytes)?),
        other => {
            return Err(DecodeError::malformed(format!(
                "{} is not a fixed-width kind",
                other
            )));
        }
    };
    Ok(value)
}

/// Decode a native SYSTEMTIME (eight u16 fields)
fn system_time_from_bytes(bytes: &[u8]) -> DecodeResult<DateTime<Utc>> {
    if bytes.len() < 16 {
        return Err(DecodeError::malformed("short system time"));
    }
    let field = |i: usize| read_u16(bytes, i * 2) as u32;
    let (year, month, day) = (field(0) as i32, field(1), field(3));
    let (hour, minute, second, millis) = (field(4), field(5), field(6), field(7));
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_milli_opt(hour, minute, second, millis))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DecodeError::malformed("system time fields out of range"))
}
