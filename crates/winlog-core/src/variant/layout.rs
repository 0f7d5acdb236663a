//! Encoding values into the native variant buffer layout
//!
//! Used by the simulated backend to answer value renders, and by tests and
//! benchmarks to build value sets without a backend.

use chrono::{Datelike, Timelike};

use super::{RenderedValueSet, VARIANT_ARRAY_FLAG, VARIANT_SIZE, VariantKind, VariantValue};

/// Bytes needed to encode `values`
pub fn encoded_len(values: &[VariantValue]) -> usize {
    encode(values, 0).len()
}

/// Encode `values` into `buffer`, whose address anchors the payload pointers
///
/// Returns the number of bytes written, or `None` if the buffer is too small.
pub fn encode_into(values: &[VariantValue], buffer: &mut [u8]) -> Option<usize> {
    let encoded = encode(values, buffer.as_ptr() as usize as u64);
    let target = buffer.get_mut(..encoded.len())?;
    target.copy_from_slice(&encoded);
    Some(encoded.len())
}

/// Build an owned value set, as a successful value render would
pub fn encode_to_set(values: &[VariantValue]) -> RenderedValueSet {
    let len = encoded_len(values);
    let mut storage = vec![0u64; len.div_ceil(8)];
    let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut storage);
    let used = encode_into(values, bytes).unwrap_or(0);
    RenderedValueSet {
        storage,
        byte_len: used,
        count: values.len(),
    }
}

fn encode(values: &[VariantValue], base: u64) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * VARIANT_SIZE];
    for (i, value) in values.iter().enumerate() {
        let (payload, count, code) = encode_payload(value, base, &mut out);
        let at = i * VARIANT_SIZE;
        out[at..at + 8].copy_from_slice(&payload.to_ne_bytes());
        out[at + 8..at + 12].copy_from_slice(&count.to_ne_bytes());
        out[at + 12..at + 16].copy_from_slice(&code.to_ne_bytes());
    }
    out
}

/// Append `bytes` at the next 8-byte boundary and return their address
fn push_blob(out: &mut Vec<u8>, base: u64, bytes: &[u8]) -> u64 {
    while out.len() % 8 != 0 {
        out.push(0);
    }
    let offset = out.len();
    out.extend_from_slice(bytes);
    base + offset as u64
}

fn wide(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_ne_bytes)
        .collect()
}

fn narrow(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn pointer_bytes(ptr: u64) -> Vec<u8> {
    let width = std::mem::size_of::<usize>();
    ptr.to_ne_bytes()[..width].to_vec()
}

fn system_time_bytes(at: &chrono::DateTime<chrono::Utc>) -> [u8; 16] {
    let fields = [
        at.year() as u16,
        at.month() as u16,
        at.weekday().num_days_from_sunday() as u16,
        at.day() as u16,
        at.hour() as u16,
        at.minute() as u16,
        at.second() as u16,
        (at.timestamp_subsec_millis().min(999)) as u16,
    ];
    let mut bytes = [0u8; 16];
    for (i, field) in fields.iter().enumerate() {
        bytes[i * 2..i * 2 + 2].copy_from_slice(&field.to_ne_bytes());
    }
    bytes
}

/// Inline bits for values stored directly in the payload union
fn inline_bits(value: &VariantValue) -> u64 {
    match value {
        VariantValue::SByte(v) => *v as u8 as u64,
        VariantValue::Byte(v) => *v as u64,
        VariantValue::Int16(v) => *v as u16 as u64,
        VariantValue::UInt16(v) => *v as u64,
        VariantValue::Int32(v) => *v as u32 as u64,
        VariantValue::UInt32(v) | VariantValue::HexInt32(v) => *v as u64,
        VariantValue::Int64(v) => *v as u64,
        VariantValue::UInt64(v) | VariantValue::HexInt64(v) | VariantValue::SizeT(v) => *v,
        VariantValue::Single(v) => v.to_bits() as u64,
        VariantValue::Double(v) => v.to_bits(),
        VariantValue::Boolean(v) => *v as u64,
        VariantValue::FileTime(t) => t.0,
        VariantValue::Handle(h) => *h,
        _ => 0,
    }
}

/// Bytes of one element inside a fixed-width array
fn element_bytes(value: &VariantValue) -> Vec<u8> {
    match value {
        VariantValue::Guid(g) => g.to_native_bytes().to_vec(),
        VariantValue::SysTime(t) => system_time_bytes(t).to_vec(),
        other => {
            let width = other.kind().fixed_size().unwrap_or(8);
            inline_bits(other).to_ne_bytes()[..width].to_vec()
        }
    }
}

fn encode_payload(value: &VariantValue, base: u64, out: &mut Vec<u8>) -> (u64, u32, u32) {
    let code = value.kind().code();
    match value {
        VariantValue::Null => (0, 0, code),
        VariantValue::String(s) | VariantValue::Xml(s) => {
            let ptr = push_blob(out, base, &wide(s));
            (ptr, s.encode_utf16().count() as u32, code)
        }
        VariantValue::AnsiString(s) => (push_blob(out, base, &narrow(s)), s.len() as u32, code),
        VariantValue::Binary(bytes) if bytes.is_empty() => (0, 0, code),
        VariantValue::Binary(bytes) => (push_blob(out, base, bytes), bytes.len() as u32, code),
        VariantValue::Guid(g) => (push_blob(out, base, &g.to_native_bytes()), 0, code),
        VariantValue::SysTime(t) => (push_blob(out, base, &system_time_bytes(t)), 0, code),
        VariantValue::Sid(sid) => (push_blob(out, base, sid.as_bytes()), 0, code),
        VariantValue::Array { kind, items } => {
            let code = kind.code() | VARIANT_ARRAY_FLAG;
            if items.is_empty() {
                return (0, 0, code);
            }
            let payload = if kind.fixed_size().is_some() {
                let elements: Vec<u8> = items.iter().flat_map(element_bytes).collect();
                push_blob(out, base, &elements)
            } else {
                let pointers: Vec<u64> = items
                    .iter()
                    .map(|item| match item {
                        VariantValue::AnsiString(s) => push_blob(out, base, &narrow(s)),
                        VariantValue::Sid(sid) => push_blob(out, base, sid.as_bytes()),
                        other => push_blob(out, base, &wide(&other.to_string())),
                    })
                    .collect();
                let table: Vec<u8> = pointers.into_iter().flat_map(pointer_bytes).collect();
                push_blob(out, base, &table)
            };
            (payload, items.len() as u32, code)
        }
        scalar => (inline_bits(scalar), 0, code),
    }
}

#[cfg(test)]
pub(crate) fn poke_u16(set: &mut RenderedValueSet, at: usize, value: u16) {
    let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut set.storage);
    bytes[at..at + 2].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
pub(crate) fn poke_u32(set: &mut RenderedValueSet, at: usize, value: u32) {
    let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut set.storage);
    bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
pub(crate) fn poke_u64(set: &mut RenderedValueSet, at: usize, value: u64) {
    let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut set.storage);
    bytes[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_layout() {
        let set = encode_to_set(&[VariantValue::UInt32(0xabcd)]);
        let bytes = set.as_bytes();
        assert_eq!(bytes.len(), VARIANT_SIZE);
        assert_eq!(u32::from_ne_bytes(bytes[12..16].try_into().unwrap()), 8);
        assert_eq!(u64::from_ne_bytes(bytes[..8].try_into().unwrap()), 0xabcd);
    }

    #[test]
    fn test_payloads_follow_records_aligned() {
        let values = [VariantValue::from("a"), VariantValue::from("b")];
        // two records, then "a\0" padded to 8, then "b\0"
        assert_eq!(encoded_len(&values), 2 * VARIANT_SIZE + 8 + 4);
    }

    #[test]
    fn test_encode_into_rejects_small_buffer() {
        let values = [VariantValue::from("abc")];
        let mut small = vec![0u8; VARIANT_SIZE];
        assert!(encode_into(&values, &mut small).is_none());
    }
}
