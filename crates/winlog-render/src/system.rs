//! Typed extraction of the fixed system properties

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use winlog_core::{
    DecodeError, DecodeResult, FileTime, Guid, RenderedValueSet, Sid, SystemProperty, Variant,
};

/// Where an event sits in its channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub channel: String,
    pub record_id: u64,
}

impl EventPosition {
    pub fn new(channel: impl Into<String>, record_id: u64) -> Self {
        Self {
            channel: channel.into(),
            record_id,
        }
    }
}

/// The system section of an event; a property the event lacks is `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFields {
    pub provider_name: Option<String>,
    pub provider_guid: Option<Guid>,
    pub event_id: Option<u16>,
    pub qualifiers: Option<u16>,
    pub level: Option<u8>,
    pub task: Option<u16>,
    pub opcode: Option<u8>,
    pub keywords: Option<u64>,
    pub time_created: Option<FileTime>,
    pub record_id: Option<u64>,
    pub activity_id: Option<Guid>,
    pub related_activity_id: Option<Guid>,
    pub process_id: Option<u32>,
    pub thread_id: Option<u32>,
    pub channel: Option<String>,
    pub computer: Option<String>,
    pub user_id: Option<Sid>,
    pub version: Option<u8>,
}

/// A system property that was present but could not be decoded
#[derive(Debug)]
pub struct FieldError {
    pub property: SystemProperty,
    pub error: DecodeError,
}

impl FieldError {
    /// Key used when reporting the failure next to other part errors
    pub fn key(&self) -> String {
        format!("system.{}", self.property.name())
    }
}

/// System fields decoded one by one, with the fields that failed
#[derive(Debug, Default)]
pub struct DecodedSystem {
    pub fields: SystemFields,
    pub errors: Vec<FieldError>,
}

struct FieldReader<'s> {
    set: &'s RenderedValueSet,
    errors: Vec<FieldError>,
}

impl<'s> FieldReader<'s> {
    fn read<T>(
        &mut self,
        property: SystemProperty,
        read: impl FnOnce(&Variant<'s>) -> DecodeResult<T>,
    ) -> Option<T> {
        let decoded = self
            .set
            .get(property.index())
            .and_then(|variant| {
                if variant.is_null() {
                    return Ok(None);
                }
                read(&variant).map(Some)
            });
        match decoded {
            Ok(value) => value,
            Err(error) => {
                self.errors.push(FieldError { property, error });
                None
            }
        }
    }
}

impl SystemFields {
    /// Decode a set rendered through a system context
    ///
    /// Only a set too short to be a system render is an error. Each field
    /// is decoded on its own; one that fails is left `None` and reported in
    /// [`DecodedSystem::errors`].
    pub fn from_values(set: &RenderedValueSet) -> DecodeResult<DecodedSystem> {
        if set.len() < SystemProperty::COUNT {
            return Err(DecodeError::malformed(format!(
                "system render holds {} values, expected {}",
                set.len(),
                SystemProperty::COUNT
            )));
        }
        use SystemProperty as P;
        let mut r = FieldReader {
            set,
            errors: Vec::new(),
        };
        let fields = Self {
            provider_name: r.read(P::ProviderName, Variant::as_string),
            provider_guid: r.read(P::ProviderGuid, Variant::as_guid),
            event_id: r.read(P::EventId, Variant::as_u16),
            qualifiers: r.read(P::Qualifiers, Variant::as_u16),
            level: r.read(P::Level, Variant::as_u8),
            task: r.read(P::Task, Variant::as_u16),
            opcode: r.read(P::Opcode, Variant::as_u8),
            keywords: r.read(P::Keywords, Variant::as_unsigned),
            time_created: r.read(P::TimeCreated, Variant::as_file_time),
            record_id: r.read(P::EventRecordId, Variant::as_u64),
            activity_id: r.read(P::ActivityId, Variant::as_guid),
            related_activity_id: r.read(P::RelatedActivityId, Variant::as_guid),
            process_id: r.read(P::ProcessId, Variant::as_u32),
            thread_id: r.read(P::ThreadId, Variant::as_u32),
            channel: r.read(P::Channel, Variant::as_string),
            computer: r.read(P::Computer, Variant::as_string),
            user_id: r.read(P::UserId, Variant::as_sid),
            version: r.read(P::Version, Variant::as_u8),
        };
        Ok(DecodedSystem {
            fields,
            errors: r.errors,
        })
    }

    /// Channel and record id, when both are present
    pub fn position(&self) -> Option<EventPosition> {
        Some(EventPosition::new(self.channel.clone()?, self.record_id?))
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.time_created.and_then(FileTime::to_datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winlog_core::VariantValue;
    use winlog_core::variant::layout::{encode_into, encode_to_set, encoded_len};

    fn system_values() -> Vec<VariantValue> {
        let mut values = vec![VariantValue::Null; SystemProperty::COUNT];
        values[SystemProperty::ProviderName.index()] = "Service Control Manager".into();
        values[SystemProperty::EventId.index()] = VariantValue::UInt16(7036);
        values[SystemProperty::Level.index()] = VariantValue::Byte(4);
        values[SystemProperty::Keywords.index()] = VariantValue::HexInt64(0x8080_0000_0000_0000);
        values[SystemProperty::TimeCreated.index()] =
            VariantValue::FileTime(FileTime::from_raw(126_227_808_000_000_000));
        values[SystemProperty::EventRecordId.index()] = VariantValue::UInt64(10811);
        values[SystemProperty::Channel.index()] = "System".into();
        values[SystemProperty::UserId.index()] =
            VariantValue::Sid(Sid::parse("S-1-5-18").unwrap());
        values
    }

    /// Encode `values`, then replace the first code unit of `needle` with a lone surrogate
    fn with_broken_string(values: &[VariantValue], needle: &str) -> RenderedValueSet {
        let len = encoded_len(values);
        let mut storage = vec![0u64; len.div_ceil(8)];
        let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut storage);
        encode_into(values, bytes).unwrap();
        let units: Vec<u8> = needle.encode_utf16().flat_map(u16::to_ne_bytes).collect();
        let at = bytes.windows(units.len()).position(|w| w == units).unwrap();
        bytes[at..at + 2].copy_from_slice(&0xd800u16.to_ne_bytes());
        RenderedValueSet::from_aligned(storage, len, values.len() as u32).unwrap()
    }

    #[test]
    fn test_typed_extraction() {
        let decoded = SystemFields::from_values(&encode_to_set(&system_values())).unwrap();
        assert!(decoded.errors.is_empty());
        let fields = decoded.fields;

        assert_eq!(fields.provider_name.as_deref(), Some("Service Control Manager"));
        assert_eq!(fields.event_id, Some(7036));
        assert_eq!(fields.keywords, Some(0x8080_0000_0000_0000));
        assert_eq!(fields.qualifiers, None);
        assert_eq!(fields.activity_id, None);
        assert_eq!(fields.user_id.as_ref().unwrap().to_string(), "S-1-5-18");
        assert_eq!(fields.created().unwrap().timestamp(), 978_307_200);
        assert_eq!(fields.position(), Some(EventPosition::new("System", 10811)));
    }

    #[test]
    fn test_short_set_rejected() {
        let set = encode_to_set(&[VariantValue::UInt16(1)]);
        assert!(matches!(
            SystemFields::from_values(&set),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_type_only_loses_that_field() {
        let mut values = system_values();
        values[SystemProperty::EventId.index()] = "7036".into();
        let decoded = SystemFields::from_values(&encode_to_set(&values)).unwrap();

        assert_eq!(decoded.fields.event_id, None);
        assert_eq!(decoded.fields.record_id, Some(10811));
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].key(), "system.event_id");
        assert!(matches!(decoded.errors[0].error, DecodeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_bad_computer_name_keeps_other_fields() {
        let mut values = system_values();
        values[SystemProperty::Computer.index()] = "HOST-01".into();
        let decoded =
            SystemFields::from_values(&with_broken_string(&values, "HOST-01")).unwrap();

        assert_eq!(decoded.fields.computer, None);
        assert_eq!(
            decoded.fields.provider_name.as_deref(),
            Some("Service Control Manager")
        );
        assert_eq!(decoded.fields.event_id, Some(7036));
        assert_eq!(
            decoded.fields.position(),
            Some(EventPosition::new("System", 10811))
        );
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].key(), "system.computer");
        assert!(matches!(decoded.errors[0].error, DecodeError::EncodingError(_)));
    }

    #[test]
    fn test_serializes_to_json() {
        let fields = SystemFields::from_values(&encode_to_set(&system_values()))
            .unwrap()
            .fields;
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["event_id"], 7036);
        assert_eq!(json["channel"], "System");
        assert!(json["qualifiers"].is_null());
    }
}
