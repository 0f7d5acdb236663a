//! Numeric flag and index values understood by the native layer

use serde::{Deserialize, Serialize};

/// What a render call produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RenderFlags {
    /// An array of variants selected by a render context
    Values = 0,
    /// The event as an XML document
    Xml = 1,
    /// A bookmark as an XML document
    Bookmark = 2,
}

/// Which field set a render context selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RenderContextFlags {
    /// Fields named by explicit value paths
    Values = 0,
    /// The fixed system property set, see [`SystemProperty`]
    System = 1,
    /// The provider-defined user data fields
    User = 2,
}

/// Part of a provider's message table to format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FormatMessageFlags {
    Event = 1,
    Level = 2,
    Task = 3,
    Opcode = 4,
    Keyword = 5,
    Channel = 6,
    Provider = 7,
    Id = 8,
    Xml = 9,
}

impl FormatMessageFlags {
    pub fn name(self) -> &'static str {
        match self {
            Self::Event => "message",
            Self::Level => "level",
            Self::Task => "task",
            Self::Opcode => "opcode",
            Self::Keyword => "keywords",
            Self::Channel => "channel",
            Self::Provider => "provider",
            Self::Id => "id",
            Self::Xml => "xml",
        }
    }
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SubscribeOrigin {
    ToFutureEvents = 1,
    StartAtOldestRecord = 2,
    StartAfterBookmark = 3,
}

/// Subscription flags as passed to the native subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscribeFlags {
    pub origin: SubscribeOrigin,
    /// Fail instead of falling back when a bookmarked record is gone
    pub strict: bool,
}

impl SubscribeFlags {
    pub const STRICT_BIT: u32 = 0x10000;

    pub fn new(origin: SubscribeOrigin) -> Self {
        Self {
            origin,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn bits(self) -> u32 {
        let base = self.origin as u32;
        if self.strict {
            base | Self::STRICT_BIT
        } else {
            base
        }
    }
}

/// Action code passed to a subscription callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NotifyAction {
    /// The payload is a status code
    Error = 0,
    /// The payload is an event handle
    Deliver = 1,
}

impl NotifyAction {
    pub fn from_raw(action: u32) -> Option<Self> {
        match action {
            0 => Some(Self::Error),
            1 => Some(Self::Deliver),
            _ => None,
        }
    }
}

/// Index of each field in a system render context's value set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum SystemProperty {
    ProviderName = 0,
    ProviderGuid = 1,
    EventId = 2,
    Qualifiers = 3,
    Level = 4,
    Task = 5,
    Opcode = 6,
    Keywords = 7,
    TimeCreated = 8,
    EventRecordId = 9,
    ActivityId = 10,
    RelatedActivityId = 11,
    ProcessId = 12,
    ThreadId = 13,
    Channel = 14,
    Computer = 15,
    UserId = 16,
    Version = 17,
}

impl SystemProperty {
    /// Number of values a system render produces
    pub const COUNT: usize = 18;

    pub const ALL: [SystemProperty; Self::COUNT] = [
        Self::ProviderName,
        Self::ProviderGuid,
        Self::EventId,
        Self::Qualifiers,
        Self::Level,
        Self::Task,
        Self::Opcode,
        Self::Keywords,
        Self::TimeCreated,
        Self::EventRecordId,
        Self::ActivityId,
        Self::RelatedActivityId,
        Self::ProcessId,
        Self::ThreadId,
        Self::Channel,
        Self::Computer,
        Self::UserId,
        Self::Version,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Field name as it appears on decoded system fields
    pub fn name(self) -> &'static str {
        match self {
            Self::ProviderName => "provider_name",
            Self::ProviderGuid => "provider_guid",
            Self::EventId => "event_id",
            Self::Qualifiers => "qualifiers",
            Self::Level => "level",
            Self::Task => "task",
            Self::Opcode => "opcode",
            Self::Keywords => "keywords",
            Self::TimeCreated => "time_created",
            Self::EventRecordId => "record_id",
            Self::ActivityId => "activity_id",
            Self::RelatedActivityId => "related_activity_id",
            Self::ProcessId => "process_id",
            Self::ThreadId => "thread_id",
            Self::Channel => "channel",
            Self::Computer => "computer",
            Self::UserId => "user_id",
            Self::Version => "version",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_bits() {
        assert_eq!(SubscribeFlags::new(SubscribeOrigin::ToFutureEvents).bits(), 1);
        assert_eq!(
            SubscribeFlags::new(SubscribeOrigin::StartAfterBookmark)
                .strict(true)
                .bits(),
            0x10003
        );
    }

    #[test]
    fn test_system_property_indices() {
        for (i, prop) in SystemProperty::ALL.iter().enumerate() {
            assert_eq!(prop.index(), i);
        }
        assert_eq!(SystemProperty::Version.index(), SystemProperty::COUNT - 1);
    }

    #[test]
    fn test_notify_action_from_raw() {
        assert_eq!(NotifyAction::from_raw(1), Some(NotifyAction::Deliver));
        assert_eq!(NotifyAction::from_raw(0), Some(NotifyAction::Error));
        assert_eq!(NotifyAction::from_raw(7), None);
    }
}
