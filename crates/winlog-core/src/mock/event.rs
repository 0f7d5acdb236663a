//! Synthetic events and publishers for the simulated backend

use std::collections::HashMap;

use quick_xml::escape::escape;

use crate::error::Status;
use crate::flags::SystemProperty;
use crate::time::FileTime;
use crate::variant::{Guid, Sid, VariantValue};

/// An event to append to a simulated channel
#[derive(Debug, Clone, PartialEq)]
pub struct MockEvent {
    pub provider: String,
    pub provider_guid: Option<Guid>,
    pub event_id: u16,
    pub qualifiers: Option<u16>,
    pub version: u8,
    pub level: u8,
    pub task: u16,
    pub opcode: u8,
    pub keywords: u64,
    pub time_created: Option<FileTime>,
    pub activity_id: Option<Guid>,
    pub process_id: u32,
    pub thread_id: u32,
    pub computer: String,
    pub user_id: Option<Sid>,
    pub data: Vec<(String, VariantValue)>,
}

impl MockEvent {
    pub fn new(provider: impl Into<String>, event_id: u16) -> Self {
        Self {
            provider: provider.into(),
            provider_guid: None,
            event_id,
            qualifiers: None,
            version: 0,
            level: 4,
            task: 0,
            opcode: 0,
            keywords: 0x0080_0000_0000_0000,
            time_created: None,
            activity_id: None,
            process_id: 4,
            thread_id: 8,
            computer: "mock-host".to_string(),
            user_id: None,
            data: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_task(mut self, task: u16) -> Self {
        self.task = task;
        self
    }

    pub fn with_opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_keywords(mut self, keywords: u64) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_qualifiers(mut self, qualifiers: u16) -> Self {
        self.qualifiers = Some(qualifiers);
        self
    }

    pub fn with_time(mut self, time: FileTime) -> Self {
        self.time_created = Some(time);
        self
    }

    pub fn with_computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = computer.into();
        self
    }

    pub fn with_user(mut self, sid: Sid) -> Self {
        self.user_id = Some(sid);
        self
    }

    pub fn with_activity(mut self, activity: Guid) -> Self {
        self.activity_id = Some(activity);
        self
    }

    pub fn with_provider_guid(mut self, guid: Guid) -> Self {
        self.provider_guid = Some(guid);
        self
    }

    pub fn with_process(mut self, process_id: u32, thread_id: u32) -> Self {
        self.process_id = process_id;
        self.thread_id = thread_id;
        self
    }

    /// Add a named user data field
    pub fn with_data(mut self, name: impl Into<String>, value: impl Into<VariantValue>) -> Self {
        self.data.push((name.into(), value.into()));
        self
    }
}

/// An event once it has been written to a channel
#[derive(Debug, Clone)]
pub(crate) struct MockRecord {
    pub channel: String,
    pub record_id: u64,
    pub time_created: FileTime,
    pub event: MockEvent,
}

impl MockRecord {
    pub fn system_value(&self, property: SystemProperty) -> VariantValue {
        let e = &self.event;
        let guid = |g: Option<Guid>| g.map(VariantValue::Guid).unwrap_or(VariantValue::Null);
        match property {
            SystemProperty::ProviderName => VariantValue::String(e.provider.clone()),
            SystemProperty::ProviderGuid => guid(e.provider_guid),
            SystemProperty::EventId => VariantValue::UInt16(e.event_id),
            SystemProperty::Qualifiers => e
                .qualifiers
                .map(VariantValue::UInt16)
                .unwrap_or(VariantValue::Null),
            SystemProperty::Level => VariantValue::Byte(e.level),
            SystemProperty::Task => VariantValue::UInt16(e.task),
            SystemProperty::Opcode => VariantValue::Byte(e.opcode),
            SystemProperty::Keywords => VariantValue::HexInt64(e.keywords),
            SystemProperty::TimeCreated => VariantValue::FileTime(self.time_created),
            SystemProperty::EventRecordId => VariantValue::UInt64(self.record_id),
            SystemProperty::ActivityId => guid(e.activity_id),
            SystemProperty::RelatedActivityId => VariantValue::Null,
            SystemProperty::ProcessId => VariantValue::UInt32(e.process_id),
            SystemProperty::ThreadId => VariantValue::UInt32(e.thread_id),
            SystemProperty::Channel => VariantValue::String(self.channel.clone()),
            SystemProperty::Computer => VariantValue::String(e.computer.clone()),
            SystemProperty::UserId => e.user_id.clone().map(VariantValue::Sid).unwrap_or(VariantValue::Null),
            SystemProperty::Version => VariantValue::Byte(e.version),
        }
    }

    pub fn system_values(&self) -> Vec<VariantValue> {
        SystemProperty::ALL
            .iter()
            .map(|p| self.system_value(*p))
            .collect()
    }

    pub fn user_values(&self) -> Vec<VariantValue> {
        self.event.data.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn data_value(&self, name: &str) -> VariantValue {
        self.event
            .data
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(VariantValue::Null)
    }

    /// The event as the native layer would render it
    pub fn to_xml(&self, rendering: Option<&RenderingInfo>) -> String {
        let e = &self.event;
        let mut xml = String::from(
            "<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'><System>",
        );
        xml.push_str(&format!("<Provider Name='{}'", escape(e.provider.as_str())));
        if let Some(guid) = e.provider_guid {
            xml.push_str(&format!(" Guid='{}'", guid));
        }
        xml.push_str("/>");
        match e.qualifiers {
            Some(q) => xml.push_str(&format!("<EventID Qualifiers='{}'>{}</EventID>", q, e.event_id)),
            None => xml.push_str(&format!("<EventID>{}</EventID>", e.event_id)),
        }
        xml.push_str(&format!(
            "<Version>{}</Version><Level>{}</Level><Task>{}</Task><Opcode>{}</Opcode><Keywords>{:#x}</Keywords>",
            e.version, e.level, e.task, e.opcode, e.keywords
        ));
        xml.push_str(&format!("<TimeCreated SystemTime='{}'/>", self.time_created));
        xml.push_str(&format!("<EventRecordID>{}</EventRecordID>", self.record_id));
        match e.activity_id {
            Some(activity) => xml.push_str(&format!("<Correlation ActivityID='{}'/>", activity)),
            None => xml.push_str("<Correlation/>"),
        }
        xml.push_str(&format!(
            "<Execution ProcessID='{}' ThreadID='{}'/>",
            e.process_id, e.thread_id
        ));
        xml.push_str(&format!("<Channel>{}</Channel>", escape(self.channel.as_str())));
        xml.push_str(&format!("<Computer>{}</Computer>", escape(e.computer.as_str())));
        match &e.user_id {
            Some(sid) => xml.push_str(&format!("<Security UserID='{}'/>", sid)),
            None => xml.push_str("<Security/>"),
        }
        xml.push_str("</System>");
        if e.data.is_empty() {
            xml.push_str("<EventData/>");
        } else {
            xml.push_str("<EventData>");
            for (name, value) in &e.data {
                xml.push_str(&format!(
                    "<Data Name='{}'>{}</Data>",
                    escape(name.as_str()),
                    escape(value.to_string().as_str())
                ));
            }
            xml.push_str("</EventData>");
        }
        if let Some(info) = rendering {
            xml.push_str(&info.to_xml());
        }
        xml.push_str("</Event>");
        xml
    }
}

/// Localized strings appended to an event's XML by a full format
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderingInfo {
    pub message: Option<String>,
    pub level: Option<String>,
    pub task: Option<String>,
    pub opcode: Option<String>,
    pub channel: Option<String>,
    pub provider: Option<String>,
    pub keywords: Vec<String>,
}

impl RenderingInfo {
    fn to_xml(&self) -> String {
        let mut xml = String::from("<RenderingInfo Culture='en-US'>");
        let fields = [
            ("Message", &self.message),
            ("Level", &self.level),
            ("Task", &self.task),
            ("Opcode", &self.opcode),
            ("Channel", &self.channel),
            ("Provider", &self.provider),
        ];
        for (tag, value) in fields {
            if let Some(value) = value {
                xml.push_str(&format!("<{tag}>{}</{tag}>", escape(value.as_str())));
            }
        }
        xml.push_str("<Keywords>");
        for keyword in &self.keywords {
            xml.push_str(&format!("<Keyword>{}</Keyword>", escape(keyword.as_str())));
        }
        xml.push_str("</Keywords></RenderingInfo>");
        xml
    }
}

/// A provider's metadata: message templates and display names
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    pub name: String,
    pub display_name: Option<String>,
    pub messages: HashMap<u16, String>,
    pub tasks: HashMap<u16, String>,
    pub opcodes: HashMap<u8, String>,
    pub keywords: Vec<(u64, String)>,
}

impl MockPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Message template for an event id; `%1`..`%n` insert user data values
    pub fn with_message(mut self, event_id: u16, template: impl Into<String>) -> Self {
        self.messages.insert(event_id, template.into());
        self
    }

    pub fn with_task(mut self, task: u16, name: impl Into<String>) -> Self {
        self.tasks.insert(task, name.into());
        self
    }

    pub fn with_opcode(mut self, opcode: u8, name: impl Into<String>) -> Self {
        self.opcodes.insert(opcode, name.into());
        self
    }

    pub fn with_keyword(mut self, mask: u64, name: impl Into<String>) -> Self {
        self.keywords.push((mask, name.into()));
        self
    }

    pub(crate) fn message(&self, record: &MockRecord) -> Result<String, Status> {
        let template = self
            .messages
            .get(&record.event.event_id)
            .ok_or(Status::EVT_MESSAGE_NOT_FOUND)?;
        Ok(expand_inserts(template, &record.user_values()))
    }

    pub(crate) fn task(&self, task: u16) -> Result<String, Status> {
        match self.tasks.get(&task) {
            Some(name) => Ok(name.clone()),
            None if task == 0 => Ok("None".to_string()),
            None => Err(Status::EVT_MESSAGE_ID_NOT_FOUND),
        }
    }

    pub(crate) fn opcode(&self, opcode: u8) -> Result<String, Status> {
        match self.opcodes.get(&opcode) {
            Some(name) => Ok(name.clone()),
            None => standard_opcode(opcode),
        }
    }

    pub(crate) fn keyword_names(&self, keywords: u64) -> Vec<String> {
        let mut names = standard_keywords(keywords);
        names.extend(
            self.keywords
                .iter()
                .filter(|(mask, _)| keywords & mask != 0)
                .map(|(_, name)| name.clone()),
        );
        names
    }

    pub(crate) fn provider_text(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| self.name.clone())
    }
}

pub(crate) fn standard_level(level: u8) -> Result<String, Status> {
    let name = match level {
        0 | 4 => "Information",
        1 => "Critical",
        2 => "Error",
        3 => "Warning",
        5 => "Verbose",
        _ => return Err(Status::EVT_MESSAGE_ID_NOT_FOUND),
    };
    Ok(name.to_string())
}

pub(crate) fn standard_opcode(opcode: u8) -> Result<String, Status> {
    let name = match opcode {
        0 => "Info",
        1 => "Start",
        2 => "Stop",
        _ => return Err(Status::EVT_MESSAGE_ID_NOT_FOUND),
    };
    Ok(name.to_string())
}

pub(crate) fn standard_keywords(keywords: u64) -> Vec<String> {
    const STANDARD: [(u64, &str); 3] = [
        (0x0010_0000_0000_0000, "Audit Failure"),
        (0x0020_0000_0000_0000, "Audit Success"),
        (0x0080_0000_0000_0000, "Classic"),
    ];
    STANDARD
        .iter()
        .filter(|(mask, _)| keywords & mask != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Replace `%N` inserts with the Nth value; `%%` is a literal percent
fn expand_inserts(template: &str, values: &[VariantValue]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        match digits.parse::<usize>() {
            Ok(n) if n >= 1 && n <= values.len() => out.push_str(&values[n - 1].to_string()),
            _ => {
                out.push('%');
                out.push_str(&digits);
            }
        }
    }
    out
}

/// A field selected by a value-path render context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ValuePath {
    System(SystemProperty),
    Data(String),
}

impl ValuePath {
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim();
        if let Some(rest) = path.strip_prefix("Event/EventData/Data[@Name=") {
            let name = rest.strip_suffix(']')?;
            let name = name
                .strip_prefix('\'')
                .and_then(|n| n.strip_suffix('\''))
                .or_else(|| name.strip_prefix('"').and_then(|n| n.strip_suffix('"')))?;
            return Some(Self::Data(name.to_string()));
        }
        let property = match path.strip_prefix("Event/System/")? {
            "Provider/@Name" => SystemProperty::ProviderName,
            "Provider/@Guid" => SystemProperty::ProviderGuid,
            "EventID" => SystemProperty::EventId,
            "EventID/@Qualifiers" => SystemProperty::Qualifiers,
            "Level" => SystemProperty::Level,
            "Task" => SystemProperty::Task,
            "Opcode" => SystemProperty::Opcode,
            "Keywords" => SystemProperty::Keywords,
            "TimeCreated/@SystemTime" => SystemProperty::TimeCreated,
            "EventRecordID" => SystemProperty::EventRecordId,
            "Correlation/@ActivityID" => SystemProperty::ActivityId,
            "Correlation/@RelatedActivityID" => SystemProperty::RelatedActivityId,
            "Execution/@ProcessID" => SystemProperty::ProcessId,
            "Execution/@ThreadID" => SystemProperty::ThreadId,
            "Channel" => SystemProperty::Channel,
            "Computer" => SystemProperty::Computer,
            "Security/@UserID" => SystemProperty::UserId,
            "Version" => SystemProperty::Version,
            _ => return None,
        };
        Some(Self::System(property))
    }

    pub fn select(&self, record: &MockRecord) -> VariantValue {
        match self {
            Self::System(property) => record.system_value(*property),
            Self::Data(name) => record.data_value(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_inserts() {
        let values = [VariantValue::from("Spooler"), VariantValue::from("running")];
        assert_eq!(
            expand_inserts("The %1 service entered the %2 state.", &values),
            "The Spooler service entered the running state."
        );
        assert_eq!(expand_inserts("100%% of %3", &values), "100% of %3");
    }

    #[test]
    fn test_value_path_parse() {
        assert_eq!(
            ValuePath::parse("Event/System/EventRecordID"),
            Some(ValuePath::System(SystemProperty::EventRecordId))
        );
        assert_eq!(
            ValuePath::parse("Event/EventData/Data[@Name='param1']"),
            Some(ValuePath::Data("param1".into()))
        );
        assert_eq!(ValuePath::parse("Event/Bogus"), None);
    }

    #[test]
    fn test_keyword_names() {
        let publisher = MockPublisher::new("P").with_keyword(0x1, "Custom");
        assert_eq!(
            publisher.keyword_names(0x0080_0000_0000_0001),
            vec!["Classic".to_string(), "Custom".to_string()]
        );
    }
}
