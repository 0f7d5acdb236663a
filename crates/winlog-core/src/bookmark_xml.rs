//! The bookmark list XML document
//!
//! A serialized bookmark names one record position per channel:
//!
//! ```text
//! <BookmarkList>
//!   <Bookmark Channel='Application' RecordId='10811' IsCurrent='true'/>
//! </BookmarkList>
//! ```
//!
//! Lines are CRLF-separated. [`BookmarkDocument::to_xml`] writes exactly
//! that canonical form, so a document parsed from canonical text serializes
//! back to identical bytes.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use crate::error::BookmarkXmlError;

const ROOT: &[u8] = b"BookmarkList";
const ENTRY: &[u8] = b"Bookmark";

/// One channel position within a bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkEntry {
    pub channel: String,
    pub record_id: u64,
    pub is_current: bool,
}

/// A parsed bookmark list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkDocument {
    entries: Vec<BookmarkEntry>,
}

impl BookmarkDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[BookmarkEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry flagged as current, if any
    pub fn current(&self) -> Option<&BookmarkEntry> {
        self.entries.iter().find(|e| e.is_current)
    }

    pub fn position(&self, channel: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.channel.eq_ignore_ascii_case(channel))
            .map(|e| e.record_id)
    }

    /// Record `record_id` for `channel` and make it the current entry
    pub fn set_position(&mut self, channel: &str, record_id: u64) {
        for entry in &mut self.entries {
            entry.is_current = false;
        }
        match self
            .entries
            .iter_mut()
            .find(|e| e.channel.eq_ignore_ascii_case(channel))
        {
            Some(entry) => {
                entry.record_id = record_id;
                entry.is_current = true;
            }
            None => self.entries.push(BookmarkEntry {
                channel: channel.to_string(),
                record_id,
                is_current: true,
            }),
        }
    }

    pub fn parse(xml: &str) -> Result<Self, BookmarkXmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut doc = BookmarkDocument::new();
        let mut depth = 0usize;
        let mut seen_root = false;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| BookmarkXmlError::syntax(e.to_string()))?;
            match event {
                Event::Start(e) => {
                    doc.visit_element(&e, depth, &mut seen_root)?;
                    depth += 1;
                }
                Event::Empty(e) => {
                    doc.visit_element(&e, depth, &mut seen_root)?;
                }
                Event::End(_) => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| BookmarkXmlError::syntax("unbalanced end tag"))?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| BookmarkXmlError::syntax(e.to_string()))?;
                    if !text.trim().is_empty() {
                        return Err(BookmarkXmlError::structure("unexpected text content"));
                    }
                }
                Event::Eof => break,
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::CData(_) => {
                    return Err(BookmarkXmlError::structure("unexpected CDATA"));
                }
            }
        }

        if depth != 0 {
            return Err(BookmarkXmlError::syntax("document ends inside an open element"));
        }
        if !seen_root {
            return Err(BookmarkXmlError::structure("missing BookmarkList root"));
        }
        Ok(doc)
    }

    fn visit_element(
        &mut self,
        element: &BytesStart<'_>,
        depth: usize,
        seen_root: &mut bool,
    ) -> Result<(), BookmarkXmlError> {
        let name = element.name();
        match (depth, name.as_ref()) {
            (0, ROOT) if !*seen_root => {
                *seen_root = true;
                Ok(())
            }
            (1, ENTRY) => {
                self.entries.push(parse_entry(element)?);
                Ok(())
            }
            (_, other) => Err(BookmarkXmlError::structure(format!(
                "unexpected element <{}> at depth {}",
                String::from_utf8_lossy(other),
                depth
            ))),
        }
    }

    /// Serialize in canonical form
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<BookmarkList>\r\n");
        for entry in &self.entries {
            xml.push_str("  <Bookmark Channel='");
            xml.push_str(&escape(entry.channel.as_str()));
            xml.push_str("' RecordId='");
            xml.push_str(&entry.record_id.to_string());
            xml.push('\'');
            if entry.is_current {
                xml.push_str(" IsCurrent='true'");
            }
            xml.push_str("/>\r\n");
        }
        xml.push_str("</BookmarkList>");
        xml
    }
}

fn parse_entry(element: &BytesStart<'_>) -> Result<BookmarkEntry, BookmarkXmlError> {
    let mut channel = None;
    let mut record_id = None;
    let mut is_current = false;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| BookmarkXmlError::syntax(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| BookmarkXmlError::syntax(e.to_string()))?;
        match attr.key.as_ref() {
            b"Channel" => channel = Some(value.into_owned()),
            b"RecordId" => {
                let id = value.parse::<u64>().map_err(|_| {
                    BookmarkXmlError::structure(format!("RecordId '{}' is not a number", value))
                })?;
                record_id = Some(id);
            }
            b"IsCurrent" => is_current = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    Ok(BookmarkEntry {
        channel: channel.ok_or_else(|| BookmarkXmlError::structure("Bookmark without Channel"))?,
        record_id: record_id
            .ok_or_else(|| BookmarkXmlError::structure("Bookmark without RecordId"))?,
        is_current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<BookmarkList>\r\n  <Bookmark Channel='Application' RecordId='10811' IsCurrent='true'/>\r\n</BookmarkList>";

    #[test]
    fn test_canonical_round_trip() {
        let doc = BookmarkDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.position("Application"), Some(10811));
        assert_eq!(doc.current().unwrap().channel, "Application");
        assert_eq!(doc.to_xml(), SAMPLE);
    }

    #[test]
    fn test_empty_list() {
        let doc = BookmarkDocument::parse("<BookmarkList>\r\n</BookmarkList>").unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.to_xml(), "<BookmarkList>\r\n</BookmarkList>");
        assert!(BookmarkDocument::parse("<BookmarkList/>").unwrap().is_empty());
    }

    #[test]
    fn test_unclosed_document_rejected() {
        let err = BookmarkDocument::parse(
            "<BookmarkList>\r\n  <Bookmark Channel='Application' RecordId='10811' IsCurrent='true'/>\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, BookmarkXmlError::Syntax(_)));
    }

    #[test]
    fn test_wrong_structure_rejected() {
        assert!(matches!(
            BookmarkDocument::parse("<Other/>"),
            Err(BookmarkXmlError::Structure(_))
        ));
        assert!(matches!(
            BookmarkDocument::parse("<BookmarkList><Bookmark Channel='A'/></BookmarkList>"),
            Err(BookmarkXmlError::Structure(_))
        ));
        assert!(matches!(
            BookmarkDocument::parse("<BookmarkList><Bookmark Channel='A' RecordId='x'/></BookmarkList>"),
            Err(BookmarkXmlError::Structure(_))
        ));
        assert!(matches!(BookmarkDocument::parse(""), Err(BookmarkXmlError::Structure(_))));
    }

    #[test]
    fn test_set_position_moves_current() {
        let mut doc = BookmarkDocument::new();
        doc.set_position("Application", 5);
        doc.set_position("System", 9);
        doc.set_position("Application", 6);

        assert_eq!(doc.position("application"), Some(6));
        assert_eq!(doc.current().unwrap().channel, "Application");
        assert_eq!(
            doc.to_xml(),
            "<BookmarkList>\r\n  <Bookmark Channel='Application' RecordId='6' IsCurrent='true'/>\r\n  <Bookmark Channel='System' RecordId='9'/>\r\n</BookmarkList>"
        );
    }

    #[test]
    fn test_channel_with_reserved_characters() {
        let mut doc = BookmarkDocument::new();
        doc.set_position("Microsoft-Windows-Foo/Operational's", 1);
        let parsed = BookmarkDocument::parse(&doc.to_xml()).unwrap();
        assert_eq!(parsed, doc);
    }
}
