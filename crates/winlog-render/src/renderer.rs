//! Event, bookmark and message rendering over the two-pass primitive

use tracing::{instrument, warn};
use winlog_core::{
    DecodeError, DecodeResult, EventLogSession, FormatMessageFlags, HandleKind, OwnedHandle,
    RenderFlags, RenderedValueSet, VariantValue,
};

use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::publisher::PublisherMetadata;
use crate::system::{DecodedSystem, SystemFields};
use crate::two_pass::probe_and_fill;

/// Decode NUL-terminated UTF-16; a single trailing terminator is dropped
pub fn decode_text(units: &[u16]) -> DecodeResult<String> {
    let units = units.strip_suffix(&[0]).unwrap_or(units);
    if units.contains(&0) {
        return Err(DecodeError::encoding("embedded NUL in rendered text"));
    }
    String::from_utf16(units).map_err(|e| DecodeError::encoding(e.to_string()))
}

/// Decode a double-NUL-terminated list of UTF-16 strings
pub fn decode_multi_string(units: &[u16]) -> DecodeResult<Vec<String>> {
    let mut items = Vec::new();
    for part in units.split(|u| *u == 0) {
        if part.is_empty() {
            break;
        }
        items.push(String::from_utf16(part).map_err(|e| DecodeError::encoding(e.to_string()))?);
    }
    Ok(items)
}

/// Renders events and bookmarks belonging to one session
#[derive(Debug, Clone)]
pub struct Renderer {
    session: EventLogSession,
}

impl Renderer {
    pub fn new(session: EventLogSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &EventLogSession {
        &self.session
    }

    /// Extract the values `context` selects from `event`
    pub fn render_values(
        &self,
        context: &RenderContext,
        event: &OwnedHandle,
    ) -> RenderResult<RenderedValueSet> {
        let context = context.raw()?;
        let event = event.raw_as(HandleKind::Event)?;
        let api = self.session.api();
        let filled = probe_and_fill::<u8, _>("render values", |buf| {
            api.render(Some(context), event, RenderFlags::Values, buf)
        })?;
        Ok(filled.into_value_set()?)
    }

    /// Render through a system context and decode the typed fields
    ///
    /// Fields that fail to decode come back in [`DecodedSystem::errors`].
    pub fn render_system(
        &self,
        context: &RenderContext,
        event: &OwnedHandle,
    ) -> RenderResult<DecodedSystem> {
        let set = self.render_values(context, event)?;
        Ok(SystemFields::from_values(&set)?)
    }

    /// The event's XML text
    pub fn render_xml(&self, event: &OwnedHandle) -> RenderResult<String> {
        let event = event.raw_as(HandleKind::Event)?;
        self.render_text("render xml", event, RenderFlags::Xml)
    }

    /// The bookmark's XML text
    pub fn render_bookmark(&self, bookmark: &OwnedHandle) -> RenderResult<String> {
        let bookmark = bookmark.raw_as(HandleKind::Bookmark)?;
        self.render_text("render bookmark", bookmark, RenderFlags::Bookmark)
    }

    fn render_text(
        &self,
        op: &'static str,
        fragment: winlog_core::RawHandle,
        flags: RenderFlags,
    ) -> RenderResult<String> {
        let api = self.session.api();
        let filled = probe_and_fill::<u8, _>(op, |buf| api.render(None, fragment, flags, buf))?;
        Ok(decode_text(filled.as_wide()?)?)
    }

    fn format_units(
        &self,
        publisher: Option<&PublisherMetadata>,
        event: &OwnedHandle,
        flag: FormatMessageFlags,
    ) -> RenderResult<Vec<u16>> {
        let publisher = publisher.map(PublisherMetadata::raw).transpose()?;
        let event = event.raw_as(HandleKind::Event)?;
        let api = self.session.api();
        let filled = probe_and_fill::<u16, _>("format message", |buf| {
            api.format_message(publisher, event, flag, buf)
        })?;
        Ok(filled.units().to_vec())
    }

    /// One formatted part of the event's message
    #[instrument(level = "trace", skip_all, fields(part = flag.name()))]
    pub fn format_message(
        &self,
        publisher: Option<&PublisherMetadata>,
        event: &OwnedHandle,
        flag: FormatMessageFlags,
    ) -> RenderResult<String> {
        let units = self.format_units(publisher, event, flag)?;
        Ok(decode_text(&units)?)
    }

    /// The event's keyword display names
    pub fn format_keywords(
        &self,
        publisher: Option<&PublisherMetadata>,
        event: &OwnedHandle,
    ) -> RenderResult<Vec<String>> {
        let units = self.format_units(publisher, event, FormatMessageFlags::Keyword)?;
        Ok(decode_multi_string(&units)?)
    }

    /// Every value `context` selects, rendered as display text
    ///
    /// Nulls and values that fail to decode become empty strings.
    pub fn render_all_as_strings(
        &self,
        context: &RenderContext,
        event: &OwnedHandle,
    ) -> RenderResult<Vec<String>> {
        let decoded = self.render_values(context, event)?.to_values();
        for (index, error) in &decoded.errors {
            warn!(index, %error, "value not decodable, rendered as empty");
        }
        Ok(decoded
            .values
            .iter()
            .map(|value| match value {
                VariantValue::Null => String::new(),
                other => other.to_string(),
            })
            .collect())
    }
}
