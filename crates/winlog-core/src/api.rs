//! The native event log seam
//!
//! [`EventLogApi`] mirrors the small set of native entry points the engine
//! needs. Everything it deals in is raw: handles are bare integers, render
//! output goes into caller buffers, and subscription callbacks receive the
//! action code and payload exactly as the native dispatcher passes them.
//! Typed ownership, buffer sizing and notification routing live above it.

use std::sync::Arc;

use crate::error::Status;
use crate::flags::{FormatMessageFlags, RenderContextFlags, RenderFlags, SubscribeFlags};
use crate::handle::RawHandle;

/// Native subscription callback: `(action, payload)`
///
/// Invoked on a dispatcher thread the caller does not own. For the deliver
/// action the payload is an event handle the callee now owns; for the error
/// action it is a status code.
pub type NotificationCallback = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Result of a sized native call (render or format)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    pub status: Status,
    /// Units used on success, or units required on insufficient buffer
    pub required: usize,
    /// Number of values in a value render
    pub property_count: u32,
}

impl FillReport {
    pub fn filled(used: usize, property_count: u32) -> Self {
        Self {
            status: Status::SUCCESS,
            required: used,
            property_count,
        }
    }

    pub fn needs(required: usize) -> Self {
        Self {
            status: Status::INSUFFICIENT_BUFFER,
            required,
            property_count: 0,
        }
    }

    pub fn failed(status: Status) -> Self {
        Self {
            status,
            required: 0,
            property_count: 0,
        }
    }
}

/// Parameters for a native subscription
#[derive(Debug, Clone, Copy)]
pub struct SubscribeRequest<'a> {
    pub channel: &'a str,
    pub query: Option<&'a str>,
    pub bookmark: Option<RawHandle>,
    pub flags: SubscribeFlags,
}

/// The native event log entry points
pub trait EventLogApi: Send + Sync {
    /// Start a subscription; `callback` fires for every notification
    fn subscribe(
        &self,
        request: &SubscribeRequest<'_>,
        callback: NotificationCallback,
    ) -> Result<RawHandle, Status>;

    fn create_render_context(
        &self,
        value_paths: &[&str],
        flags: RenderContextFlags,
    ) -> Result<RawHandle, Status>;

    /// Render `fragment` (an event or bookmark) into `buffer`
    ///
    /// `required` is in bytes.
    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> FillReport;

    /// Format part of an event's message into `buffer`
    ///
    /// `required` is in UTF-16 units and includes the terminator.
    fn format_message(
        &self,
        publisher: Option<RawHandle>,
        event: RawHandle,
        flags: FormatMessageFlags,
        buffer: &mut [u16],
    ) -> FillReport;

    fn open_publisher_metadata(&self, provider: &str) -> Result<RawHandle, Status>;

    /// Create a bookmark, empty or restored from XML
    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, Status>;

    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> Result<(), Status>;

    fn cancel(&self, handle: RawHandle) -> Result<(), Status>;

    fn close(&self, handle: RawHandle) -> Result<(), Status>;

    fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<(), Status>;

    fn set_channel_max_size(&self, channel: &str, max_bytes: u64) -> Result<(), Status>;
}
