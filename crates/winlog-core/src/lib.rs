//! # Winlog Core
//!
//! Native-facing foundations for the winlog event subscription engine.
//!
//! Everything above this crate talks to the operating system through the
//! [`EventLogApi`] seam, so the same subscription and rendering logic runs
//! against the real Windows event log or the in-memory [`MockEventLog`].
//!
//! ## Key Types
//!
//! - [`EventLogSession`]: a backend plus the registry of live handles
//! - [`OwnedHandle`]: a native handle with exactly-once close
//! - [`RenderedValueSet`] / [`Variant`]: checked decoding of rendered variant arrays
//! - [`FileTime`]: 100ns ticks since 1601-01-01 UTC
//! - [`BookmarkDocument`]: the bookmark list XML, parsed and canonically serialized

pub mod api;
pub mod bookmark_xml;
pub mod error;
pub mod flags;
pub mod handle;
pub mod mock;
pub mod time;
pub mod variant;
#[cfg(windows)]
pub mod windows;

pub use api::{EventLogApi, FillReport, NotificationCallback, SubscribeRequest};
pub use bookmark_xml::{BookmarkDocument, BookmarkEntry};
pub use error::*;
pub use flags::*;
pub use handle::{EventLogSession, HandleKind, HandleRegistry, OwnedHandle, RawHandle};
pub use mock::{MockEvent, MockEventLog, MockFault, MockPublisher, RenderCall};
pub use time::FileTime;
pub use variant::{
    DecodedValues, Guid, RenderedValueSet, Sid, Variant, VariantKind, VariantValue,
};
