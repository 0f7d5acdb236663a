//! # Winlog Render
//!
//! Turns native event and bookmark handles into owned Rust values.
//!
//! All sized native calls go through [`probe_and_fill`], which probes for the
//! required size, allocates exactly that, fills once and classifies every
//! deviation from that protocol as a typed [`RenderError`].
//!
//! ## Key Types
//!
//! - [`Renderer`]: values, XML, bookmark XML and message-part formatting
//! - [`RenderContext`]: system, user, or value-path selection
//! - [`SystemFields`]: the 18 system properties, typed
//! - [`PublisherCache`]: provider name to open metadata handle

pub mod context;
pub mod error;
pub mod publisher;
pub mod renderer;
pub mod system;
pub mod two_pass;

pub use context::{ContextShape, RenderContext};
pub use error::{RenderError, RenderResult};
pub use publisher::{PublisherCache, PublisherMetadata};
pub use renderer::{Renderer, decode_multi_string, decode_text};
pub use system::{DecodedSystem, EventPosition, FieldError, SystemFields};
pub use two_pass::{Filled, probe_and_fill};
