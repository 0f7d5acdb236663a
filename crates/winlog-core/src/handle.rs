//! Typed ownership of native event log handles
//!
//! The native layer hands out plain 64-bit identifiers with no kind and no
//! lifetime tracking. Everything above the seam works with [`OwnedHandle`],
//! which carries its [`HandleKind`], refuses use after close, and releases
//! the native resource on drop if nobody closed it explicitly.
//!
//! Every live handle is recorded in the session's [`HandleRegistry`] so
//! tests and long-running agents can check that nothing leaks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::EventLogApi;
use crate::error::{HandleError, HandleResult};

/// An opaque native handle value
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display("{_0:#x}")]
pub struct RawHandle(pub u64);

impl RawHandle {
    /// The null handle
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The kind of native resource a handle refers to
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    #[display("event")]
    Event,
    #[display("bookmark")]
    Bookmark,
    #[display("subscription")]
    Subscription,
    #[display("render context")]
    RenderContext,
    #[display("publisher metadata")]
    PublisherMetadata,
    #[display("query")]
    Query,
    #[display("channel config")]
    ChannelConfig,
}

impl HandleKind {
    pub const ALL: [HandleKind; 7] = [
        HandleKind::Event,
        HandleKind::Bookmark,
        HandleKind::Subscription,
        HandleKind::RenderContext,
        HandleKind::PublisherMetadata,
        HandleKind::Query,
        HandleKind::ChannelConfig,
    ];
}

/// Bookkeeping for every handle currently owned through a session
#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: DashMap<RawHandle, HandleKind>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, raw: RawHandle, kind: HandleKind) {
        if let Some(previous) = self.live.insert(raw, kind) {
            // The native layer recycled a value we still think is live.
            warn!(handle = %raw, %previous, %kind, "handle value registered twice");
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, raw: RawHandle) {
        if self.live.remove(&raw).is_some() {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether `raw` is currently owned by someone in this session
    pub fn is_live(&self, raw: RawHandle) -> bool {
        self.live.contains_key(&raw)
    }

    /// Number of live handles of the given kind
    pub fn live(&self, kind: HandleKind) -> usize {
        self.live.iter().filter(|entry| *entry.value() == kind).count()
    }

    /// Number of live handles of any kind
    pub fn live_total(&self) -> usize {
        self.live.len()
    }

    /// Total handles adopted over the session's lifetime
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Total handles released over the session's lifetime
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

struct SessionInner {
    api: Arc<dyn EventLogApi>,
    registry: HandleRegistry,
}

/// A connection to one native event log backend
///
/// Cheap to clone; all clones share the backend and the handle registry.
#[derive(Clone)]
pub struct EventLogSession {
    inner: Arc<SessionInner>,
}

impl EventLogSession {
    pub fn new(api: Arc<dyn EventLogApi>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                api,
                registry: HandleRegistry::new(),
            }),
        }
    }

    /// Session backed by the local machine's event log
    #[cfg(windows)]
    pub fn local() -> Self {
        Self::new(Arc::new(crate::windows::WindowsEventLog::new()))
    }

    /// The native backend
    pub fn api(&self) -> &dyn EventLogApi {
        self.inner.api.as_ref()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }

    /// Take ownership of a handle the native layer just returned
    pub fn adopt(&self, raw: RawHandle, kind: HandleKind) -> OwnedHandle {
        self.inner.registry.register(raw, kind);
        debug!(handle = %raw, %kind, "adopted handle");
        OwnedHandle {
            raw,
            kind,
            closed: AtomicBool::new(false),
            session: self.clone(),
        }
    }
}

impl fmt::Debug for EventLogSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogSession")
            .field("live_handles", &self.inner.registry.live_total())
            .finish()
    }
}

/// A native handle with an explicit open/closed state
///
/// Closing is exactly-once: the first `close` (or `cancel` followed by drop)
/// releases the native resource, and every later use fails with
/// [`HandleError::AlreadyClosed`] instead of reaching the native layer.
pub struct OwnedHandle {
    raw: RawHandle,
    kind: HandleKind,
    closed: AtomicBool,
    session: EventLogSession,
}

impl OwnedHandle {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The session this handle belongs to
    pub fn session(&self) -> &EventLogSession {
        &self.session
    }

    /// The native value, if the handle is still open
    pub fn raw(&self) -> HandleResult<RawHandle> {
        if self.is_closed() {
            return Err(self.already_closed());
        }
        Ok(self.raw)
    }

    /// The native value, checking both the open state and the kind
    pub fn raw_as(&self, expected: HandleKind) -> HandleResult<RawHandle> {
        if self.kind != expected {
            return Err(HandleError::WrongKind {
                expected,
                actual: self.kind,
            });
        }
        self.raw()
    }

    /// Cancel outstanding native work on this handle without closing it
    pub fn cancel(&self) -> HandleResult<()> {
        let raw = self.raw()?;
        self.session
            .api()
            .cancel(raw)
            .map_err(|status| HandleError::native("cancel", status))
    }

    /// Release the native resource
    pub fn close(&self) -> HandleResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(self.already_closed());
        }
        self.session.registry().release(self.raw);
        debug!(handle = %self.raw, kind = %self.kind, "closing handle");
        self.session
            .api()
            .close(self.raw)
            .map_err(|status| HandleError::native("close", status))
    }

    fn already_closed(&self) -> HandleError {
        HandleError::AlreadyClosed {
            kind: self.kind,
            raw: self.raw.0,
        }
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(handle = %self.raw, kind = %self.kind, error = %e, "close on drop failed");
            }
        }
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
