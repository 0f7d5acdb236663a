//! Render contexts: which values a value render extracts

use tracing::debug;
use winlog_core::{EventLogSession, HandleKind, OwnedHandle, RenderContextFlags, RawHandle};

use crate::error::{RenderError, RenderResult};

/// What a render context selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextShape {
    /// The fixed system properties, in property-index order
    System,
    /// The event's user data values, in declaration order
    User,
    /// One value per path, in the order given
    Values(Vec<String>),
}

/// An open native render context
#[derive(Debug)]
pub struct RenderContext {
    handle: OwnedHandle,
    shape: ContextShape,
}

impl RenderContext {
    pub fn system(session: &EventLogSession) -> RenderResult<Self> {
        Self::create(session, ContextShape::System)
    }

    pub fn user(session: &EventLogSession) -> RenderResult<Self> {
        Self::create(session, ContextShape::User)
    }

    /// A context selecting the given XPath value paths
    pub fn values(session: &EventLogSession, paths: &[&str]) -> RenderResult<Self> {
        Self::create(
            session,
            ContextShape::Values(paths.iter().map(|p| p.to_string()).collect()),
        )
    }

    fn create(session: &EventLogSession, shape: ContextShape) -> RenderResult<Self> {
        let (paths, flags): (Vec<&str>, _) = match &shape {
            ContextShape::System => (Vec::new(), RenderContextFlags::System),
            ContextShape::User => (Vec::new(), RenderContextFlags::User),
            ContextShape::Values(paths) => (
                paths.iter().map(String::as_str).collect(),
                RenderContextFlags::Values,
            ),
        };
        let raw = session
            .api()
            .create_render_context(&paths, flags)
            .map_err(|status| RenderError::failure("create render context", status))?;
        debug!(handle = %raw, ?shape, "render context created");
        Ok(Self {
            handle: session.adopt(raw, HandleKind::RenderContext),
            shape,
        })
    }

    pub fn shape(&self) -> &ContextShape {
        &self.shape
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub(crate) fn raw(&self) -> RenderResult<RawHandle> {
        Ok(self.handle.raw_as(HandleKind::RenderContext)?)
    }

    pub fn close(&self) -> RenderResult<()> {
        Ok(self.handle.close()?)
    }
}
