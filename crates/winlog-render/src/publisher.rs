//! Publisher metadata cache
//!
//! Message formatting needs the publishing provider's metadata handle.
//! Opening one is expensive, so the cache keeps every successfully opened
//! handle keyed by provider name, compared case-insensitively, for the life
//! of the watcher. Failed opens
//! are not remembered, which means the next event from that provider tries
//! again. Entries are never evicted; [`PublisherCache::close_all`] releases
//! everything at shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};
use winlog_core::{EventLogSession, HandleError, HandleKind, OwnedHandle, RawHandle};

use crate::error::{RenderError, RenderResult};

/// An open publisher metadata handle
#[derive(Debug)]
pub struct PublisherMetadata {
    name: String,
    handle: OwnedHandle,
}

impl PublisherMetadata {
    /// Open metadata for `provider` directly, bypassing any cache
    pub fn open(session: &EventLogSession, provider: &str) -> RenderResult<Self> {
        let raw = session
            .api()
            .open_publisher_metadata(provider)
            .map_err(|status| RenderError::failure("open publisher metadata", status))?;
        Ok(Self {
            name: provider.to_string(),
            handle: session.adopt(raw, HandleKind::PublisherMetadata),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub(crate) fn raw(&self) -> RenderResult<RawHandle> {
        Ok(self.handle.raw_as(HandleKind::PublisherMetadata)?)
    }

    pub fn close(&self) -> RenderResult<()> {
        Ok(self.handle.close()?)
    }
}

fn cache_key(provider: &str) -> String {
    provider.to_ascii_lowercase()
}

/// Lowercased provider name to open metadata handle
pub struct PublisherCache {
    session: EventLogSession,
    entries: DashMap<String, Arc<PublisherMetadata>>,
}

impl PublisherCache {
    pub fn new(session: EventLogSession) -> Self {
        Self {
            session,
            entries: DashMap::new(),
        }
    }

    /// The cached metadata for `provider`, opening it on first use
    pub fn resolve(&self, provider: &str) -> RenderResult<Arc<PublisherMetadata>> {
        let key = cache_key(provider);
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let metadata = Arc::new(PublisherMetadata::open(&self.session, provider)?);
                debug!(provider, "publisher metadata cached");
                Ok(entry.insert(metadata).clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.entries.contains_key(&cache_key(provider))
    }

    /// Close every cached handle and empty the cache
    pub fn close_all(&self) {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, metadata)) = self.entries.remove(&name) {
                match metadata.close() {
                    Ok(()) | Err(RenderError::Handle(HandleError::AlreadyClosed { .. })) => {}
                    Err(e) => warn!(provider = metadata.name(), error = %e, "closing publisher metadata failed"),
                }
            }
        }
    }
}
