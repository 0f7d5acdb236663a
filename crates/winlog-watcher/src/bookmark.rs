//! Resumable positions in channel event streams
//!
//! A [`Bookmark`] wraps a native bookmark handle together with a per-channel
//! high-water mark. The native bookmark only ever moves forward: an advance
//! to a position at or behind the mark is refused before it reaches the
//! native layer.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, instrument};
use winlog_core::{BookmarkDocument, EventLogSession, HandleError, HandleKind, OwnedHandle};
use winlog_render::{EventPosition, Renderer};

use crate::error::{WatchError, WatchResult};

/// A native bookmark with monotonic advance
pub struct Bookmark {
    handle: OwnedHandle,
    renderer: Renderer,
    /// Lowercased channel name to the last record id the bookmark moved to
    high_water: Mutex<HashMap<String, u64>>,
}

impl Bookmark {
    /// A bookmark with no position: "start of subscription"
    pub fn new_empty(session: &EventLogSession) -> WatchResult<Self> {
        let raw = session
            .api()
            .create_bookmark(None)
            .map_err(|status| HandleError::native("create bookmark", status))?;
        Ok(Self::adopt(session, raw, HashMap::new()))
    }

    /// Restore a bookmark from its serialized XML
    #[instrument(skip(session, xml), fields(len = xml.len()))]
    pub fn from_xml(session: &EventLogSession, xml: &str) -> WatchResult<Self> {
        let document =
            BookmarkDocument::parse(xml).map_err(|e| WatchError::invalid_bookmark(e.to_string()))?;
        let raw = session.api().create_bookmark(Some(xml)).map_err(|status| {
            WatchError::invalid_bookmark(format!("rejected by the event log: {}", status))
        })?;
        let high_water = document
            .entries()
            .iter()
            .map(|entry| (entry.channel.to_ascii_lowercase(), entry.record_id))
            .collect();
        Ok(Self::adopt(session, raw, high_water))
    }

    fn adopt(
        session: &EventLogSession,
        raw: winlog_core::RawHandle,
        high_water: HashMap<String, u64>,
    ) -> Self {
        Self {
            handle: session.adopt(raw, HandleKind::Bookmark),
            renderer: Renderer::new(session.clone()),
            high_water: Mutex::new(high_water),
        }
    }

    /// Move the bookmark to `event`, which sits at `position`
    ///
    /// Returns `false` without touching the native bookmark when `position`
    /// is not past the current mark for its channel.
    pub fn advance(&self, event: &OwnedHandle, position: &EventPosition) -> WatchResult<bool> {
        let key = position.channel.to_ascii_lowercase();
        let mut high_water = self.high_water.lock();
        if let Some(&mark) = high_water.get(&key) {
            if position.record_id <= mark {
                debug!(
                    channel = %position.channel,
                    record_id = position.record_id,
                    mark,
                    "bookmark advance refused"
                );
                return Ok(false);
            }
        }
        self.update(event)?;
        high_water.insert(key, position.record_id);
        Ok(true)
    }

    /// Move the bookmark to `event` when its position could not be read
    ///
    /// Delivery order within a subscription follows append order, so this
    /// still only moves forward for events from a single subscription.
    pub(crate) fn advance_unpositioned(&self, event: &OwnedHandle) -> WatchResult<()> {
        let _high_water = self.high_water.lock();
        self.update(event)
    }

    fn update(&self, event: &OwnedHandle) -> WatchResult<()> {
        let bookmark = self.handle.raw_as(HandleKind::Bookmark)?;
        let event = event.raw_as(HandleKind::Event)?;
        self.handle
            .session()
            .api()
            .update_bookmark(bookmark, event)
            .map_err(|status| HandleError::native("update bookmark", status))?;
        Ok(())
    }

    /// The bookmark's XML; an empty bookmark yields an empty list
    pub fn serialize(&self) -> WatchResult<String> {
        Ok(self.renderer.render_bookmark(&self.handle)?)
    }

    /// Whether the bookmark has never been positioned
    pub fn is_start(&self) -> bool {
        self.high_water.lock().is_empty()
    }

    /// Last record id recorded for `channel`
    pub fn position(&self, channel: &str) -> Option<u64> {
        self.high_water
            .lock()
            .get(&channel.to_ascii_lowercase())
            .copied()
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn close(&self) -> WatchResult<()> {
        Ok(self.handle.close()?)
    }
}

impl std::fmt::Debug for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bookmark")
            .field("handle", &self.handle)
            .field("high_water", &*self.high_water.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex, mpsc};
    use std::time::Duration;

    use winlog_core::{
        MockEvent, MockEventLog, NotificationCallback, RawHandle, SubscribeFlags, SubscribeOrigin,
        SubscribeRequest,
    };

    use super::*;

    /// Replay every record in `channel` and adopt the delivered events
    fn replay(
        session: &EventLogSession,
        channel: &str,
        count: usize,
    ) -> (OwnedHandle, Vec<OwnedHandle>) {
        let (tx, rx) = mpsc::channel();
        let tx = StdMutex::new(tx);
        let callback: NotificationCallback = Arc::new(move |_action, payload| {
            let _ = tx.lock().unwrap().send(payload);
        });
        let request = SubscribeRequest {
            channel,
            query: None,
            bookmark: None,
            flags: SubscribeFlags::new(SubscribeOrigin::StartAtOldestRecord),
        };
        let raw = session.api().subscribe(&request, callback).unwrap();
        let subscription = session.adopt(raw, HandleKind::Subscription);
        let events = (0..count)
            .map(|_| {
                let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                session.adopt(RawHandle(payload), HandleKind::Event)
            })
            .collect();
        (subscription, events)
    }

    fn setup(records: usize) -> (Arc<MockEventLog>, EventLogSession) {
        let mock = Arc::new(MockEventLog::with_channels(&["Application"]));
        for i in 0..records {
            mock.append("Application", MockEvent::new("App", i as u16)).unwrap();
        }
        let session = EventLogSession::new(mock.clone());
        (mock, session)
    }

    #[test]
    fn test_empty_bookmark_is_start() {
        let (_mock, session) = setup(0);
        let bookmark = Bookmark::new_empty(&session).unwrap();
        assert!(bookmark.is_start());
        assert_eq!(bookmark.serialize().unwrap(), "<BookmarkList>\r\n</BookmarkList>");
    }

    #[test]
    fn test_advance_never_moves_backward() {
        let (_mock, session) = setup(3);
        let (_sub, events) = replay(&session, "Application", 3);
        let bookmark = Bookmark::new_empty(&session).unwrap();

        assert!(bookmark.advance(&events[1], &EventPosition::new("Application", 2)).unwrap());
        assert!(!bookmark.advance(&events[0], &EventPosition::new("Application", 1)).unwrap());
        assert!(!bookmark.advance(&events[1], &EventPosition::new("application", 2)).unwrap());
        assert_eq!(bookmark.position("Application"), Some(2));
        assert!(bookmark.serialize().unwrap().contains("RecordId='2'"));

        assert!(bookmark.advance(&events[2], &EventPosition::new("Application", 3)).unwrap());
        assert!(bookmark.serialize().unwrap().contains("RecordId='3'"));
    }

    #[test]
    fn test_round_trip_keeps_position() {
        let (_mock, session) = setup(2);
        let (_sub, events) = replay(&session, "Application", 2);
        let bookmark = Bookmark::new_empty(&session).unwrap();
        bookmark.advance(&events[1], &EventPosition::new("Application", 2)).unwrap();

        let restored = Bookmark::from_xml(&session, &bookmark.serialize().unwrap()).unwrap();
        assert!(!restored.is_start());
        assert_eq!(restored.position("Application"), Some(2));
        assert_eq!(restored.serialize().unwrap(), bookmark.serialize().unwrap());
    }

    #[test]
    fn test_malformed_xml_is_invalid_bookmark() {
        let (_mock, session) = setup(0);
        for xml in [
            "",
            "<BookmarkList>",
            "<Other/>",
            "<BookmarkList><Bookmark RecordId='1'/></BookmarkList>",
        ] {
            assert!(matches!(
                Bookmark::from_xml(&session, xml),
                Err(WatchError::InvalidBookmark(_))
            ));
        }
    }

    #[test]
    fn test_closed_bookmark_is_already_closed() {
        let (_mock, session) = setup(1);
        let (_sub, events) = replay(&session, "Application", 1);
        let bookmark = Bookmark::new_empty(&session).unwrap();
        bookmark.close().unwrap();

        assert!(matches!(bookmark.serialize(), Err(WatchError::AlreadyClosed(_))));
        assert!(matches!(
            bookmark.advance(&events[0], &EventPosition::new("Application", 1)),
            Err(WatchError::AlreadyClosed(_))
        ));
        assert!(matches!(bookmark.close(), Err(WatchError::AlreadyClosed(_))));
    }
}
