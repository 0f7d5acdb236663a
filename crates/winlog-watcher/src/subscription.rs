//! Channel subscriptions
//!
//! A [`Subscription`] owns one native push subscription. Notifications arrive
//! on a dispatcher thread the process does not control; the callback only
//! adopts the payload and enqueues it on a bounded queue, and consumers read
//! from the matching [`Notifications`] receiver on their own tasks.
//!
//! ## Backpressure
//!
//! The enqueue blocks while the queue is full. This stalls the native
//! dispatcher for as long as the consumer lags, so queues are sized
//! generously and a consumer must keep draining (or drop its
//! [`Notifications`]) for the subscription to make progress. Dropping the
//! receiver makes every pending and later enqueue fail fast, which closes
//! the undelivered event handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use winlog_core::{
    EventLogSession, HandleKind, NotificationCallback, NotifyAction, OwnedHandle, RawHandle,
    Status, SubscribeFlags, SubscribeOrigin, SubscribeRequest,
};

use crate::bookmark::Bookmark;
use crate::error::{WatchError, WatchResult};

/// Default bound on queued notifications per subscription
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    Created,
    Active,
    Cancelled,
    Closed,
    /// Setup was rejected; no notification is ever delivered
    Failed,
}

/// Where a subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StartPolicy {
    /// Only events appended after the subscription starts
    #[default]
    FromNow,
    /// Every record still in the channel
    AllRecords,
    /// The record after the bookmark's position
    FromBookmark,
}

/// What to do when a bookmarked record has been rotated out of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResumeMode {
    /// Resume from the earliest record still available
    #[default]
    Lenient,
    /// Fail the subscription setup
    Strict,
}

/// Parameters for a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub channel: String,
    /// Native filter query; `None` matches every event
    pub query: Option<String>,
    pub start: StartPolicy,
    pub resume_mode: ResumeMode,
    pub queue_capacity: usize,
}

impl SubscriptionRequest {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            query: None,
            start: StartPolicy::FromNow,
            resume_mode: ResumeMode::Lenient,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the filter query; an empty query matches everything
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.trim().is_empty() { None } else { Some(query) };
        self
    }

    pub fn with_start(mut self, start: StartPolicy) -> Self {
        self.start = start;
        self
    }

    pub fn with_resume_mode(mut self, resume_mode: ResumeMode) -> Self {
        self.resume_mode = resume_mode;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    fn flags(&self) -> SubscribeFlags {
        let origin = match self.start {
            StartPolicy::FromNow => SubscribeOrigin::ToFutureEvents,
            StartPolicy::AllRecords => SubscribeOrigin::StartAtOldestRecord,
            StartPolicy::FromBookmark => SubscribeOrigin::StartAfterBookmark,
        };
        SubscribeFlags::new(origin).strict(self.resume_mode == ResumeMode::Strict)
    }
}

/// A notification that carries no event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("subscription reported {0}")]
    Status(Status),

    #[error("unknown notification action {0}")]
    UnknownAction(u32),
}

/// One item from a subscription's queue
#[derive(Debug)]
pub enum Notification {
    /// A delivered event; the receiver owns the handle and closes it when done
    Deliver(OwnedHandle),
    Error(NotifyError),
}

/// Consumer of notifications
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_event(&self, event: OwnedHandle);

    async fn on_error(&self, error: NotifyError);
}

/// Receiving end of a subscription's queue
#[derive(Debug)]
pub struct Notifications {
    channel: String,
    subscription_id: Uuid,
    rx: mpsc::Receiver<Notification>,
}

impl Notifications {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Wait for the next notification; `None` once the subscription is closed and drained
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take a queued notification without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Feed every notification to `handler` until the subscription ends
    pub async fn run<H>(mut self, handler: &H) -> usize
    where
        H: NotificationHandler + ?Sized,
    {
        let mut handled = 0;
        while let Some(notification) = self.rx.recv().await {
            match notification {
                Notification::Deliver(event) => handler.on_event(event).await,
                Notification::Error(error) => handler.on_error(error).await,
            }
            handled += 1;
        }
        debug!(channel = %self.channel, handled, "notification stream ended");
        handled
    }
}

/// A watch over one channel
pub struct Subscription {
    id: Uuid,
    request: SubscriptionRequest,
    state: Mutex<SubscriptionState>,
    handle: Mutex<Option<OwnedHandle>>,
    /// Cleared on close or cancel; deliveries after that are discarded
    accepting: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(request: SubscriptionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: Mutex::new(SubscriptionState::Created),
            handle: Mutex::new(None),
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    pub fn channel(&self) -> &str {
        &self.request.channel
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Establish the native subscription
    ///
    /// `bookmark` is required for [`StartPolicy::FromBookmark`] and stays
    /// owned by the caller. With [`ResumeMode::Lenient`] a bookmark whose
    /// record has been rotated away resumes at the earliest remaining record.
    pub fn start(
        &self,
        session: &EventLogSession,
        bookmark: Option<&Bookmark>,
    ) -> WatchResult<Notifications> {
        let mut state = self.state.lock();
        if *state != SubscriptionState::Created {
            return Err(WatchError::invalid_state(format!(
                "cannot start a subscription in state {:?}",
                *state
            )));
        }

        let result = self.establish(session, bookmark);
        match result {
            Ok((handle, notifications)) => {
                *self.handle.lock() = Some(handle);
                *state = SubscriptionState::Active;
                info!(
                    channel = %self.request.channel,
                    subscription_id = %self.id,
                    start = ?self.request.start,
                    "subscription started"
                );
                Ok(notifications)
            }
            Err(e) => {
                self.accepting.store(false, Ordering::Release);
                *state = SubscriptionState::Failed;
                warn!(channel = %self.request.channel, error = %e, "subscription setup failed");
                Err(e)
            }
        }
    }

    fn establish(
        &self,
        session: &EventLogSession,
        bookmark: Option<&Bookmark>,
    ) -> WatchResult<(OwnedHandle, Notifications)> {
        let bookmark = match (self.request.start, bookmark) {
            (StartPolicy::FromBookmark, Some(bookmark)) => {
                Some(bookmark.handle().raw_as(HandleKind::Bookmark)?)
            }
            (StartPolicy::FromBookmark, None) => {
                return Err(WatchError::invalid_bookmark(
                    "starting after a bookmark needs a bookmark",
                ));
            }
            _ => None,
        };

        let (tx, rx) = mpsc::channel(self.request.queue_capacity.max(1));
        self.accepting.store(true, Ordering::Release);
        let callback = notification_callback(
            session.clone(),
            self.request.channel.clone(),
            self.accepting.clone(),
            tx,
        );
        let native = SubscribeRequest {
            channel: &self.request.channel,
            query: self.request.query.as_deref(),
            bookmark,
            flags: self.request.flags(),
        };
        let raw = session
            .api()
            .subscribe(&native, callback)
            .map_err(|status| WatchError::setup(&self.request.channel, status))?;

        let notifications = Notifications {
            channel: self.request.channel.clone(),
            subscription_id: self.id,
            rx,
        };
        Ok((session.adopt(raw, HandleKind::Subscription), notifications))
    }

    /// Native handle of the active subscription
    pub fn raw(&self) -> WatchResult<RawHandle> {
        match self.state() {
            SubscriptionState::Active => match self.handle.lock().as_ref() {
                Some(handle) => Ok(handle.raw()?),
                None => Err(WatchError::invalid_state("active subscription without a handle")),
            },
            SubscriptionState::Closed | SubscriptionState::Cancelled => {
                Err(self.already_closed())
            }
            other => Err(WatchError::invalid_state(format!(
                "subscription has no native handle in state {:?}",
                other
            ))),
        }
    }

    /// Stop notifications without releasing the native handle
    pub fn cancel(&self) -> WatchResult<()> {
        let mut state = self.state.lock();
        match *state {
            SubscriptionState::Active => {}
            SubscriptionState::Cancelled | SubscriptionState::Closed => {
                return Err(self.already_closed());
            }
            other => {
                return Err(WatchError::invalid_state(format!(
                    "cannot cancel a subscription in state {:?}",
                    other
                )));
            }
        }
        self.accepting.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.cancel()?;
        }
        *state = SubscriptionState::Cancelled;
        info!(channel = %self.request.channel, subscription_id = %self.id, "subscription cancelled");
        Ok(())
    }

    /// Release the native subscription
    ///
    /// Notifications already queued stay readable; nothing is enqueued after
    /// this returns.
    pub fn close(&self) -> WatchResult<()> {
        let mut state = self.state.lock();
        match *state {
            SubscriptionState::Closed => return Err(self.already_closed()),
            SubscriptionState::Failed => {
                return Err(WatchError::invalid_state("cannot close a failed subscription"));
            }
            _ => {}
        }
        self.accepting.store(false, Ordering::Release);
        let handle = self.handle.lock().take();
        *state = SubscriptionState::Closed;
        if let Some(handle) = handle {
            handle.close()?;
        }
        info!(channel = %self.request.channel, subscription_id = %self.id, "subscription closed");
        Ok(())
    }

    fn already_closed(&self) -> WatchError {
        WatchError::already_closed(format!("subscription to {}", self.request.channel))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.request.channel)
            .field("state", &self.state())
            .finish()
    }
}

/// Build the callback that runs on the backend's dispatch thread
fn notification_callback(
    session: EventLogSession,
    channel: String,
    accepting: Arc<AtomicBool>,
    tx: mpsc::Sender<Notification>,
) -> NotificationCallback {
    Arc::new(move |action, payload| {
        let notification = match NotifyAction::from_raw(action) {
            Some(NotifyAction::Deliver) => {
                let event = session.adopt(RawHandle(payload), HandleKind::Event);
                if !accepting.load(Ordering::Acquire) {
                    warn!(%channel, handle = payload, "discarding delivery after close");
                    return;
                }
                Notification::Deliver(event)
            }
            Some(NotifyAction::Error) => {
                Notification::Error(NotifyError::Status(Status(payload as u32)))
            }
            None => Notification::Error(NotifyError::UnknownAction(action)),
        };
        if tx.blocking_send(notification).is_err() {
            debug!(%channel, "notification receiver gone; dropping");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use winlog_core::{MockEvent, MockEventLog};

    use super::*;

    fn session() -> (Arc<MockEventLog>, EventLogSession) {
        let mock = Arc::new(MockEventLog::with_channels(&["Application", "System"]));
        let session = EventLogSession::new(mock.clone());
        (mock, session)
    }

    async fn next(notifications: &mut Notifications) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("notification stream ended")
    }

    #[test]
    fn test_request_builders() {
        let request = SubscriptionRequest::new("Application")
            .with_query("   ")
            .with_start(StartPolicy::AllRecords)
            .with_queue_capacity(0);
        assert_eq!(request.query, None);
        assert_eq!(request.queue_capacity, 1);
        assert_eq!(request.flags().origin, SubscribeOrigin::StartAtOldestRecord);
        assert!(!request.flags().strict);

        let strict = SubscriptionRequest::new("Application")
            .with_start(StartPolicy::FromBookmark)
            .with_resume_mode(ResumeMode::Strict);
        assert_eq!(strict.flags().bits(), 3 | SubscribeFlags::STRICT_BIT);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (mock, session) = session();
        let subscription = Subscription::new(SubscriptionRequest::new("Application"));
        assert_eq!(subscription.state(), SubscriptionState::Created);
        assert!(matches!(subscription.raw(), Err(WatchError::InvalidState(_))));

        let mut notifications = subscription.start(&session, None).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Active);
        assert!(subscription.raw().is_ok());
        assert!(matches!(
            subscription.start(&session, None),
            Err(WatchError::InvalidState(_))
        ));

        mock.append("Application", MockEvent::new("App", 1)).unwrap();
        assert!(matches!(next(&mut notifications).await, Notification::Deliver(_)));

        subscription.close().unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert!(matches!(subscription.raw(), Err(WatchError::AlreadyClosed(_))));
        assert!(matches!(subscription.close(), Err(WatchError::AlreadyClosed(_))));
        assert!(matches!(subscription.cancel(), Err(WatchError::AlreadyClosed(_))));
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_terminal() {
        let (_mock, session) = session();
        let subscription = Subscription::new(SubscriptionRequest::new("NoSuchChannel"));
        assert!(matches!(
            subscription.start(&session, None),
            Err(WatchError::SubscriptionSetup {
                status: Status::EVT_CHANNEL_NOT_FOUND,
                ..
            })
        ));
        assert_eq!(subscription.state(), SubscriptionState::Failed);
        assert!(matches!(
            subscription.start(&session, None),
            Err(WatchError::InvalidState(_))
        ));

        let bad_query = Subscription::new(
            SubscriptionRequest::new("Application").with_query("not xpath"),
        );
        assert!(matches!(
            bad_query.start(&session, None),
            Err(WatchError::SubscriptionSetup {
                status: Status::EVT_INVALID_QUERY,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bookmark_start_requires_bookmark() {
        let (_mock, session) = session();
        let subscription = Subscription::new(
            SubscriptionRequest::new("Application").with_start(StartPolicy::FromBookmark),
        );
        assert!(matches!(
            subscription.start(&session, None),
            Err(WatchError::InvalidBookmark(_))
        ));
        assert_eq!(subscription.state(), SubscriptionState::Failed);
    }

    #[tokio::test]
    async fn test_error_and_unknown_notifications() {
        let (mock, session) = session();
        let subscription = Subscription::new(SubscriptionRequest::new("System"));
        let mut notifications = subscription.start(&session, None).unwrap();

        mock.inject_error("System", Status::CANCELLED);
        mock.inject_action("System", 7, 0xdead);

        assert!(matches!(
            next(&mut notifications).await,
            Notification::Error(NotifyError::Status(Status::CANCELLED))
        ));
        assert!(matches!(
            next(&mut notifications).await,
            Notification::Error(NotifyError::UnknownAction(7))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_deliveries() {
        let (mock, session) = session();
        let subscription = Subscription::new(SubscriptionRequest::new("Application"));
        let mut notifications = subscription.start(&session, None).unwrap();

        subscription.cancel().unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
        assert!(matches!(subscription.raw(), Err(WatchError::AlreadyClosed(_))));
        assert!(mock.append("Application", MockEvent::new("App", 1)).is_some());

        // Closing after cancel releases the handle and ends the stream.
        subscription.close().unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_queued_events() {
        let (mock, session) = session();
        let subscription = Subscription::new(
            SubscriptionRequest::new("Application").with_queue_capacity(1),
        );
        let notifications = subscription.start(&session, None).unwrap();
        drop(notifications);

        for id in 0..3 {
            mock.append("Application", MockEvent::new("App", id)).unwrap();
        }
        tokio::task::spawn_blocking({
            let mock = mock.clone();
            move || mock.flush()
        })
        .await
        .unwrap();
        assert_eq!(mock.open_count(HandleKind::Event), 0);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_dispatch_without_loss() {
        let (mock, session) = session();
        let renderer = winlog_render::Renderer::new(session.clone());
        let system = winlog_render::RenderContext::system(&session).unwrap();
        let subscription = Subscription::new(
            SubscriptionRequest::new("Application").with_queue_capacity(1),
        );
        let mut notifications = subscription.start(&session, None).unwrap();

        for id in 1..=12 {
            mock.append("Application", MockEvent::new("App", id)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 1..=12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let Notification::Deliver(event) = next(&mut notifications).await else {
                panic!("expected a delivery");
            };
            let decoded = renderer.render_system(&system, &event).unwrap();
            seen.push(decoded.fields.event_id.unwrap());
            event.close().unwrap();
        }
        assert_eq!(seen, (1..=12).collect::<Vec<u16>>());
        assert!(notifications.try_recv().is_none());

        subscription.close().unwrap();
        system.close().unwrap();
        assert_eq!(mock.open_count(HandleKind::Event), 0);
    }

    struct Counting {
        events: std::sync::atomic::AtomicUsize,
        errors: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl NotificationHandler for Counting {
        async fn on_event(&self, event: OwnedHandle) {
            event.close().unwrap();
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _error: NotifyError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_run_feeds_handler_until_closed() {
        let (mock, session) = session();
        let subscription = Subscription::new(SubscriptionRequest::new("Application"));
        let notifications = subscription.start(&session, None).unwrap();
        assert_eq!(notifications.channel(), "Application");
        assert_eq!(notifications.subscription_id(), subscription.id());

        mock.append("Application", MockEvent::new("App", 1)).unwrap();
        mock.append("Application", MockEvent::new("App", 2)).unwrap();
        mock.inject_error("Application", Status::INVALID_HANDLE);
        tokio::task::spawn_blocking({
            let mock = mock.clone();
            move || mock.flush()
        })
        .await
        .unwrap();
        subscription.close().unwrap();

        let handler = Counting {
            events: Default::default(),
            errors: Default::default(),
        };
        let handled = notifications.run(&handler).await;
        assert_eq!(handled, 3);
        assert_eq!(handler.events.load(Ordering::SeqCst), 2);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert_eq!(mock.open_count(HandleKind::Event), 0);
    }
}
