//! Multi-channel event watcher
//!
//! [`LogWatcher`] owns one subscription and one bookmark per watched channel
//! and converts every delivered event into a [`WatchedEvent`]. Conversion is
//! blocking native work, so each channel's consumer task hands it to the
//! blocking pool; results and failures come out of two bounded streams.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use winlog_core::{EventLogSession, FormatMessageFlags, OwnedHandle, Status, VariantValue};
use winlog_logging::{WatchContextData, WatchContextGuard};
use winlog_render::{PublisherCache, PublisherMetadata, RenderContext, Renderer, SystemFields};

use crate::bookmark::Bookmark;
use crate::error::{WatchError, WatchResult};
use crate::subscription::{
    DEFAULT_QUEUE_CAPACITY, Notification, Notifications, NotifyError, ResumeMode, StartPolicy,
    Subscription, SubscriptionRequest,
};

/// Which parts of each event are rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub message: bool,
    pub level: bool,
    pub task: bool,
    pub opcode: bool,
    pub keywords: bool,
    pub channel: bool,
    pub provider: bool,
    pub id: bool,
    pub xml: bool,
    pub user_data: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            message: true,
            level: true,
            task: true,
            opcode: true,
            keywords: true,
            channel: true,
            provider: true,
            id: false,
            xml: true,
            user_data: true,
        }
    }
}

impl RenderOptions {
    /// Only system fields and the bookmark
    pub fn minimal() -> Self {
        Self {
            message: false,
            level: false,
            task: false,
            opcode: false,
            keywords: false,
            channel: false,
            provider: false,
            id: false,
            xml: false,
            user_data: false,
        }
    }

    fn formats_anything(&self) -> bool {
        self.message
            || self.level
            || self.task
            || self.opcode
            || self.keywords
            || self.channel
            || self.provider
            || self.id
    }
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Bound on queued notifications per subscription
    pub queue_capacity: usize,
    /// Bound on converted events awaiting `recv_event`
    pub event_buffer: usize,
    /// Bound on failures awaiting `recv_error`; further failures are dropped
    pub error_buffer: usize,
    pub resume_mode: ResumeMode,
    pub render: RenderOptions,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_buffer: 1024,
            error_buffer: 256,
            resume_mode: ResumeMode::Lenient,
            render: RenderOptions::default(),
        }
    }
}

impl WatcherConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn with_error_buffer(mut self, size: usize) -> Self {
        self.error_buffer = size.max(1);
        self
    }

    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }
}

/// A delivered event, rendered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub system: SystemFields,
    pub created: Option<DateTime<Utc>>,
    pub xml: Option<String>,
    pub message: Option<String>,
    pub level: Option<String>,
    pub task: Option<String>,
    pub opcode: Option<String>,
    pub channel: Option<String>,
    pub provider: Option<String>,
    pub id: Option<String>,
    pub keywords: Vec<String>,
    pub user_data: Vec<VariantValue>,
    /// Bookmark XML positioned at this event
    pub bookmark: String,
    /// The channel name the watch was created with
    pub subscribed_channel: String,
    /// Part name to error text for every part that failed to render
    pub errors: BTreeMap<String, String>,
}

/// Something a watch reported instead of an event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchFailure {
    #[error("{channel}: {error}")]
    Notification { channel: String, error: NotifyError },

    #[error("{channel}: event skipped: {message}")]
    Conversion {
        channel: String,
        message: String,
        status: Option<Status>,
    },
}

impl WatchFailure {
    pub fn channel(&self) -> &str {
        match self {
            Self::Notification { channel, .. } | Self::Conversion { channel, .. } => channel,
        }
    }
}

/// Close a subscription off the async runtime
///
/// A native close waits for callbacks still running, and a callback can be
/// blocked on a full queue. Callers stop the consumer task first so its
/// receiver is gone before this runs.
async fn close_subscription(subscription: Subscription) -> WatchResult<()> {
    tokio::task::spawn_blocking(move || subscription.close())
        .await
        .map_err(|e| WatchError::invalid_state(format!("subscription close panicked: {}", e)))?
}

/// Render state shared by every watch
struct Shared {
    renderer: Renderer,
    system: RenderContext,
    user: RenderContext,
    publishers: PublisherCache,
    options: RenderOptions,
}

impl Shared {
    fn convert(
        &self,
        event: &OwnedHandle,
        bookmark: &Bookmark,
        subscribed: &str,
    ) -> WatchResult<WatchedEvent> {
        let mut out = WatchedEvent {
            subscribed_channel: subscribed.to_string(),
            ..Default::default()
        };

        let system = self.renderer.render_system(&self.system, event);
        let xml = self.options.xml.then(|| self.renderer.render_xml(event));
        let system = match (system, xml) {
            (Err(e), None) | (Err(e), Some(Err(_))) => return Err(e.into()),
            (system, xml) => {
                match xml {
                    Some(Ok(text)) => out.xml = Some(text),
                    Some(Err(e)) => {
                        out.errors.insert("xml".to_string(), e.to_string());
                    }
                    None => {}
                }
                match system {
                    Ok(decoded) => {
                        for failed in &decoded.errors {
                            out.errors.insert(failed.key(), failed.error.to_string());
                        }
                        Some(decoded.fields)
                    }
                    Err(e) => {
                        out.errors.insert("system".to_string(), e.to_string());
                        None
                    }
                }
            }
        };

        let provider = system.as_ref().and_then(|f| f.provider_name.clone());
        if let Some(provider) = provider.filter(|_| self.options.formats_anything()) {
            match self.publishers.resolve(&provider) {
                Ok(publisher) => self.format_parts(&mut out, &publisher, event),
                Err(e) => {
                    out.errors.insert("publisher".to_string(), e.to_string());
                }
            }
        }

        if self.options.user_data {
            match self.renderer.render_values(&self.user, event) {
                Ok(set) => {
                    let decoded = set.to_values();
                    for (index, error) in &decoded.errors {
                        out.errors
                            .insert(format!("user_data[{}]", index), error.to_string());
                    }
                    out.user_data = decoded.values;
                }
                Err(e) => {
                    out.errors.insert("user_data".to_string(), e.to_string());
                }
            }
        }

        match system.as_ref().and_then(SystemFields::position) {
            Some(position) => {
                bookmark.advance(event, &position)?;
            }
            None => bookmark.advance_unpositioned(event)?,
        }
        out.bookmark = bookmark.serialize()?;

        if let Some(fields) = system {
            out.created = fields.created();
            out.system = fields;
        }
        Ok(out)
    }

    fn format_parts(
        &self,
        out: &mut WatchedEvent,
        publisher: &PublisherMetadata,
        event: &OwnedHandle,
    ) {
        let options = &self.options;
        let parts = [
            (options.message, FormatMessageFlags::Event, &mut out.message),
            (options.level, FormatMessageFlags::Level, &mut out.level),
            (options.task, FormatMessageFlags::Task, &mut out.task),
            (options.opcode, FormatMessageFlags::Opcode, &mut out.opcode),
            (options.channel, FormatMessageFlags::Channel, &mut out.channel),
            (options.provider, FormatMessageFlags::Provider, &mut out.provider),
            (options.id, FormatMessageFlags::Id, &mut out.id),
        ];
        for (enabled, flag, slot) in parts {
            if !enabled {
                continue;
            }
            match self.renderer.format_message(Some(publisher), event, flag) {
                Ok(text) => *slot = Some(text),
                Err(e) => {
                    out.errors.insert(flag.name().to_string(), e.to_string());
                }
            }
        }
        if options.keywords {
            match self.renderer.format_keywords(Some(publisher), event) {
                Ok(keywords) => out.keywords = keywords,
                Err(e) => {
                    out.errors
                        .insert(FormatMessageFlags::Keyword.name().to_string(), e.to_string());
                }
            }
        }
    }
}

struct Watch {
    subscription: Subscription,
    bookmark: Arc<Bookmark>,
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Watches any number of channels and renders what they deliver
///
/// Within one channel, events come out in append order. There is no ordering
/// between channels.
pub struct LogWatcher {
    instance_id: Uuid,
    session: EventLogSession,
    config: WatcherConfig,
    shared: Arc<Shared>,
    /// Lowercased channel name to its watch
    watches: RwLock<HashMap<String, Watch>>,
    event_tx: mpsc::Sender<WatchedEvent>,
    event_rx: Arc<RwLock<mpsc::Receiver<WatchedEvent>>>,
    error_tx: mpsc::Sender<WatchFailure>,
    error_rx: Arc<RwLock<mpsc::Receiver<WatchFailure>>>,
    shut_down: AtomicBool,
}

impl LogWatcher {
    /// Create a watcher with its shared render contexts
    pub fn new(session: EventLogSession, config: WatcherConfig) -> WatchResult<Self> {
        let system = RenderContext::system(&session)?;
        let user = RenderContext::user(&session)?;
        let shared = Arc::new(Shared {
            renderer: Renderer::new(session.clone()),
            system,
            user,
            publishers: PublisherCache::new(session.clone()),
            options: config.render.clone(),
        });
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(config.error_buffer.max(1));

        Ok(Self {
            instance_id: Uuid::new_v4(),
            session,
            config,
            shared,
            watches: RwLock::new(HashMap::new()),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            error_tx,
            error_rx: Arc::new(RwLock::new(error_rx)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Watch `channel` for events appended from now on
    pub async fn subscribe_from_now(&self, channel: &str, query: Option<&str>) -> WatchResult<()> {
        let request = self.request(channel, query, StartPolicy::FromNow);
        self.watch(request, None).await
    }

    /// Watch `channel` starting with its oldest record
    pub async fn subscribe_from_beginning(
        &self,
        channel: &str,
        query: Option<&str>,
    ) -> WatchResult<()> {
        let request = self.request(channel, query, StartPolicy::AllRecords);
        self.watch(request, None).await
    }

    /// Watch `channel` starting after the position saved in `bookmark_xml`
    pub async fn subscribe_from_bookmark(
        &self,
        channel: &str,
        query: Option<&str>,
        bookmark_xml: &str,
    ) -> WatchResult<()> {
        let request = self.request(channel, query, StartPolicy::FromBookmark);
        self.watch(request, Some(bookmark_xml)).await
    }

    fn request(&self, channel: &str, query: Option<&str>, start: StartPolicy) -> SubscriptionRequest {
        let request = SubscriptionRequest::new(channel)
            .with_start(start)
            .with_resume_mode(self.config.resume_mode)
            .with_queue_capacity(self.config.queue_capacity);
        match query {
            Some(query) => request.with_query(query),
            None => request,
        }
    }

    #[instrument(skip(self, request, bookmark_xml), fields(channel = %request.channel, start = ?request.start))]
    async fn watch(&self, request: SubscriptionRequest, bookmark_xml: Option<&str>) -> WatchResult<()> {
        let key = request.channel.to_ascii_lowercase();
        let mut watches = self.watches.write().await;
        // Checked under the lock: shutdown sets the flag before it drains.
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WatchError::invalid_state("watcher is shut down"));
        }
        if watches.contains_key(&key) {
            return Err(WatchError::DuplicateChannel(request.channel));
        }

        let bookmark = match bookmark_xml {
            Some(xml) => Bookmark::from_xml(&self.session, xml)?,
            None => Bookmark::new_empty(&self.session)?,
        };
        let subscription = Subscription::new(request);
        let notifications = match subscription.start(&self.session, Some(&bookmark)) {
            Ok(notifications) => notifications,
            Err(e) => {
                if let Err(close_err) = bookmark.close() {
                    debug!(error = %close_err, "closing bookmark after failed setup");
                }
                return Err(e);
            }
        };

        let bookmark = Arc::new(bookmark);
        let (stop, _) = broadcast::channel(1);
        let task = self.spawn_consumer(notifications, bookmark.clone(), stop.subscribe());
        watches.insert(
            key,
            Watch {
                subscription,
                bookmark,
                stop,
                task,
            },
        );
        Ok(())
    }

    fn spawn_consumer(
        &self,
        mut notifications: Notifications,
        bookmark: Arc<Bookmark>,
        mut stop: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let events = self.event_tx.clone();
        let errors = self.error_tx.clone();
        let context = WatchContextData {
            channel: notifications.channel().to_string(),
            subscription_id: notifications.subscription_id(),
            instance_id: self.instance_id,
        };

        tokio::spawn(async move {
            let channel = context.channel.clone();
            loop {
                let notification = tokio::select! {
                    _ = stop.recv() => break,
                    next = notifications.recv() => match next {
                        Some(notification) => notification,
                        None => break,
                    },
                };

                let event = match notification {
                    Notification::Deliver(event) => event,
                    Notification::Error(error) => {
                        warn!(%channel, %error, "subscription reported an error");
                        publish_failure(
                            &errors,
                            WatchFailure::Notification {
                                channel: channel.clone(),
                                error,
                            },
                        );
                        continue;
                    }
                };

                let worker_shared = shared.clone();
                let worker_bookmark = bookmark.clone();
                let worker_context = context.clone();
                let converted = tokio::task::spawn_blocking(move || {
                    let channel = worker_context.channel.clone();
                    let _guard = WatchContextGuard::enter(worker_context);
                    let _span = tracing::debug_span!("convert", %channel).entered();
                    let result = worker_shared.convert(&event, &worker_bookmark, &channel);
                    if let Err(e) = event.close() {
                        debug!(error = %e, "closing delivered event");
                    }
                    result
                })
                .await;

                match converted {
                    Ok(Ok(watched)) => {
                        tokio::select! {
                            _ = stop.recv() => break,
                            sent = events.send(watched) => if sent.is_err() {
                                break;
                            },
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(%channel, error = %e, "event conversion failed; skipping");
                        publish_failure(
                            &errors,
                            WatchFailure::Conversion {
                                channel: channel.clone(),
                                status: e.status(),
                                message: e.to_string(),
                            },
                        );
                    }
                    Err(e) => warn!(%channel, error = %e, "conversion worker failed"),
                }
            }
            debug!(%channel, "consumer task stopped");
        })
    }

    /// Next converted event from any channel
    pub async fn recv_event(&self) -> Option<WatchedEvent> {
        self.event_rx.write().await.recv().await
    }

    /// Next failure from any channel
    pub async fn recv_error(&self) -> Option<WatchFailure> {
        self.error_rx.write().await.recv().await
    }

    /// Serialized bookmark for `channel`, positioned at its last converted event
    pub async fn bookmark(&self, channel: &str) -> WatchResult<String> {
        let watches = self.watches.read().await;
        let watch = watches
            .get(&channel.to_ascii_lowercase())
            .ok_or_else(|| WatchError::ChannelNotWatched(channel.to_string()))?;
        watch.bookmark.serialize()
    }

    /// Names of the watched channels, as given when subscribing
    pub async fn channels(&self) -> Vec<String> {
        let watches = self.watches.read().await;
        let mut channels: Vec<String> = watches
            .values()
            .map(|w| w.subscription.channel().to_string())
            .collect();
        channels.sort();
        channels
    }

    /// Stop watching `channel` and release its subscription and bookmark
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, channel: &str) -> WatchResult<()> {
        let watch = self
            .watches
            .write()
            .await
            .remove(&channel.to_ascii_lowercase())
            .ok_or_else(|| WatchError::ChannelNotWatched(channel.to_string()))?;

        let Watch {
            subscription,
            bookmark,
            stop,
            task,
        } = watch;
        let _ = stop.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "consumer task ended abnormally");
        }
        let closed = close_subscription(subscription).await;
        bookmark.close()?;
        closed
    }

    /// Close every watch, then the publisher cache and render contexts
    ///
    /// Each consumer task ends before its subscription is closed, and all
    /// subscriptions are closed before anything they render with. Calling
    /// this again does nothing.
    pub async fn shutdown(&self) -> WatchResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let watches: Vec<Watch> = self.watches.write().await.drain().map(|(_, w)| w).collect();

        for watch in &watches {
            let _ = watch.stop.send(());
        }
        let mut bookmarks = Vec::with_capacity(watches.len());
        for watch in watches {
            if let Err(e) = watch.task.await {
                warn!(error = %e, "consumer task ended abnormally");
            }
            let channel = watch.subscription.channel().to_string();
            if let Err(e) = close_subscription(watch.subscription).await {
                warn!(%channel, error = %e, "closing subscription failed");
            }
            bookmarks.push(watch.bookmark);
        }
        for bookmark in bookmarks {
            if let Err(e) = bookmark.close() {
                warn!(error = %e, "closing bookmark failed");
            }
        }

        self.shared.publishers.close_all();
        for context in [&self.shared.system, &self.shared.user] {
            if let Err(e) = context.close() {
                warn!(error = %e, "closing render context failed");
            }
        }
        info!(instance_id = %self.instance_id, "watcher shut down");
        Ok(())
    }
}

fn publish_failure(errors: &mpsc::Sender<WatchFailure>, failure: WatchFailure) {
    if let Err(e) = errors.try_send(failure) {
        warn!(error = %e, "error stream full; dropping failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_render_options() {
        let options = RenderOptions::default();
        assert!(options.message && options.xml && options.user_data);
        assert!(!options.id);
        assert!(!RenderOptions::minimal().formats_anything());
    }

    #[test]
    fn test_config_builders_clamp() {
        let config = WatcherConfig::default()
            .with_queue_capacity(0)
            .with_event_buffer(0)
            .with_error_buffer(4)
            .with_resume_mode(ResumeMode::Strict);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.event_buffer, 1);
        assert_eq!(config.error_buffer, 4);
        assert_eq!(config.resume_mode, ResumeMode::Strict);
    }

    #[test]
    fn test_watched_event_serializes() {
        let mut event = WatchedEvent {
            subscribed_channel: "System".to_string(),
            keywords: vec!["Classic".to_string()],
            user_data: vec![VariantValue::UInt32(7)],
            ..Default::default()
        };
        event.errors.insert("message".into(), "not found".into());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["subscribed_channel"], "System");
        assert_eq!(json["errors"]["message"], "not found");

        let back: WatchedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_failure_channel() {
        let failure = WatchFailure::Notification {
            channel: "Security".into(),
            error: NotifyError::UnknownAction(9),
        };
        assert_eq!(failure.channel(), "Security");
        assert!(failure.to_string().contains("unknown notification action 9"));
    }
}
