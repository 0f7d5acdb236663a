//! # Winlog Watcher
//!
//! Watches event log channels and turns what they deliver into owned,
//! serializable events.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ LogWatcher                                 │
//! │   per channel: Subscription + Bookmark     │
//! │   shared: render contexts, publisher cache │
//! ├────────────────────────────────────────────┤
//! │ Subscription  ─ bounded queue ─▶ consumer  │
//! │ (native dispatcher thread)       (tokio)   │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use winlog_core::EventLogSession;
//! use winlog_watcher::{LogWatcher, WatcherConfig};
//!
//! let watcher = LogWatcher::new(EventLogSession::local(), WatcherConfig::default())?;
//! watcher.subscribe_from_now("System", None).await?;
//! while let Some(event) = watcher.recv_event().await {
//!     println!("{:?} {}", event.system.event_id, event.message.unwrap_or_default());
//!     save(&event.bookmark);
//! }
//! ```

pub mod admin;
pub mod bookmark;
pub mod error;
pub mod subscription;
pub mod watcher;

pub use admin::ChannelAdmin;
pub use bookmark::Bookmark;
pub use error::{WatchError, WatchResult};
pub use subscription::{
    DEFAULT_QUEUE_CAPACITY, Notification, NotificationHandler, Notifications, NotifyError,
    ResumeMode, StartPolicy, Subscription, SubscriptionRequest, SubscriptionState,
};
pub use watcher::{LogWatcher, RenderOptions, WatchFailure, WatchedEvent, WatcherConfig};
