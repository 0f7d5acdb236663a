//! Watch context injection
//!
//! Thread-local storage for the channel watch a thread is currently working
//! on, so every log line emitted while converting an event carries the
//! channel and subscription it came from.

use std::cell::RefCell;

use uuid::Uuid;

/// Watch context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchContextData {
    /// Channel being watched
    pub channel: String,
    /// Identifier of the subscription delivering events
    pub subscription_id: Uuid,
    /// Identifier of the watcher instance that owns the subscription
    pub instance_id: Uuid,
}

thread_local! {
    static WATCH_CONTEXT: RefCell<Option<WatchContextData>> = const { RefCell::new(None) };
}

/// RAII guard for watch context
///
/// Creating the guard sets the context for the current thread; dropping it
/// restores whatever was set before.
///
/// ```ignore
/// use winlog_logging::WatchContextGuard;
///
/// let _guard = WatchContextGuard::new("System", subscription_id, instance_id);
/// tracing::warn!("render failed"); // carries channel = "System"
/// ```
pub struct WatchContextGuard {
    previous: Option<WatchContextData>,
}

impl WatchContextGuard {
    pub fn new(channel: impl Into<String>, subscription_id: Uuid, instance_id: Uuid) -> Self {
        Self::enter(WatchContextData {
            channel: channel.into(),
            subscription_id,
            instance_id,
        })
    }

    /// Set an already-built context
    pub fn enter(data: WatchContextData) -> Self {
        let previous = WATCH_CONTEXT.with(|ctx| ctx.borrow_mut().replace(data));
        Self { previous }
    }

    /// Get the current watch context (if any)
    pub fn current() -> Option<WatchContextData> {
        WATCH_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_channel() -> Option<String> {
        Self::current().map(|ctx| ctx.channel)
    }
}

impl Drop for WatchContextGuard {
    fn drop(&mut self) {
        WATCH_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block with a watch context set
///
/// ```ignore
/// with_watch_context!("System", subscription_id, instance_id, {
///     tracing::info!("converting event");
/// });
/// ```
#[macro_export]
macro_rules! with_watch_context {
    ($channel:expr, $subscription:expr, $instance:expr, $body:block) => {{
        let _guard = $crate::context::WatchContextGuard::new($channel, $subscription, $instance);
        $body
    }};
}
