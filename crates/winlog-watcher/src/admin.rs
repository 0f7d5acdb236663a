//! Channel configuration
//!
//! These calls change how the event log itself records a channel. They are
//! not part of the read path and usually need administrative rights.

use tracing::{info, instrument};
use winlog_core::EventLogSession;

use crate::error::{WatchError, WatchResult};

/// Enables, disables and resizes channels
#[derive(Debug, Clone)]
pub struct ChannelAdmin {
    session: EventLogSession,
}

impl ChannelAdmin {
    pub fn new(session: EventLogSession) -> Self {
        Self { session }
    }

    #[instrument(skip(self))]
    pub fn enable(&self, channel: &str) -> WatchResult<()> {
        self.set_enabled(channel, true)
    }

    #[instrument(skip(self))]
    pub fn disable(&self, channel: &str) -> WatchResult<()> {
        self.set_enabled(channel, false)
    }

    fn set_enabled(&self, channel: &str, enabled: bool) -> WatchResult<()> {
        self.session
            .api()
            .set_channel_enabled(channel, enabled)
            .map_err(|status| WatchError::admin(channel, status))?;
        info!(channel, enabled, "channel logging toggled");
        Ok(())
    }

    /// Set the channel's maximum log size in bytes
    #[instrument(skip(self))]
    pub fn set_max_size(&self, channel: &str, max_bytes: u64) -> WatchResult<()> {
        self.session
            .api()
            .set_channel_max_size(channel, max_bytes)
            .map_err(|status| WatchError::admin(channel, status))?;
        info!(channel, max_bytes, "channel size changed");
        Ok(())
    }
}
