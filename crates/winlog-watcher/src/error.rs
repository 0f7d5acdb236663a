//! Error types for bookmarks, subscriptions and the watcher

use thiserror::Error;
use winlog_core::{DecodeError, HandleError, HandleKind, Status};
use winlog_render::RenderError;

/// Errors that can occur while watching channels
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Invalid bookmark: {0}")]
    InvalidBookmark(String),

    #[error("Subscription to {channel} could not be established: {status}")]
    SubscriptionSetup { channel: String, status: Status },

    #[error("{0} is already closed")]
    AlreadyClosed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Channel {0} is already being watched")]
    DuplicateChannel(String),

    #[error("Channel {0} is not being watched")]
    ChannelNotWatched(String),

    #[error("Configuring channel {channel} failed: {status}")]
    ChannelAdmin { channel: String, status: Status },

    #[error("Render error: {0}")]
    Render(RenderError),

    #[error("Handle error: {0}")]
    Handle(HandleError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl WatchError {
    pub fn invalid_bookmark(msg: impl Into<String>) -> Self {
        Self::InvalidBookmark(msg.into())
    }

    pub fn already_closed(what: impl Into<String>) -> Self {
        Self::AlreadyClosed(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn setup(channel: impl Into<String>, status: Status) -> Self {
        Self::SubscriptionSetup {
            channel: channel.into(),
            status,
        }
    }

    pub fn admin(channel: impl Into<String>, status: Status) -> Self {
        Self::ChannelAdmin {
            channel: channel.into(),
            status,
        }
    }

    /// The native status behind this error, if there is one
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::SubscriptionSetup { status, .. } | Self::ChannelAdmin { status, .. } => {
                Some(*status)
            }
            Self::Render(err) => err.status(),
            Self::Handle(HandleError::Native { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl From<HandleError> for WatchError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::AlreadyClosed { kind, .. } => Self::AlreadyClosed(closed_name(kind)),
            other => Self::Handle(other),
        }
    }
}

impl From<RenderError> for WatchError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Handle(handle) => handle.into(),
            other => Self::Render(other),
        }
    }
}

fn closed_name(kind: HandleKind) -> String {
    format!("{} handle", kind)
}

/// Result type for watcher operations
pub type WatchResult<T> = Result<T, WatchError>;
