//! Error types for winlog-render

use thiserror::Error;
use winlog_core::{DecodeError, HandleError, Status};

/// Errors raised while rendering or formatting
#[derive(Debug, Error)]
pub enum RenderError {
    /// The native call failed outright
    #[error("{op} failed: {status}")]
    RenderFailure { op: &'static str, status: Status },

    /// The native layer broke the size protocol
    #[error("{op} reported size {reported} with {status}")]
    UnexpectedSize {
        op: &'static str,
        status: Status,
        reported: usize,
    },

    /// The buffer could not be allocated, or the native layer ran out of memory
    #[error("{op} ran out of memory for {bytes} bytes")]
    OutOfMemory { op: &'static str, bytes: usize },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl RenderError {
    pub fn failure(op: &'static str, status: Status) -> Self {
        Self::RenderFailure { op, status }
    }

    /// The native status behind this error, if there is one
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::RenderFailure { status, .. } | Self::UnexpectedSize { status, .. } => Some(*status),
            Self::Handle(HandleError::Native { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// True for failures of the render protocol itself, as opposed to the handle or decoding
    pub fn is_render_failure(&self) -> bool {
        matches!(self, Self::RenderFailure { .. } | Self::UnexpectedSize { .. })
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        let err = RenderError::failure("render", Status::INVALID_HANDLE);
        assert_eq!(err.status(), Some(Status::INVALID_HANDLE));
        assert!(err.is_render_failure());

        let oom = RenderError::OutOfMemory { op: "render", bytes: 64 };
        assert_eq!(oom.status(), None);
        assert!(!oom.is_render_failure());
    }

    #[test]
    fn test_unexpected_size_counts_as_failure() {
        let err = RenderError::UnexpectedSize {
            op: "format message",
            status: Status::INSUFFICIENT_BUFFER,
            reported: 0,
        };
        assert!(err.is_render_failure());
        assert!(err.to_string().contains("format message"));
    }
}
