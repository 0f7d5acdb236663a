//! Logging setup errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("log file setup failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rolling appender setup failed: {0}")]
    Appender(String),

    #[error("invalid filter directive: {0}")]
    Filter(String),

    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

impl LoggingError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
