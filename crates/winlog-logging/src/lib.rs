//! Structured logging for winlog agents
//!
//! JSON-lines output by default, with a pretty console mode for development
//! and rolling file output for long-running collectors.
//!
//! # Quick Start
//!
//! ```ignore
//! use winlog_logging::{LogConfig, WinlogSubscriberBuilder};
//!
//! let _guard = WinlogSubscriberBuilder::new()
//!     .with_config(LogConfig::service("C:\\ProgramData\\winlog\\logs"))
//!     .try_init()?;
//! ```
//!
//! # Watch Context
//!
//! Work done on behalf of one channel subscription runs under a
//! [`WatchContextGuard`]; spans opened inside it carry the channel name.

pub mod config;
pub mod context;
pub mod error;
pub mod layers;

pub use config::{ConsoleConfig, ConsoleFormat, FileConfig, FileRotation, JsonlConfig, LogConfig};
pub use context::{WatchContextData, WatchContextGuard};
pub use error::LoggingError;
pub use layers::{WatchContextExtension, WatchContextLayer, jsonl_file_layer};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

type BaseSubscriber = Layered<WatchContextLayer, Layered<EnvFilter, Registry>>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync + 'static>;

/// Builder for the winlog tracing subscriber
pub struct WinlogSubscriberBuilder {
    config: LogConfig,
}

impl WinlogSubscriberBuilder {
    /// Default: JSONL output to the console
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Assemble the subscriber without installing it
    ///
    /// The returned guard flushes the file writer on drop and must outlive
    /// any logging that should reach the file.
    pub fn build(
        self,
    ) -> Result<(impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>), LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.filter_directives())
                .map_err(|e| LoggingError::Filter(e.to_string()))?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            let console = &self.config.console;
            let layer: BoxedLayer = match console.format {
                ConsoleFormat::Pretty => tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(console.ansi)
                    .with_target(true)
                    .boxed(),
                ConsoleFormat::Json => jsonl_file_layer(std::io::stdout, &self.config.jsonl).boxed(),
            };
            let layer = match &console.level {
                Some(level) => {
                    let filter = EnvFilter::try_new(level)
                        .map_err(|e| LoggingError::Filter(e.to_string()))?;
                    layer.with_filter(filter).boxed()
                }
                None => layer,
            };
            layers.push(layer);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            layers.push(jsonl_file_layer(writer, &self.config.jsonl).boxed());
            guard = Some(file_guard);
        }

        let subscriber = Registry::default()
            .with(env_filter)
            .with(WatchContextLayer::new())
            .with(layers);
        Ok((subscriber, guard))
    }

    /// Install the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (subscriber, guard) = self.build()?;
        subscriber
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
        Ok(guard)
    }

    /// Install the subscriber globally, reporting setup failures on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("winlog logging not initialized: {}", e);
                None
            }
        }
    }
}

impl Default for WinlogSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory).map_err(|e| LoggingError::io(&config.directory, e))?;
    let rotation = match config.rotation {
        FileRotation::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            let file = File::create(&path).map_err(|e| LoggingError::io(&path, e))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        FileRotation::Daily => Rotation::DAILY,
        FileRotation::Hourly => Rotation::HOURLY,
    };
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix);
    if let Some(max) = config.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::Appender(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to the console at the default level
pub fn init_default() -> Option<WorkerGuard> {
    WinlogSubscriberBuilder::new().init()
}

/// Pretty console output for running an agent by hand
pub fn init_interactive() -> Option<WorkerGuard> {
    WinlogSubscriberBuilder::new()
        .with_config(LogConfig::interactive())
        .init()
}

/// Minimal output; safe to call from every test
pub fn init_testing() {
    let _ = WinlogSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
