//! Logging configuration for winlog agents
//!
//! An agent usually runs one of two ways: by hand from a terminal while a
//! query is being worked out, or as a Windows service writing rotated JSONL
//! next to its state directory. [`LogConfig::interactive`] and
//! [`LogConfig::service`] cover those; everything else is a field away.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level logging configuration
///
/// `RUST_LOG`, when set, replaces both `level` and `overrides`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for any target without an override
    pub level: String,
    /// Target to level, e.g. `winlog_render::publisher` to `debug`
    pub overrides: BTreeMap<String, String>,
    pub console: ConsoleConfig,
    /// Rotated JSONL files; off unless set
    pub file: Option<FileConfig>,
    /// Field selection for every JSONL writer
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            overrides: BTreeMap::new(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Pretty, coloured console output with per-event render detail
    pub fn interactive() -> Self {
        Self {
            level: "debug".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Pretty,
                ansi: true,
                ..ConsoleConfig::default()
            },
            ..Self::default()
        }
    }

    /// No console; daily JSONL files under `log_dir`, a month kept
    pub fn service(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            console: ConsoleConfig {
                enabled: false,
                ..ConsoleConfig::default()
            },
            file: Some(FileConfig {
                max_files: Some(30),
                ..FileConfig::new(log_dir)
            }),
            ..Self::default()
        }
    }

    /// Warnings only, so test output stays readable
    pub fn testing() -> Self {
        Self {
            level: "warn".to_string(),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.overrides.insert(target.into(), level.into());
        self
    }

    /// `EnvFilter` directives: the base level, then each override
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.overrides
                    .iter()
                    .map(|(target, level)| format!("{}={}", target, level)),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// How console lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleFormat {
    /// One JSON object per line, same shape as the files
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: ConsoleFormat,
    /// Colour codes; only honoured by the pretty format
    pub ansi: bool,
    /// Extra filter applied to the console only
    pub level: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: ConsoleFormat::Json,
            ansi: false,
            level: None,
        }
    }
}

/// Where and how log files are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File names start with this; `<prefix>.log` when rotation is off
    pub prefix: String,
    pub rotation: FileRotation,
    /// Rotated files kept before the oldest is removed
    pub max_files: Option<usize>,
}

impl FileConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: "winlog".to_string(),
            rotation: FileRotation::Daily,
            max_files: Some(7),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_rotation(mut self, rotation: FileRotation) -> Self {
        self.rotation = rotation;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRotation {
    #[default]
    Daily,
    Hourly,
    /// A single file, truncated when logging starts
    Never,
}

/// Which fields a JSONL line carries besides level, target and message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Event fields at the top level rather than under `fields`
    pub flatten: bool,
    /// The current span and its ancestors, where the channel name lives
    pub spans: bool,
    pub source_location: bool,
    pub thread: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten: true,
            spans: true,
            source_location: false,
            thread: true,
        }
    }
}
