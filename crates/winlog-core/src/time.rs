//! Native 100-nanosecond timestamps

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds between 1601-01-01T00:00:00Z and 1970-01-01T00:00:00Z
pub const FILETIME_UNIX_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// FileTime ticks per second (one tick is 100ns)
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// A count of 100-nanosecond intervals since 1601-01-01 UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileTime(pub u64);

impl FileTime {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build a FileTime from whole Unix seconds
    pub fn from_unix_seconds(secs: u64) -> Self {
        Self((secs + FILETIME_UNIX_EPOCH_OFFSET_SECS) * TICKS_PER_SECOND)
    }

    /// Build a FileTime from a UTC timestamp, keeping 100ns precision
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let secs = (at.timestamp() + FILETIME_UNIX_EPOCH_OFFSET_SECS as i64).max(0) as u64;
        let ticks = u64::from(at.timestamp_subsec_nanos()) / 100;
        Self(secs * TICKS_PER_SECOND + ticks)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Whole seconds since the Unix epoch; negative before 1970
    pub fn to_unix_seconds(self) -> i64 {
        (self.0 / TICKS_PER_SECOND) as i64 - FILETIME_UNIX_EPOCH_OFFSET_SECS as i64
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let nanos = (self.0 % TICKS_PER_SECOND) as u32 * 100;
        DateTime::from_timestamp(self.to_unix_seconds(), nanos)
    }
}

impl fmt::Display for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(at) => write!(f, "{}", at.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            None => write!(f, "filetime:{}", self.0),
        }
    }
}
