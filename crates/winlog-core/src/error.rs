//! Error types for the winlog core

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::HandleKind;
use crate::variant::VariantKind;

/// A status code reported by the native event log subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const ACCESS_DENIED: Status = Status(5);
    pub const INVALID_HANDLE: Status = Status(6);
    pub const NOT_ENOUGH_MEMORY: Status = Status(8);
    pub const OUTOFMEMORY: Status = Status(14);
    pub const INVALID_PARAMETER: Status = Status(87);
    pub const NO_MORE_ITEMS: Status = Status(259);
    pub const INSUFFICIENT_BUFFER: Status = Status(122);
    pub const NOT_FOUND: Status = Status(1168);
    pub const CANCELLED: Status = Status(1223);
    pub const XML_PARSE_ERROR: Status = Status(1465);
    pub const EVT_INVALID_CHANNEL_PATH: Status = Status(15000);
    pub const EVT_INVALID_QUERY: Status = Status(15001);
    pub const EVT_PUBLISHER_METADATA_NOT_FOUND: Status = Status(15002);
    pub const EVT_CHANNEL_NOT_FOUND: Status = Status(15007);
    pub const EVT_QUERY_RESULT_INVALID_POSITION: Status = Status(15012);
    pub const EVT_MESSAGE_NOT_FOUND: Status = Status(15027);
    pub const EVT_MESSAGE_ID_NOT_FOUND: Status = Status(15028);

    /// The raw numeric code
    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether this status means an allocation failed somewhere below us
    pub fn is_out_of_memory(self) -> bool {
        self == Self::NOT_ENOUGH_MEMORY || self == Self::OUTOFMEMORY
    }

    /// Symbolic name for well-known codes
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "ERROR_SUCCESS",
            Self::ACCESS_DENIED => "ERROR_ACCESS_DENIED",
            Self::INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            Self::NOT_ENOUGH_MEMORY => "ERROR_NOT_ENOUGH_MEMORY",
            Self::OUTOFMEMORY => "ERROR_OUTOFMEMORY",
            Self::INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            Self::INSUFFICIENT_BUFFER => "ERROR_INSUFFICIENT_BUFFER",
            Self::NOT_FOUND => "ERROR_NOT_FOUND",
            Self::CANCELLED => "ERROR_CANCELLED",
            Self::XML_PARSE_ERROR => "ERROR_XML_PARSE_ERROR",
            Self::EVT_INVALID_CHANNEL_PATH => "ERROR_EVT_INVALID_CHANNEL_PATH",
            Self::EVT_INVALID_QUERY => "ERROR_EVT_INVALID_QUERY",
            Self::EVT_PUBLISHER_METADATA_NOT_FOUND => "ERROR_EVT_PUBLISHER_METADATA_NOT_FOUND",
            Self::EVT_CHANNEL_NOT_FOUND => "ERROR_EVT_CHANNEL_NOT_FOUND",
            Self::EVT_QUERY_RESULT_INVALID_POSITION => "ERROR_EVT_QUERY_RESULT_INVALID_POSITION",
            Self::EVT_MESSAGE_NOT_FOUND => "ERROR_EVT_MESSAGE_NOT_FOUND",
            Self::EVT_MESSAGE_ID_NOT_FOUND => "ERROR_EVT_MESSAGE_ID_NOT_FOUND",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl std::error::Error for Status {}

impl From<u32> for Status {
    fn from(code: u32) -> Self {
        Status(code)
    }
}

/// Errors related to native handle ownership
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("{kind} handle {raw} is already closed")]
    AlreadyClosed { kind: HandleKind, raw: u64 },

    #[error("Expected a {expected} handle, got {actual}")]
    WrongKind {
        expected: HandleKind,
        actual: HandleKind,
    },

    #[error("{op} failed: {status}")]
    Native { op: &'static str, status: Status },
}

impl HandleError {
    pub fn native(op: &'static str, status: Status) -> Self {
        Self::Native { op, status }
    }
}

/// Errors raised while decoding a rendered value set
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Field index {index} is out of range for {count} values")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Field holds {actual}, not {expected}")]
    TypeMismatch {
        expected: VariantKind,
        actual: VariantKind,
    },

    #[error("Field of type {kind} is {}", shape_name(.array))]
    ShapeMismatch { kind: VariantKind, array: bool },

    #[error("Text conversion failed: {0}")]
    EncodingError(String),

    #[error("Malformed value buffer: {0}")]
    Malformed(String),

    #[error("Unknown variant type code {0}")]
    UnknownKind(u32),
}

impl DecodeError {
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::EncodingError(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

fn shape_name(array: &bool) -> &'static str {
    if *array { "an array" } else { "a scalar" }
}

/// Errors raised by the bookmark document codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookmarkXmlError {
    #[error("Bookmark XML does not parse: {0}")]
    Syntax(String),

    #[error("Bookmark XML has unexpected structure: {0}")]
    Structure(String),
}

impl BookmarkXmlError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        Self::Structure(msg.into())
    }
}

/// Result type for handle operations
pub type HandleResult<T> = Result<T, HandleError>;

/// Result type for decoding operations
pub type DecodeResult<T> = Result<T, DecodeError>;
