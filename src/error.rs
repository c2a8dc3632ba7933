// ⚠️ Error taxonomy for the ingestion pipeline
//
// Row-level parse errors are recovered where they happen. Everything else
// escalates to the item (one list, one race) and is recorded in the run
// summary. Only storage errors stop a run.

use std::fmt;
use thiserror::Error;

/// A malformed row or document.
///
/// `line` is the 1-based source line when the failure belongs to a single row,
/// `None` when the whole document is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: Option<u64>,
    pub message: String,
}

impl ParseError {
    pub fn row(line: u64, message: impl Into<String>) -> Self {
        ParseError {
            line: Some(line),
            message: message.into(),
        }
    }

    pub fn document(message: impl Into<String>) -> Self {
        ParseError {
            line: None,
            message: message.into(),
        }
    }

    pub fn is_row_level(&self) -> bool {
        self.line.is_some()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Remote source unreachable, timed out, or answered with a non-success status
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// Cached artifact unreadable or unparsable
    #[error("cache artifact {key} is corrupted: {reason}")]
    CacheCorrupted { key: String, reason: String },

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Same external id presented with a different immutable attribute
    #[error(
        "identity conflict for {namespace}:{external_id}: {field} is {stored}, upstream says {received}"
    )]
    IdentityConflict {
        namespace: String,
        external_id: String,
        field: String,
        stored: String,
        received: String,
    },

    /// Recognized event shape that this pipeline does not ingest (team, parallel, ...)
    #[error("unsupported event format: {0}")]
    UnsupportedFormat(String),

    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),
}

impl IngestError {
    pub fn fetch(url: &str, reason: impl fmt::Display) -> Self {
        IngestError::FetchFailed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that make every remaining item fail too.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Storage(_))
    }

    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, IngestError::IdentityConflict { .. })
    }

    /// Short category label used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::FetchFailed { .. } => "FetchFailed",
            IngestError::CacheCorrupted { .. } => "CacheCorrupted",
            IngestError::Parse(_) => "ParseError",
            IngestError::IdentityConflict { .. } => "IdentityConflictError",
            IngestError::UnsupportedFormat(_) => "UnsupportedFormat",
            IngestError::Storage(_) => "StorageError",
            IngestError::CacheIo(_) => "CacheIoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
