//! Typed error hierarchy for audiodock
//!
//! Resolution and transfer failures are usually not surfaced through
//! `Result` at all: the download manager converts them into persisted
//! failure records plus events, so a caller that fired-and-forgot can
//! still find out later. The variants here cover the synchronous paths
//! and the payloads those records are built from.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::TrackId;

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The link resolver could not produce a playable URL. No transfer
    /// was ever started.
    #[error("failed to resolve {track_id}: {message}")]
    Resolution { track_id: TrackId, message: String },

    /// Network or I/O failure while a transfer was in flight.
    #[error("transfer failed: {message}")]
    Transfer { message: String, retryable: bool },

    /// The downloaded artifact did not pass validation (too small to be
    /// real audio). Treated identically to a transfer failure downstream.
    #[error("artifact rejected: {message}")]
    Validation { message: String },

    /// Disk write/rename or persistence failure.
    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Operation referenced a track or playlist entry with no matching
    /// record. Used defensively, not thrown across the public API.
    #[error("not found: {0}")]
    NotFound(String),

    /// The owning component was dropped while work was in flight.
    #[error("component is shutting down")]
    Shutdown,
}

impl Error {
    /// Create a transfer error, classifying retryability from the message
    /// source when known.
    pub fn transfer(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transfer {
            message: message.into(),
            retryable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn resolution(track_id: TrackId, message: impl Into<String>) -> Self {
        Self::Resolution {
            track_id,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { retryable, .. } => *retryable,
            Self::Resolution { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect();
        Self::Transfer {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: format!("JSON error: {}", err),
        }
    }
}
