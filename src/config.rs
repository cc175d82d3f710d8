//! Crate configuration
//!
//! One flat struct covers both subsystems. Paths are kept separate on
//! purpose: `download_dir` holds finished audio and doubles as the base
//! directory playlist items resolve their stored file names against,
//! `data_dir` holds the JSON documents, and `scratch_dir` holds partial
//! artifacts that have not passed validation yet.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Minimum plausible size for a finished audio artifact. Anything
/// smaller is treated as corrupt.
pub const MIN_ARTIFACT_SIZE: u64 = 100 * 1024;

/// Configuration for the download manager and playlist engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory finished downloads are moved into. Also the base
    /// directory that stored file names are resolved against.
    pub download_dir: PathBuf,

    /// Directory for persisted JSON documents.
    pub data_dir: PathBuf,

    /// Directory for in-flight partial artifacts.
    pub scratch_dir: PathBuf,

    /// Completed artifacts below this size are rejected as corrupt.
    pub min_artifact_size: u64,

    /// User agent sent with transfers and probes.
    pub user_agent: String,

    /// Connection timeout in seconds.
    pub connect_timeout: u64,

    /// Read timeout in seconds.
    pub read_timeout: u64,

    /// Broadcast buffer size for the event bus.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            data_dir: PathBuf::from("data"),
            scratch_dir: PathBuf::from("downloads/.incoming"),
            min_artifact_size: MIN_ARTIFACT_SIZE,
            user_agent: format!("audiodock/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: 30,
            read_timeout: 600,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(Error::storage(
                &self.download_dir,
                "download_dir must not be empty",
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::storage(&self.data_dir, "data_dir must not be empty"));
        }
        if self.scratch_dir.as_os_str().is_empty() {
            return Err(Error::storage(
                &self.scratch_dir,
                "scratch_dir must not be empty",
            ));
        }
        if self.min_artifact_size == 0 {
            return Err(Error::validation("min_artifact_size must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(Error::validation("event_capacity must be positive"));
        }
        Ok(())
    }
}
