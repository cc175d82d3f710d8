//! Durable download records
//!
//! Two record types outlive the process: completed-download metadata and
//! failed-download records. Both store file names rather than absolute
//! paths: the base directory can move between launches (sandboxed
//! platforms reassign it), so the full path is recomputed at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use url::Url;

use crate::error::{Error, Result};
use crate::types::TrackId;

/// Metadata for a completed download.
///
/// Only valid while its file exists on disk and exceeds the configured
/// minimum size; records failing that are purged on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub track_id: TrackId,
    pub title: String,
    /// Channel/uploader label shown alongside the title.
    pub owner: String,
    /// File name under the download directory. Never an absolute path.
    pub file_name: String,
    pub downloaded_at: DateTime<Utc>,
    pub thumbnail: Option<Url>,
    /// Original source URL, retained so a re-download can validate it
    /// before falling back to re-resolution.
    pub source_url: Option<Url>,
}

impl DownloadRecord {
    /// Recompute the absolute file path against the current base dir.
    pub fn file_path(&self, base: &Path) -> PathBuf {
        base.join(&self.file_name)
    }
}

/// Record of a download that terminated with an error.
///
/// Created when a transfer or resolution fails; removed when a retry is
/// initiated or the user dismisses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDownload {
    pub track_id: TrackId,
    pub title: String,
    pub owner: String,
    pub thumbnail: Option<Url>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Persisted document wrapping the completed-download list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsDoc {
    #[serde(default = "doc_version")]
    pub version: u32,
    #[serde(default)]
    pub records: Vec<DownloadRecord>,
}

/// Persisted document wrapping the failed-download list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedDoc {
    #[serde(default = "doc_version")]
    pub version: u32,
    #[serde(default)]
    pub records: Vec<FailedDownload>,
}

pub(crate) fn doc_version() -> u32 {
    1
}

/// Turn a display title into a file name safe for the download dir.
///
/// Reserved characters collapse to `-`; the result must not escape the
/// directory it is joined onto.
pub fn sanitize_file_name(title: &str) -> Result<String> {
    const INVALID: &[char] = &[':', '/', '\\', '?', '%', '*', '|', '"', '<', '>'];

    let cleaned: String = title
        .chars()
        .map(|c| if INVALID.contains(&c) { '-' } else { c })
        .collect();
    let cleaned = cleaned.trim().to_string();

    if cleaned.is_empty() {
        return Err(Error::validation("title sanitizes to an empty file name"));
    }

    for component in Path::new(&cleaned).components() {
        match component {
            Component::ParentDir => {
                return Err(Error::storage(
                    &cleaned,
                    "file name contains parent directory reference",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::storage(&cleaned, "file name is an absolute path"));
            }
            _ => {}
        }
    }

    Ok(cleaned)
}
