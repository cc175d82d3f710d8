//! Playlist subsystem
//!
//! An ordered, mutable queue of playable items. Items queued before
//! their stream URL is known sit in a pending state; resolution runs
//! concurrently with queue mutation and lands through
//! [`PlaylistEngine::resolve_pending`].

pub mod engine;

pub use engine::PlaylistEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::types::{InstanceId, TrackId};

/// Repeat behavior of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Stop at the end of the queue.
    #[default]
    Off,
    /// Wrap around at either end.
    All,
    /// Replay the current item when it finishes.
    One,
}

impl RepeatMode {
    /// The next mode in the toggle cycle Off → All → One → Off.
    pub fn cycled(self) -> Self {
        match self {
            Self::Off => Self::All,
            Self::All => Self::One,
            Self::One => Self::Off,
        }
    }
}

/// One entry in the queue.
///
/// Once `pending` is false, exactly one of `file_name` and `stream_url`
/// is set. The file name is stored relative to the download directory
/// and resolved to a full path at read time; a local file always wins
/// over a remote URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: InstanceId,
    pub track_id: TrackId,
    pub title: String,
    pub artist: String,
    pub thumbnail: Option<Url>,
    /// Local file name under the download directory, if downloaded.
    pub file_name: Option<String>,
    /// Remote stream URL, if streamed.
    pub stream_url: Option<Url>,
    pub added_at: DateTime<Utc>,
    /// True until a resolver supplies a playable URL.
    #[serde(default)]
    pub pending: bool,
}

impl PlaylistItem {
    /// The URL playback should use, local file taking precedence.
    /// `None` while the item is pending.
    pub fn playable_url(&self, base: &Path) -> Option<Url> {
        if self.pending {
            return None;
        }
        if let Some(name) = &self.file_name {
            let path = base.join(name);
            let absolute = if path.is_absolute() {
                path
            } else {
                std::env::current_dir().ok()?.join(path)
            };
            Url::from_file_path(absolute).ok()
        } else {
            self.stream_url.clone()
        }
    }
}

/// Persisted playlist document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistDoc {
    #[serde(default = "crate::download::records::doc_version")]
    pub version: u32,
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
    #[serde(default)]
    pub current_index: Option<usize>,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
    #[serde(default)]
    pub shuffle_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(file_name: Option<&str>, stream_url: Option<&str>, pending: bool) -> PlaylistItem {
        PlaylistItem {
            id: InstanceId::new(),
            track_id: TrackId::new("v1"),
            title: "Song".into(),
            artist: "Artist".into(),
            thumbnail: None,
            file_name: file_name.map(|s| s.to_string()),
            stream_url: stream_url.map(|s| Url::parse(s).unwrap()),
            added_at: Utc::now(),
            pending,
        }
    }

    #[test]
    fn repeat_mode_cycles() {
        assert_eq!(RepeatMode::Off.cycled(), RepeatMode::All);
        assert_eq!(RepeatMode::All.cycled(), RepeatMode::One);
        assert_eq!(RepeatMode::One.cycled(), RepeatMode::Off);
    }

    #[test]
    fn pending_item_has_no_playable_url() {
        let item = item(None, None, true);
        assert!(item.playable_url(Path::new("/music")).is_none());
    }

    #[test]
    fn local_file_takes_precedence() {
        let item = item(Some("a.m4a"), Some("https://example.com/a"), false);
        let url = item.playable_url(Path::new("/music")).unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/music/a.m4a"));
    }

    #[test]
    fn remote_item_uses_stream_url() {
        let item = item(None, Some("https://example.com/a.m4a"), false);
        let url = item.playable_url(Path::new("/music")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a.m4a");
    }

    #[test]
    fn playlist_doc_tolerates_old_documents() {
        let doc: PlaylistDoc = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.repeat_mode, RepeatMode::Off);
        assert!(doc.current_index.is_none());
    }
}
