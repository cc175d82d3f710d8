//! Typed event bus
//!
//! A single broadcast channel connects the download manager and the
//! playlist engine to external observers without either side holding a
//! reference to the other. Subscribers receive strongly-typed payloads;
//! a slow subscriber only lags itself.
//!
//! Playlist mutation events carry no diff; consumers re-fetch current
//! state from the engine instead of applying a delta.

use tokio::sync::broadcast;

use crate::download::records::DownloadRecord;
use crate::playlist::RepeatMode;
use crate::types::{InstanceId, TrackId};

/// Events published for external consumption.
#[derive(Debug, Clone)]
pub enum Event {
    /// A download task was registered. Emitted before any network
    /// activity so observers can show a placeholder while the source URL
    /// is still being resolved.
    DownloadTaskCreated { track_id: TrackId, title: String },

    /// Normalized progress for an in-flight transfer, in `[0, 1]`.
    /// Non-decreasing per track; no ordering across tracks.
    DownloadProgressUpdated {
        track_id: TrackId,
        progress: f64,
        title: String,
    },

    /// A transfer finished and its artifact passed validation.
    DownloadCompleted { record: DownloadRecord },

    /// A download terminated with an error (resolution, transfer, or
    /// validation). A failure record has already been persisted.
    DownloadFailed { track_id: TrackId, error: String },

    /// The number of tracks currently transferring changed.
    ActiveDownloadCountChanged { count: usize },

    /// The queue contents changed in some way; re-fetch the items.
    PlaylistUpdated,

    /// The current queue position changed.
    CurrentTrackChanged,

    /// Repeat or shuffle mode changed.
    PlayModeChanged {
        repeat_mode: RepeatMode,
        shuffle_enabled: bool,
    },

    /// Feed for a now-playing surface: title/artist immediately, artwork
    /// later once fetched. The artist field carries a placeholder while a
    /// pending item resolves.
    NowPlayingChanged {
        title: String,
        artist: String,
        artwork: Option<Vec<u8>>,
    },

    /// A pending queue entry could not be resolved and was removed.
    PendingResolutionFailed {
        instance_id: InstanceId,
        title: String,
        error: String,
    },
}

/// In-process publish/subscribe channel for [`Event`].
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
