//! Playback driver seam
//!
//! The playlist engine never touches audio itself; it drives an injected
//! [`PlaybackDriver`] and reacts to [`PlaybackSignal`]s the driver pushes
//! into a broadcast channel. Explicit signal types replace key-path
//! observation on a platform player: subscribers get typed transitions
//! instead of stringly-typed state.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::Result;

/// Controls the audio output device.
#[async_trait]
pub trait PlaybackDriver: Send + Sync {
    /// Load a track for playback. The URL is either a local file URL or
    /// a remote stream URL.
    async fn load(&self, url: &Url) -> Result<()>;

    /// Start or continue playback of the loaded track.
    async fn play(&self) -> Result<()>;

    /// Pause playback, retaining position.
    async fn pause(&self) -> Result<()>;

    /// Seek to a position within the loaded track.
    async fn seek(&self, position: Duration) -> Result<()>;
}

/// State transitions pushed by the playback driver.
#[derive(Debug, Clone)]
pub enum PlaybackSignal {
    /// Periodic position update for the loaded track.
    TimeUpdated {
        position: Duration,
        duration: Duration,
    },
    /// The loaded track played to its end.
    Finished,
}
