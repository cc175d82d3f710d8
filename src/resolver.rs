//! Link resolution seam
//!
//! Given a stable track identifier, a resolver produces a transfer URL.
//! Resolution is an external, possibly slow network call; both the
//! download manager and the playlist engine treat it as asynchronous and
//! show placeholders while it runs. Resolved streaming URLs are
//! typically time-limited, which is why retries re-resolve instead of
//! reusing a stored URL.

use async_trait::async_trait;
use url::Url;

use crate::error::Result;
use crate::types::TrackId;

/// Maps a track identifier to a playable/transferable URL.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Resolve `track_id` to a stream URL.
    ///
    /// Fails with [`Error::Resolution`](crate::Error::Resolution) when no
    /// playable stream exists.
    async fn resolve(&self, track_id: &TrackId) -> Result<Url>;
}
