//! Playlist engine
//!
//! Owns the queue, the current-position pointer, and the play modes.
//! All mutating calls return immediately: state changes happen under a
//! short lock, while playback start, thumbnail fetches, and persistence
//! run in spawned tasks. Consumers observe changes through the event
//! bus and re-fetch state rather than applying deltas.

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::playback::{PlaybackDriver, PlaybackSignal};
use crate::playlist::{PlaylistDoc, PlaylistItem, RepeatMode};
use crate::store::{JsonStore, PLAYLIST_DOC};
use crate::types::{InstanceId, TrackId};

/// Placeholder artist label shown while a pending item resolves.
const RESOLVING_LABEL: &str = "resolving link…";

struct QueueState {
    items: Vec<PlaylistItem>,
    current_index: Option<usize>,
    repeat_mode: RepeatMode,
    shuffle_enabled: bool,
    /// Indices served since the last shuffle reset. Session-only.
    shuffle_history: HashSet<usize>,
}

/// Ordered, mutable playback queue with shuffle and repeat modes.
pub struct PlaylistEngine {
    self_ref: Weak<Self>,
    state: RwLock<QueueState>,
    driver: Arc<dyn PlaybackDriver>,
    store: Arc<JsonStore>,
    events: EventBus,
    base_dir: PathBuf,
    artwork_client: reqwest::Client,
}

impl PlaylistEngine {
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(Error::Shutdown)
    }

    /// Create an engine, restoring persisted queue state. A saved
    /// current index that no longer fits the item list is dropped.
    pub async fn new(
        config: &Config,
        driver: Arc<dyn PlaybackDriver>,
        store: Arc<JsonStore>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let doc = store
            .load::<PlaylistDoc>(PLAYLIST_DOC)
            .await
            .unwrap_or_default();
        let current_index = doc
            .current_index
            .filter(|&index| index < doc.items.len());

        if !doc.items.is_empty() {
            tracing::info!(
                "restored playlist with {} items, current index {:?}",
                doc.items.len(),
                current_index
            );
        }

        let artwork_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            state: RwLock::new(QueueState {
                items: doc.items,
                current_index,
                repeat_mode: doc.repeat_mode,
                shuffle_enabled: doc.shuffle_enabled,
                shuffle_history: HashSet::new(),
            }),
            driver,
            store,
            events,
            base_dir: config.download_dir.clone(),
            artwork_client,
        }))
    }

    /// Subscribe to the event bus this engine publishes into.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Spawn a task reacting to playback driver signals (track-finished
    /// advancement). Call once from the composition root.
    pub fn attach_signals(&self, mut signals: broadcast::Receiver<PlaybackSignal>) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(PlaybackSignal::Finished) => {
                        let Some(engine) = weak.upgrade() else { break };
                        engine.on_playback_finished();
                    }
                    Ok(PlaybackSignal::TimeUpdated { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("playback signal stream lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Queue operations
    // ------------------------------------------------------------------

    /// Queue a track whose playable URL is already known (e.g. a
    /// downloaded file) right after the current item and play it.
    ///
    /// An existing entry for the same track is deduplicated first; when
    /// that entry is the current one, it is simply replayed in place.
    pub fn add_and_play(
        &self,
        track_id: TrackId,
        title: impl Into<String>,
        artist: impl Into<String>,
        thumbnail: Option<Url>,
        audio_url: Url,
    ) -> InstanceId {
        let (file_name, stream_url) = split_audio_url(&audio_url);
        let item = PlaylistItem {
            id: InstanceId::new(),
            track_id: track_id.clone(),
            title: title.into(),
            artist: artist.into(),
            thumbnail,
            file_name,
            stream_url,
            added_at: chrono::Utc::now(),
            pending: false,
        };

        let to_play = {
            let mut state = self.state.write();

            if let Some(existing) = state.items.iter().position(|i| i.track_id == track_id) {
                if state.current_index == Some(existing) {
                    // Already the current item; just restart it.
                    let current = state.items[existing].clone();
                    drop(state);
                    self.start_playback(current.clone());
                    self.events.publish(Event::CurrentTrackChanged);
                    return current.id;
                }
                remove_entry(&mut state, existing);
            }

            let id = item.id;
            insert_after_current(&mut state, item.clone());
            tracing::info!(
                "queued {} at position {:?}",
                id,
                state.current_index
            );
            item
        };

        self.persist_in_background();
        self.events.publish(Event::PlaylistUpdated);
        self.events.publish(Event::CurrentTrackChanged);
        self.start_playback(to_play.clone());
        to_play.id
    }

    /// Queue a track before its playable URL is known, right after the
    /// current item, and surface it immediately with a placeholder
    /// artist label. Returns the instance id the caller later passes to
    /// [`resolve_pending`](Self::resolve_pending).
    pub fn add_and_play_pending(
        &self,
        track_id: TrackId,
        title: impl Into<String>,
        artist: impl Into<String>,
        thumbnail: Option<Url>,
    ) -> InstanceId {
        let item = PlaylistItem {
            id: InstanceId::new(),
            track_id: track_id.clone(),
            title: title.into(),
            artist: artist.into(),
            thumbnail,
            file_name: None,
            stream_url: None,
            added_at: chrono::Utc::now(),
            pending: true,
        };

        let queued = {
            let mut state = self.state.write();

            if let Some(existing) = state.items.iter().position(|i| i.track_id == track_id) {
                if state.current_index == Some(existing) {
                    let current = state.items[existing].clone();
                    drop(state);
                    self.show_resolving_placeholder(&current);
                    self.events.publish(Event::CurrentTrackChanged);
                    return current.id;
                }
                remove_entry(&mut state, existing);
            }

            insert_after_current(&mut state, item.clone());
            item
        };

        self.persist_in_background();
        self.events.publish(Event::PlaylistUpdated);
        self.events.publish(Event::CurrentTrackChanged);
        self.show_resolving_placeholder(&queued);
        queued.id
    }

    /// Supply the resolved URL for a pending entry. Unknown instance ids
    /// are logged no-ops: the entry may have been removed while the
    /// resolver ran. Starts playback if the entry is still current.
    pub fn resolve_pending(&self, instance_id: InstanceId, audio_url: Url) {
        let to_play = {
            let mut state = self.state.write();
            let Some(index) = state.items.iter().position(|i| i.id == instance_id) else {
                tracing::warn!("no pending item {} to resolve", instance_id);
                return;
            };

            let (file_name, stream_url) = split_audio_url(&audio_url);
            let item = &mut state.items[index];
            item.file_name = file_name;
            item.stream_url = stream_url;
            item.pending = false;

            if state.current_index == Some(index) {
                Some(state.items[index].clone())
            } else {
                None
            }
        };

        self.persist_in_background();
        self.events.publish(Event::PlaylistUpdated);

        if let Some(item) = to_play {
            self.start_playback(item);
        }
    }

    /// Resolution for a pending entry failed: remove it rather than
    /// leaving an unplayable entry stuck in the queue, and tell
    /// observers why.
    pub fn fail_pending(&self, instance_id: InstanceId, error: impl Into<String>) {
        let index = {
            let state = self.state.read();
            state.items.iter().position(|i| i.id == instance_id)
        };
        let Some(index) = index else {
            tracing::warn!("no pending item {} to fail", instance_id);
            return;
        };

        let title = {
            let state = self.state.read();
            state.items[index].title.clone()
        };
        self.events.publish(Event::PendingResolutionFailed {
            instance_id,
            title,
            error: error.into(),
        });
        self.remove(index);
    }

    /// Play the item at `index`. Out-of-bounds indices are logged
    /// no-ops, since the queue can be mutated concurrently with selection.
    pub fn play(&self, index: usize) {
        let item = {
            let mut state = self.state.write();
            if index >= state.items.len() {
                tracing::warn!("play index {} out of bounds", index);
                return;
            }
            state.current_index = Some(index);
            state.items[index].clone()
        };

        self.persist_in_background();
        self.events.publish(Event::CurrentTrackChanged);

        if item.pending {
            self.show_resolving_placeholder(&item);
            return;
        }
        self.start_playback(item);
    }

    /// Advance to the next track. Returns false when the end of the
    /// queue is reached with nothing to wrap to.
    pub fn play_next(&self) -> bool {
        if self.state.read().items.is_empty() {
            return false;
        }
        if self.state.read().shuffle_enabled {
            return self.play_random_next();
        }

        let target = {
            let state = self.state.read();
            match state.current_index {
                None => Some(0),
                Some(current) => {
                    let next = current + 1;
                    if next < state.items.len() {
                        Some(next)
                    } else if state.repeat_mode == RepeatMode::All {
                        Some(0)
                    } else {
                        None
                    }
                }
            }
        };

        match target {
            Some(index) => {
                self.play(index);
                true
            }
            None => {
                tracing::debug!("end of queue reached");
                false
            }
        }
    }

    /// Step back to the previous track. With shuffle enabled this is
    /// randomized too, not a true history walk.
    pub fn play_previous(&self) -> bool {
        if self.state.read().items.is_empty() {
            return false;
        }
        if self.state.read().shuffle_enabled {
            return self.play_random_previous();
        }

        let target = {
            let state = self.state.read();
            match state.current_index {
                None => Some(state.items.len() - 1),
                Some(0) => {
                    if state.repeat_mode == RepeatMode::All {
                        Some(state.items.len() - 1)
                    } else {
                        None
                    }
                }
                Some(current) => Some(current - 1),
            }
        };

        match target {
            Some(index) => {
                self.play(index);
                true
            }
            None => {
                tracing::debug!("start of queue reached");
                false
            }
        }
    }

    /// React to the playback driver reporting the current track ended.
    pub fn on_playback_finished(&self) {
        let (repeat_mode, shuffle_enabled) = {
            let state = self.state.read();
            (state.repeat_mode, state.shuffle_enabled)
        };

        if repeat_mode == RepeatMode::One {
            self.replay_current();
            return;
        }
        if shuffle_enabled {
            self.play_random_next();
            return;
        }

        let target = {
            let state = self.state.read();
            match state.current_index {
                None => None,
                Some(current) => {
                    let next = current + 1;
                    if next < state.items.len() {
                        Some(next)
                    } else if state.repeat_mode == RepeatMode::All {
                        Some(0)
                    } else {
                        None
                    }
                }
            }
        };

        match target {
            Some(index) => self.play(index),
            None => tracing::debug!("queue finished, playback stopped"),
        }
    }

    /// Remove the item at `index`. Removing the current item stops
    /// playback and clears the pointer; removing an earlier item shifts
    /// the pointer down so it keeps naming the same logical item.
    pub fn remove(&self, index: usize) {
        let removed_current = {
            let mut state = self.state.write();
            if index >= state.items.len() {
                tracing::warn!("remove index {} out of bounds", index);
                return;
            }
            state.items.remove(index);

            match state.current_index {
                Some(current) if index < current => {
                    state.current_index = Some(current - 1);
                    false
                }
                Some(current) if index == current => {
                    state.current_index = None;
                    true
                }
                _ => false,
            }
        };

        if removed_current {
            self.stop_playback();
        }
        self.persist_in_background();
        self.events.publish(Event::PlaylistUpdated);
    }

    /// Remove an entry by its instance id.
    pub fn remove_item(&self, instance_id: InstanceId) {
        let index = {
            let state = self.state.read();
            state.items.iter().position(|i| i.id == instance_id)
        };
        match index {
            Some(index) => self.remove(index),
            None => tracing::warn!("no playlist item {} to remove", instance_id),
        }
    }

    /// Empty the queue, stopping playback if anything was current.
    pub fn clear(&self) {
        let was_playing = {
            let mut state = self.state.write();
            let was_playing = state.current_index.is_some();
            state.items.clear();
            state.current_index = None;
            state.shuffle_history.clear();
            was_playing
        };

        if was_playing {
            self.stop_playback();
        }
        self.persist_in_background();
        self.events.publish(Event::PlaylistUpdated);
    }

    /// Cycle the repeat mode Off → All → One → Off.
    pub fn toggle_repeat_mode(&self) -> RepeatMode {
        let (mode, shuffle) = {
            let mut state = self.state.write();
            state.repeat_mode = state.repeat_mode.cycled();
            (state.repeat_mode, state.shuffle_enabled)
        };
        self.persist_in_background();
        self.events.publish(Event::PlayModeChanged {
            repeat_mode: mode,
            shuffle_enabled: shuffle,
        });
        mode
    }

    /// Toggle shuffle. Turning it off clears the shuffle history.
    pub fn toggle_shuffle(&self) -> bool {
        let (mode, shuffle) = {
            let mut state = self.state.write();
            state.shuffle_enabled = !state.shuffle_enabled;
            if !state.shuffle_enabled {
                state.shuffle_history.clear();
            }
            (state.repeat_mode, state.shuffle_enabled)
        };
        self.persist_in_background();
        self.events.publish(Event::PlayModeChanged {
            repeat_mode: mode,
            shuffle_enabled: shuffle,
        });
        shuffle
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn items(&self) -> Vec<PlaylistItem> {
        self.state.read().items.clone()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.state.read().current_index
    }

    pub fn current_item(&self) -> Option<PlaylistItem> {
        let state = self.state.read();
        state
            .current_index
            .and_then(|index| state.items.get(index).cloned())
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.state.read().repeat_mode
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.state.read().shuffle_enabled
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Pick a pseudo-random index not served in the current shuffle
    /// cycle, resetting the cycle once every index has been played.
    /// With a single item, replays it.
    fn play_random_next(&self) -> bool {
        let target = {
            let mut state = self.state.write();
            let len = state.items.len();
            match len {
                0 => None,
                1 => Some(0),
                _ => {
                    if state.shuffle_history.len() >= len {
                        state.shuffle_history.clear();
                    }
                    let mut unplayed: Vec<usize> = (0..len)
                        .filter(|i| !state.shuffle_history.contains(i))
                        .collect();
                    if unplayed.is_empty() {
                        state.shuffle_history.clear();
                        unplayed = (0..len).collect();
                    }
                    let choice = unplayed.choose(&mut rand::rng()).copied();
                    if let Some(index) = choice {
                        state.shuffle_history.insert(index);
                    }
                    choice
                }
            }
        };

        match target {
            Some(index) => {
                self.play(index);
                true
            }
            None => false,
        }
    }

    /// Randomized previous: any index other than the current one.
    fn play_random_previous(&self) -> bool {
        let target = {
            let state = self.state.read();
            let len = state.items.len();
            match len {
                0 => None,
                1 => Some(0),
                _ => {
                    let candidates: Vec<usize> = (0..len)
                        .filter(|&i| state.current_index != Some(i))
                        .collect();
                    candidates.choose(&mut rand::rng()).copied()
                }
            }
        };

        match target {
            Some(index) => {
                self.play(index);
                true
            }
            None => false,
        }
    }

    /// Restart the current item without moving the pointer or emitting
    /// a track-changed event.
    fn replay_current(&self) {
        let item = self.current_item();
        match item {
            Some(item) if !item.pending => self.start_playback(item),
            Some(_) => tracing::debug!("current item still resolving, nothing to replay"),
            None => {}
        }
    }

    /// Begin playback of a resolved item in the background: load + play
    /// through the driver, then fetch the thumbnail without blocking
    /// playback start.
    fn start_playback(&self, item: PlaylistItem) {
        let Some(url) = item.playable_url(&self.base_dir) else {
            tracing::warn!("no playable URL for {}", item.title);
            return;
        };
        let Ok(engine) = self.arc() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = engine.driver.load(&url).await {
                tracing::warn!("failed to load {}: {}", item.title, e);
                return;
            }
            if let Err(e) = engine.driver.play().await {
                tracing::warn!("failed to start playback of {}: {}", item.title, e);
                return;
            }

            engine.events.publish(Event::NowPlayingChanged {
                title: item.title.clone(),
                artist: item.artist.clone(),
                artwork: None,
            });

            if let Some(thumbnail) = &item.thumbnail {
                if let Some(artwork) = engine.fetch_artwork(thumbnail).await {
                    engine.events.publish(Event::NowPlayingChanged {
                        title: item.title.clone(),
                        artist: item.artist.clone(),
                        artwork: Some(artwork),
                    });
                }
            }
        });
    }

    fn stop_playback(&self) {
        let Ok(engine) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = engine.driver.pause().await {
                tracing::warn!("failed to stop playback: {}", e);
            }
        });
    }

    fn show_resolving_placeholder(&self, item: &PlaylistItem) {
        self.events.publish(Event::NowPlayingChanged {
            title: item.title.clone(),
            artist: RESOLVING_LABEL.to_string(),
            artwork: None,
        });
    }

    async fn fetch_artwork(&self, thumbnail: &Url) -> Option<Vec<u8>> {
        if thumbnail.scheme() == "file" {
            let path = thumbnail.to_file_path().ok()?;
            return tokio::fs::read(path).await.ok();
        }

        let response = self
            .artwork_client
            .get(thumbnail.clone())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }

    fn persist_in_background(&self) {
        let doc = {
            let state = self.state.read();
            PlaylistDoc {
                version: 1,
                items: state.items.clone(),
                current_index: state.current_index,
                repeat_mode: state.repeat_mode,
                shuffle_enabled: state.shuffle_enabled,
            }
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.save(PLAYLIST_DOC, &doc).await {
                tracing::warn!("failed to persist playlist: {}", e);
            }
        });
    }
}

/// Split a playable URL into the mutually exclusive storage fields:
/// local files keep only their file name, remote URLs are stored whole.
fn split_audio_url(url: &Url) -> (Option<String>, Option<Url>) {
    if url.scheme() == "file" {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|s| s.to_string());
        (name, None)
    } else {
        (None, Some(url.clone()))
    }
}

fn insert_after_current(state: &mut QueueState, item: PlaylistItem) -> usize {
    let index = match state.current_index {
        Some(current) => current + 1,
        None => 0,
    };
    state.items.insert(index, item);
    state.current_index = Some(index);
    index
}

/// Remove the entry at `index`, shifting the pointer down when the
/// removed entry preceded it.
fn remove_entry(state: &mut QueueState, index: usize) {
    state.items.remove(index);
    if let Some(current) = state.current_index {
        if index < current {
            state.current_index = Some(current - 1);
        }
    }
}
