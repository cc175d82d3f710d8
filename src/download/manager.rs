//! Download manager
//!
//! Coordinates concurrent remote-audio downloads through their whole
//! lifecycle: resolve the source URL, drive the transfer executor,
//! validate the artifact, move it into the library, and keep the
//! durable record lists in sync. All public operations return
//! immediately; outcomes flow through the event bus and an optional
//! completion continuation.
//!
//! Two invariants hold at all times: at most one active task per track
//! id, and a track id is never simultaneously in the completed records
//! and the active set.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::download::records::{
    sanitize_file_name, DownloadRecord, FailedDoc, FailedDownload, RecordsDoc,
};
use crate::download::registry::{DownloadRequest, TaskRegistry, TaskSnapshot};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::resolver::LinkResolver;
use crate::store::{JsonStore, DOWNLOADS_DOC, FAILED_DOC};
use crate::transfer::{ProgressFn, TransferExecutor, TransferOutcome};
use crate::types::TrackId;

/// Completion continuation for a directly requested download.
///
/// Invoked exactly once with the terminal outcome. The durable failure
/// record is written regardless of whether anyone is still listening.
pub type OnComplete = Box<dyn FnOnce(Result<DownloadRecord>) + Send + 'static>;

/// Background coordinator for remote-audio downloads.
pub struct DownloadManager {
    self_ref: Weak<Self>,
    config: Config,
    registry: TaskRegistry,
    records: RwLock<Vec<DownloadRecord>>,
    failed: RwLock<Vec<FailedDownload>>,
    resolver: Arc<dyn LinkResolver>,
    transfer: Arc<dyn TransferExecutor>,
    store: Arc<JsonStore>,
    events: EventBus,
}

impl DownloadManager {
    /// Obtain a strong `Arc<Self>` for spawning background workers.
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(Error::Shutdown)
    }

    /// Create a manager, loading persisted record lists and reconciling
    /// them against on-disk truth.
    pub async fn new(
        config: Config,
        resolver: Arc<dyn LinkResolver>,
        transfer: Arc<dyn TransferExecutor>,
        store: Arc<JsonStore>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let records = Self::load_and_reconcile_records(&config, &store).await;
        let failed = store
            .load::<FailedDoc>(FAILED_DOC)
            .await
            .map(|doc| doc.records)
            .unwrap_or_default();

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            registry: TaskRegistry::new(),
            records: RwLock::new(records),
            failed: RwLock::new(failed),
            resolver,
            transfer,
            store,
            events,
        }))
    }

    /// Load completed records, dropping any whose file is missing or
    /// smaller than the configured floor. Runt files are corrupt leftovers
    /// and get deleted along with their records.
    async fn load_and_reconcile_records(config: &Config, store: &JsonStore) -> Vec<DownloadRecord> {
        let loaded = store
            .load::<RecordsDoc>(DOWNLOADS_DOC)
            .await
            .map(|doc| doc.records)
            .unwrap_or_default();
        let original = loaded.len();

        let mut valid = Vec::with_capacity(loaded.len());
        for record in loaded {
            let path = record.file_path(&config.download_dir);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() >= config.min_artifact_size => valid.push(record),
                Ok(meta) => {
                    tracing::warn!(
                        "purging {} ({} bytes on disk, below {} byte floor)",
                        record.track_id,
                        meta.len(),
                        config.min_artifact_size
                    );
                    tokio::fs::remove_file(&path).await.ok();
                }
                Err(_) => {
                    tracing::warn!("purging {}: file missing at {}", record.track_id, path.display());
                }
            }
        }

        if valid.len() < original {
            let doc = RecordsDoc {
                version: 1,
                records: valid.clone(),
            };
            if let Err(e) = store.save(DOWNLOADS_DOC, &doc).await {
                tracing::warn!("failed to persist reconciled records: {}", e);
            }
            tracing::info!("restored {} download records ({} purged)", valid.len(), original - valid.len());
        }

        valid
    }

    /// Subscribe to the event bus this manager publishes into.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Request a download.
    ///
    /// No-op when the track is already downloaded or already has an
    /// active task. Otherwise registers the task in `Parsing` state and
    /// emits `DownloadTaskCreated` before any network activity, then
    /// resolves the source URL and drives the transfer in the
    /// background.
    pub fn start(&self, request: DownloadRequest, on_complete: Option<OnComplete>) -> Result<()> {
        if self.is_downloaded(&request.track_id).is_some() {
            tracing::info!("{} already downloaded, ignoring start", request.track_id);
            return Ok(());
        }
        if !self.registry.insert_parsing(request.clone()) {
            tracing::info!("{} already has an active task, ignoring start", request.track_id);
            return Ok(());
        }

        self.events.publish(Event::DownloadTaskCreated {
            track_id: request.track_id.clone(),
            title: request.title.clone(),
        });

        // A fresh attempt supersedes any stale failure for this track.
        self.drop_failed_record(&request.track_id);

        let engine = self.arc()?;
        tokio::spawn(async move {
            engine.run_download(request, None, on_complete).await;
        });
        Ok(())
    }

    /// Pause an in-flight download, attempting to capture resumable
    /// state. When the transfer cannot yield a resume token the pause
    /// degrades to a cancel. Pausing a task that is only parsing, or
    /// that raced to a terminal state, is a logged no-op.
    pub fn pause(&self, track_id: &TrackId) {
        match self.registry.request_pause(track_id) {
            Some(cancel) => cancel.cancel(),
            None => tracing::warn!("no downloadable task to pause for {}", track_id),
        }
    }

    /// Resume a paused download from its retained token, wiring
    /// progress and completion identically to `start`.
    pub fn resume(&self, track_id: &TrackId, on_complete: Option<OnComplete>) -> Result<()> {
        let Some((request, token)) = self.registry.take_resume_token(track_id) else {
            tracing::warn!("no paused task to resume for {}", track_id);
            return Ok(());
        };

        let cancel = CancellationToken::new();
        self.registry.begin_transfer(track_id, None, cancel.clone());
        self.publish_downloading_count();

        let engine = self.arc()?;
        tokio::spawn(async move {
            let progress = engine.progress_fn(&request);
            let outcome = engine.transfer.resume(token, progress, cancel).await;
            engine.handle_outcome(request, outcome, on_complete).await;
        });
        Ok(())
    }

    /// Cancel a download in any active state. Discards partial
    /// artifacts and resume tokens; never creates a failure record.
    pub fn cancel(&self, track_id: &TrackId) {
        let Some((task, was_downloading)) = self.registry.remove(track_id) else {
            tracing::warn!("no active task to cancel for {}", track_id);
            return;
        };

        task.cancel.cancel();
        if let crate::download::registry::TaskState::Paused(token) = task.state {
            let part = token.part_path().clone();
            tokio::spawn(async move {
                tokio::fs::remove_file(&part).await.ok();
            });
        }

        if was_downloading {
            self.publish_downloading_count();
        }
        tracing::info!("cancelled download of {}", track_id);
    }

    /// Retry a failed download. The stale failure record is dropped as
    /// the new attempt registers, and the source URL is re-resolved
    /// because previously resolved stream URLs expire.
    pub fn retry_failed(&self, failed: &FailedDownload, on_complete: Option<OnComplete>) -> Result<()> {
        self.start(
            DownloadRequest {
                track_id: failed.track_id.clone(),
                title: failed.title.clone(),
                owner: failed.owner.clone(),
                thumbnail: failed.thumbnail.clone(),
            },
            on_complete,
        )
    }

    /// Download a previously completed track again, e.g. after its file
    /// was lost. Tries the stored source URL first (one HEAD probe) and
    /// falls back to re-resolution when it no longer serves content.
    pub fn redownload(&self, record: &DownloadRecord, on_complete: Option<OnComplete>) -> Result<()> {
        let request = DownloadRequest {
            track_id: record.track_id.clone(),
            title: record.title.clone(),
            owner: record.owner.clone(),
            thumbnail: record.thumbnail.clone(),
        };
        if !self.registry.insert_parsing(request.clone()) {
            tracing::info!("{} already has an active task, ignoring redownload", request.track_id);
            return Ok(());
        }

        self.events.publish(Event::DownloadTaskCreated {
            track_id: request.track_id.clone(),
            title: request.title.clone(),
        });

        let preferred = record.source_url.clone();
        let engine = self.arc()?;
        tokio::spawn(async move {
            engine.run_download(request, preferred, on_complete).await;
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Completed record for a track, if one exists.
    pub fn is_downloaded(&self, track_id: &TrackId) -> Option<DownloadRecord> {
        self.records
            .read()
            .iter()
            .find(|r| &r.track_id == track_id)
            .cloned()
    }

    /// Whether a transfer for this track is in flight right now.
    pub fn is_downloading(&self, track_id: &TrackId) -> bool {
        self.registry.is_downloading(track_id)
    }

    /// All completed records.
    pub fn records(&self) -> Vec<DownloadRecord> {
        self.records.read().clone()
    }

    /// All failure records.
    pub fn failed_downloads(&self) -> Vec<FailedDownload> {
        self.failed.read().clone()
    }

    /// Snapshots of all active tasks, paused ones included.
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.snapshots()
    }

    /// Number of transfers currently in flight.
    pub fn downloading_count(&self) -> usize {
        self.registry.downloading_count()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Delete a completed download: the file and its record.
    pub async fn delete_record(&self, track_id: &TrackId) -> Result<()> {
        let record = self
            .is_downloaded(track_id)
            .ok_or_else(|| Error::NotFound(track_id.to_string()))?;

        let path = record.file_path(&self.config.download_dir);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::storage(&path, format!("failed to delete: {}", e))),
        }

        self.records.write().retain(|r| &r.track_id != track_id);
        self.persist_records().await;
        Ok(())
    }

    /// Dismiss one failure record.
    pub async fn remove_failed(&self, track_id: &TrackId) {
        self.failed.write().retain(|r| &r.track_id != track_id);
        self.persist_failed().await;
    }

    /// Dismiss all failure records.
    pub async fn clear_failed(&self) {
        self.failed.write().clear();
        self.persist_failed().await;
    }

    /// Delete every completed download and its metadata.
    pub async fn clear_completed(&self) -> Result<()> {
        let records = self.records();
        for record in &records {
            let path = record.file_path(&self.config.download_dir);
            tokio::fs::remove_file(&path).await.ok();
        }
        self.records.write().clear();
        self.store.remove(DOWNLOADS_DOC).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Resolve the source URL (or validate a preferred one) and drive
    /// the transfer to a terminal state.
    async fn run_download(
        &self,
        request: DownloadRequest,
        preferred_url: Option<Url>,
        on_complete: Option<OnComplete>,
    ) {
        let url = match self.pick_source_url(&request, preferred_url).await {
            Ok(url) => url,
            Err(e) => {
                // Resolution failed before any transfer existed.
                self.finish_failure(&request, e, on_complete).await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        if !self
            .registry
            .begin_transfer(&request.track_id, Some(url.clone()), cancel.clone())
        {
            // Cancelled while the URL was still resolving.
            tracing::debug!("{} vanished during resolution", request.track_id);
            return;
        }
        self.publish_downloading_count();

        let progress = self.progress_fn(&request);
        let outcome = self.transfer.begin(&url, progress, cancel).await;
        self.handle_outcome(request, outcome, on_complete).await;
    }

    async fn pick_source_url(
        &self,
        request: &DownloadRequest,
        preferred: Option<Url>,
    ) -> Result<Url> {
        if let Some(url) = preferred {
            if self.transfer.probe(&url).await.unwrap_or(false) {
                return Ok(url);
            }
            tracing::debug!("stored URL for {} expired, re-resolving", request.track_id);
        }
        self.resolver.resolve(&request.track_id).await
    }

    /// Per-chunk progress callback translating byte counts into
    /// normalized `[0, 1]` events.
    fn progress_fn(&self, request: &DownloadRequest) -> ProgressFn {
        let Ok(engine) = self.arc() else {
            return Box::new(|_, _| {});
        };
        let track_id = request.track_id.clone();
        let title = request.title.clone();
        Box::new(move |written, total| {
            let progress = match total {
                Some(total) if total > 0 => (written as f64 / total as f64).clamp(0.0, 1.0),
                _ => 0.0,
            };
            engine.registry.set_progress(&track_id, progress);
            engine.events.publish(Event::DownloadProgressUpdated {
                track_id: track_id.clone(),
                progress,
                title: title.clone(),
            });
        })
    }

    /// React to how the transfer ended.
    ///
    /// Pause racing a terminal event resolves to whichever the registry
    /// observes first: a completion or failure that lands before the
    /// cancellation takes effect wins, and the pause becomes a no-op.
    async fn handle_outcome(
        &self,
        request: DownloadRequest,
        outcome: Result<TransferOutcome>,
        on_complete: Option<OnComplete>,
    ) {
        match outcome {
            Ok(TransferOutcome::Completed { artifact }) => {
                self.finish_completed(request, artifact, on_complete).await;
            }
            Ok(TransferOutcome::Cancelled { resume }) => {
                if self.registry.pause_was_requested(&request.track_id) {
                    match resume {
                        Some(token) => {
                            if self.registry.mark_paused(&request.track_id, token) {
                                self.publish_downloading_count();
                                tracing::info!("paused download of {}", request.track_id);
                            }
                        }
                        None => {
                            // No resumable state: the pause degrades to a cancel.
                            tracing::warn!(
                                "transfer for {} yielded no resume data, dropping task",
                                request.track_id
                            );
                            if let Some((_, was_downloading)) =
                                self.registry.remove(&request.track_id)
                            {
                                if was_downloading {
                                    self.publish_downloading_count();
                                }
                            }
                        }
                    }
                } else if let Some(token) = resume {
                    // User-initiated cancel: discard the partial artifact.
                    tokio::fs::remove_file(token.part_path()).await.ok();
                }
            }
            Err(e) => {
                self.finish_failure(&request, e, on_complete).await;
            }
        }
    }

    /// Validate the finished artifact and move it into the library.
    async fn finish_completed(
        &self,
        request: DownloadRequest,
        artifact: std::path::PathBuf,
        on_complete: Option<OnComplete>,
    ) {
        if !self.registry.contains(&request.track_id) {
            // A cancel won the race against the finishing transfer.
            tracing::debug!("{} was cancelled, discarding finished artifact", request.track_id);
            tokio::fs::remove_file(&artifact).await.ok();
            return;
        }

        let size = tokio::fs::metadata(&artifact)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size < self.config.min_artifact_size {
            tokio::fs::remove_file(&artifact).await.ok();
            let error = Error::validation(format!(
                "downloaded artifact is {} bytes, below the {} byte minimum",
                size, self.config.min_artifact_size
            ));
            self.finish_failure(&request, error, on_complete).await;
            return;
        }

        match self.install_artifact(&request, &artifact).await {
            Ok(record) => {
                {
                    let mut records = self.records.write();
                    records.retain(|r| r.track_id != record.track_id);
                    records.push(record.clone());
                }
                self.persist_records().await;

                if let Some((_, was_downloading)) = self.registry.remove(&request.track_id) {
                    if was_downloading {
                        self.publish_downloading_count();
                    }
                }
                self.events.publish(Event::DownloadCompleted {
                    record: record.clone(),
                });
                tracing::info!("completed download of {} ({} bytes)", request.track_id, size);

                if let Some(hook) = on_complete {
                    hook(Ok(record));
                }
            }
            Err(e) => {
                tokio::fs::remove_file(&artifact).await.ok();
                self.finish_failure(&request, e, on_complete).await;
            }
        }
    }

    /// Move the validated artifact to its destination, atomically
    /// replacing any previous file, and build the durable record.
    async fn install_artifact(
        &self,
        request: &DownloadRequest,
        artifact: &std::path::Path,
    ) -> Result<DownloadRecord> {
        let file_name = format!("{}.m4a", sanitize_file_name(&request.title)?);
        let dest = self.config.download_dir.join(&file_name);

        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| {
                Error::storage(
                    &self.config.download_dir,
                    format!("failed to create download dir: {}", e),
                )
            })?;

        match tokio::fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::storage(
                    &dest,
                    format!("failed to replace existing file: {}", e),
                ))
            }
        }
        tokio::fs::rename(artifact, &dest)
            .await
            .map_err(|e| Error::storage(&dest, format!("failed to move artifact: {}", e)))?;

        Ok(DownloadRecord {
            track_id: request.track_id.clone(),
            title: request.title.clone(),
            owner: request.owner.clone(),
            file_name,
            downloaded_at: chrono::Utc::now(),
            thumbnail: request.thumbnail.clone(),
            source_url: self.registry.source_url_for(&request.track_id),
        })
    }

    /// Terminal failure: persist a failure record, emit the event, drop
    /// the task, and tell the continuation.
    async fn finish_failure(
        &self,
        request: &DownloadRequest,
        error: Error,
        on_complete: Option<OnComplete>,
    ) {
        let Some((_, was_downloading)) = self.registry.remove(&request.track_id) else {
            // A cancel won the race; user-initiated cancels leave no
            // failure record behind.
            tracing::debug!("{} was cancelled, dropping late error", request.track_id);
            return;
        };
        if was_downloading {
            self.publish_downloading_count();
        }

        let message = error.to_string();
        tracing::warn!("download of {} failed: {}", request.track_id, message);

        {
            let mut failed = self.failed.write();
            failed.retain(|r| r.track_id != request.track_id);
            failed.push(FailedDownload {
                track_id: request.track_id.clone(),
                title: request.title.clone(),
                owner: request.owner.clone(),
                thumbnail: request.thumbnail.clone(),
                failed_at: chrono::Utc::now(),
                error: message.clone(),
            });
        }
        self.persist_failed().await;

        self.events.publish(Event::DownloadFailed {
            track_id: request.track_id.clone(),
            error: message,
        });

        if let Some(hook) = on_complete {
            hook(Err(error));
        }
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    /// Persist the completed-record list. Storage failures are logged
    /// and swallowed; the in-memory list stays authoritative for the
    /// session.
    async fn persist_records(&self) {
        let doc = RecordsDoc {
            version: 1,
            records: self.records.read().clone(),
        };
        if let Err(e) = self.store.save(DOWNLOADS_DOC, &doc).await {
            tracing::warn!("failed to persist download records: {}", e);
        }
    }

    async fn persist_failed(&self) {
        let doc = FailedDoc {
            version: 1,
            records: self.failed.read().clone(),
        };
        if let Err(e) = self.store.save(FAILED_DOC, &doc).await {
            tracing::warn!("failed to persist failure records: {}", e);
        }
    }

    /// Drop a stale failure record in the background.
    fn drop_failed_record(&self, track_id: &TrackId) {
        let removed = {
            let mut failed = self.failed.write();
            let before = failed.len();
            failed.retain(|r| &r.track_id != track_id);
            failed.len() != before
        };
        if !removed {
            return;
        }
        let doc = FailedDoc {
            version: 1,
            records: self.failed.read().clone(),
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.save(FAILED_DOC, &doc).await {
                tracing::warn!("failed to persist failure records: {}", e);
            }
        });
    }

    fn publish_downloading_count(&self) {
        self.events.publish(Event::ActiveDownloadCountChanged {
            count: self.registry.downloading_count(),
        });
    }
}
