//! In-memory download task registry
//!
//! Tracks every live task from registration to its terminal transition.
//! Nothing here survives a restart except implicitly through resume
//! tokens persisted elsewhere. The registry owns all state-transition
//! bookkeeping so that `is_downloading` is strictly accurate: a track id
//! is in the downloading set exactly while a transfer is in flight, and
//! every terminal transition removes it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use url::Url;

use crate::transfer::ResumeToken;
use crate::types::TrackId;
use tokio_util::sync::CancellationToken;

/// Identifying metadata supplied when a download is requested.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub track_id: TrackId,
    pub title: String,
    pub owner: String,
    pub thumbnail: Option<Url>,
}

/// Lifecycle state of an active task.
#[derive(Debug)]
pub(crate) enum TaskState {
    /// The source URL is still being resolved; no transfer exists yet.
    Parsing,
    /// A transfer is in flight.
    Downloading,
    /// The transfer was cancelled with resumable state captured.
    Paused(ResumeToken),
}

/// Public view of a task's state, without the resume token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Parsing,
    Downloading,
    Paused,
}

/// Read-only snapshot of an active task for observers.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub track_id: TrackId,
    pub title: String,
    pub owner: String,
    pub thumbnail: Option<Url>,
    pub status: TaskStatus,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
}

pub(crate) struct ActiveTask {
    pub request: DownloadRequest,
    pub source_url: Option<Url>,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub progress: f64,
    pub cancel: CancellationToken,
    pub pause_requested: bool,
}

/// Registry of active tasks plus the downloading id set.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: RwLock<HashMap<TrackId, ActiveTask>>,
    downloading: RwLock<HashSet<TrackId>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task in `Parsing` state. Returns false when the track
    /// already has an active task, leaving the existing one untouched.
    pub fn insert_parsing(&self, request: DownloadRequest) -> bool {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&request.track_id) {
            return false;
        }
        let track_id = request.track_id.clone();
        tasks.insert(
            track_id,
            ActiveTask {
                request,
                source_url: None,
                state: TaskState::Parsing,
                started_at: Utc::now(),
                progress: 0.0,
                cancel: CancellationToken::new(),
                pause_requested: false,
            },
        );
        true
    }

    pub fn contains(&self, track_id: &TrackId) -> bool {
        self.tasks.read().contains_key(track_id)
    }

    /// Transition a task into `Downloading`, wiring the live cancel
    /// token and, for a fresh start, the resolved source URL. Returns
    /// false when the task disappeared (cancelled during resolution).
    pub fn begin_transfer(
        &self,
        track_id: &TrackId,
        source_url: Option<Url>,
        cancel: CancellationToken,
    ) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(track_id) else {
            return false;
        };
        if let Some(url) = source_url {
            task.source_url = Some(url);
        }
        task.state = TaskState::Downloading;
        task.cancel = cancel;
        task.pause_requested = false;
        drop(tasks);

        self.downloading.write().insert(track_id.clone());
        true
    }

    pub fn set_progress(&self, track_id: &TrackId, progress: f64) {
        if let Some(task) = self.tasks.write().get_mut(track_id) {
            task.progress = progress;
        }
    }

    /// Flag pause intent on a downloading task and hand back its cancel
    /// token. The caller trips the token outside the lock; the transfer
    /// worker observes the cancellation and finalizes the pause.
    pub fn request_pause(&self, track_id: &TrackId) -> Option<CancellationToken> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(track_id)?;
        if !matches!(task.state, TaskState::Downloading) {
            return None;
        }
        task.pause_requested = true;
        Some(task.cancel.clone())
    }

    pub fn pause_was_requested(&self, track_id: &TrackId) -> bool {
        self.tasks
            .read()
            .get(track_id)
            .map(|t| t.pause_requested)
            .unwrap_or(false)
    }

    /// Finalize a pause: retain the resume token and leave the
    /// downloading set while staying visible among active tasks.
    /// Returns false when the task disappeared in the meantime.
    pub fn mark_paused(&self, track_id: &TrackId, token: ResumeToken) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(track_id) else {
            return false;
        };
        task.state = TaskState::Paused(token);
        task.pause_requested = false;
        task.progress = 0.0;
        drop(tasks);

        self.downloading.write().remove(track_id);
        true
    }

    /// Take the resume token of a paused task, preparing it for a new
    /// transfer. Returns the request metadata alongside the token.
    pub fn take_resume_token(&self, track_id: &TrackId) -> Option<(DownloadRequest, ResumeToken)> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(track_id)?;
        match &task.state {
            TaskState::Paused(token) => {
                let token = token.clone();
                task.state = TaskState::Parsing;
                Some((task.request.clone(), token))
            }
            _ => None,
        }
    }

    /// Remove a task entirely (terminal transition). Returns the task
    /// and whether the downloading set changed.
    pub fn remove(&self, track_id: &TrackId) -> Option<(ActiveTask, bool)> {
        let task = self.tasks.write().remove(track_id)?;
        let was_downloading = self.downloading.write().remove(track_id);
        Some((task, was_downloading))
    }

    pub fn request_for(&self, track_id: &TrackId) -> Option<DownloadRequest> {
        self.tasks.read().get(track_id).map(|t| t.request.clone())
    }

    pub fn source_url_for(&self, track_id: &TrackId) -> Option<Url> {
        self.tasks
            .read()
            .get(track_id)
            .and_then(|t| t.source_url.clone())
    }

    /// Whether a transfer for this track is in flight right now. False
    /// while parsing or paused.
    pub fn is_downloading(&self, track_id: &TrackId) -> bool {
        self.downloading.read().contains(track_id)
    }

    pub fn downloading_count(&self) -> usize {
        self.downloading.read().len()
    }

    /// Snapshots of all active tasks, paused ones included.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .read()
            .values()
            .map(|task| TaskSnapshot {
                track_id: task.request.track_id.clone(),
                title: task.request.title.clone(),
                owner: task.request.owner.clone(),
                thumbnail: task.request.thumbnail.clone(),
                status: match task.state {
                    TaskState::Parsing => TaskStatus::Parsing,
                    TaskState::Downloading => TaskStatus::Downloading,
                    TaskState::Paused(_) => TaskStatus::Paused,
                },
                progress: task.progress,
                started_at: task.started_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(id: &str) -> DownloadRequest {
        DownloadRequest {
            track_id: TrackId::new(id),
            title: format!("Track {}", id),
            owner: "Channel".into(),
            thumbnail: None,
        }
    }

    fn token() -> ResumeToken {
        ResumeToken {
            url: Url::parse("https://example.com/a.m4a").unwrap(),
            part_path: PathBuf::from("/tmp/a.part"),
            bytes_written: 1024,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = TaskRegistry::new();
        assert!(registry.insert_parsing(request("v1")));
        assert!(!registry.insert_parsing(request("v1")));
    }

    #[test]
    fn parsing_tasks_are_not_downloading() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        assert!(registry.contains(&id));
        assert!(!registry.is_downloading(&id));
    }

    #[test]
    fn begin_transfer_enters_downloading_set() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        assert!(registry.begin_transfer(
            &id,
            Some(Url::parse("https://example.com/a").unwrap()),
            CancellationToken::new(),
        ));
        assert!(registry.is_downloading(&id));
        assert_eq!(registry.downloading_count(), 1);
    }

    #[test]
    fn pausing_leaves_downloading_set_but_stays_active() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        registry.begin_transfer(&id, None, CancellationToken::new());

        assert!(registry.request_pause(&id).is_some());
        assert!(registry.pause_was_requested(&id));
        assert!(registry.mark_paused(&id, token()));

        assert!(!registry.is_downloading(&id));
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, TaskStatus::Paused);
    }

    #[test]
    fn pause_of_parsing_task_is_refused() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        assert!(registry.request_pause(&id).is_none());
    }

    #[test]
    fn take_resume_token_round_trips() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        registry.begin_transfer(&id, None, CancellationToken::new());
        registry.mark_paused(&id, token());

        let (req, taken) = registry.take_resume_token(&id).unwrap();
        assert_eq!(req.track_id, id);
        assert_eq!(taken.bytes_written(), 1024);

        // Token can only be taken once.
        assert!(registry.take_resume_token(&id).is_none());
    }

    #[test]
    fn remove_clears_both_structures() {
        let registry = TaskRegistry::new();
        let id = TrackId::new("v1");
        registry.insert_parsing(request("v1"));
        registry.begin_transfer(&id, None, CancellationToken::new());

        let (_, was_downloading) = registry.remove(&id).unwrap();
        assert!(was_downloading);
        assert!(!registry.contains(&id));
        assert!(!registry.is_downloading(&id));
        assert_eq!(registry.downloading_count(), 0);
    }
}
