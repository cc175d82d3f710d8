//! Shared fakes and helpers for the integration tests.
//!
//! The three external seams (resolver, transfer executor, playback
//! driver) get scripted in-process fakes so lifecycle logic can be
//! exercised deterministically; real HTTP behavior is covered
//! separately against wiremock.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use audiodock::{
    Config, Error, Event, LinkResolver, PlaybackDriver, ProgressFn, ResumeToken, Result,
    TrackId, TransferExecutor, TransferOutcome,
};

/// Config with all paths isolated under a temp directory.
pub fn test_config(temp: &TempDir) -> Config {
    Config {
        download_dir: temp.path().join("downloads"),
        data_dir: temp.path().join("data"),
        scratch_dir: temp.path().join("scratch"),
        ..Default::default()
    }
}

/// Wait for an event matching `predicate`, draining others.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    predicate: F,
    timeout: Duration,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;
    result.unwrap_or(None)
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ----------------------------------------------------------------------
// Fake link resolver
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ResolveStep {
    Ok(Url),
    Fail(String),
}

/// Scripted resolver: consumes queued steps first, then repeats the
/// fallback behavior.
pub struct FakeResolver {
    steps: Mutex<VecDeque<ResolveStep>>,
    fallback: ResolveStep,
    pub calls: AtomicUsize,
}

impl FakeResolver {
    pub fn ok(url: Url) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: ResolveStep::Ok(url),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: ResolveStep::Fail(message.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn scripted(steps: Vec<ResolveStep>, fallback: ResolveStep) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LinkResolver for FakeResolver {
    async fn resolve(&self, track_id: &TrackId) -> Result<Url> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            ResolveStep::Ok(url) => Ok(url),
            ResolveStep::Fail(message) => Err(Error::resolution(track_id.clone(), message)),
        }
    }
}

// ----------------------------------------------------------------------
// Fake transfer executor
// ----------------------------------------------------------------------

#[derive(Clone)]
pub enum TransferScript {
    /// Write an artifact of `size` bytes and complete.
    Complete { size: u64 },
    /// Block until the gate is notified, then complete.
    CompleteAfterRelease { size: u64, gate: Arc<Notify> },
    /// Block until cancelled; yield a resume token when `resumable`.
    WaitForCancel { resumable: bool, partial: u64 },
    /// Fail with a transfer error.
    Fail { message: String },
}

/// Scripted transfer executor writing artifacts into a scratch dir.
pub struct FakeTransfer {
    dir: PathBuf,
    begin_scripts: Mutex<VecDeque<TransferScript>>,
    resume_scripts: Mutex<VecDeque<TransferScript>>,
    pub begin_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub probe_answer: Mutex<bool>,
}

/// Comfortable default: a valid artifact well above the size floor.
pub const VALID_SIZE: u64 = 200 * 1024;

impl FakeTransfer {
    pub fn new(temp: &TempDir) -> Arc<Self> {
        let dir = temp.path().join("fake-transfer");
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(Self {
            dir,
            begin_scripts: Mutex::new(VecDeque::new()),
            resume_scripts: Mutex::new(VecDeque::new()),
            begin_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            probe_answer: Mutex::new(true),
        })
    }

    pub fn script_begin(&self, script: TransferScript) {
        self.begin_scripts.lock().push_back(script);
    }

    pub fn script_resume(&self, script: TransferScript) {
        self.resume_scripts.lock().push_back(script);
    }

    pub fn set_probe_answer(&self, answer: bool) {
        *self.probe_answer.lock() = answer;
    }

    async fn write_artifact(&self, size: u64) -> PathBuf {
        let path = self.dir.join(format!("{}.part", Uuid::new_v4()));
        tokio::fs::write(&path, vec![0u8; size as usize])
            .await
            .unwrap();
        path
    }

    async fn run(
        &self,
        script: TransferScript,
        url: Url,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        match script {
            TransferScript::Complete { size } => {
                progress(size / 2, Some(size));
                progress(size, Some(size));
                let artifact = self.write_artifact(size).await;
                Ok(TransferOutcome::Completed { artifact })
            }
            TransferScript::CompleteAfterRelease { size, gate } => {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => {
                        return Ok(TransferOutcome::Cancelled { resume: None });
                    }
                }
                progress(size, Some(size));
                let artifact = self.write_artifact(size).await;
                Ok(TransferOutcome::Completed { artifact })
            }
            TransferScript::WaitForCancel { resumable, partial } => {
                progress(partial, Some(VALID_SIZE));
                cancel.cancelled().await;
                if resumable {
                    let part = self.write_artifact(partial).await;
                    Ok(TransferOutcome::Cancelled {
                        resume: Some(ResumeToken::new(url, part, partial, None, None)),
                    })
                } else {
                    Ok(TransferOutcome::Cancelled { resume: None })
                }
            }
            TransferScript::Fail { message } => Err(Error::transfer(message, true)),
        }
    }
}

#[async_trait]
impl TransferExecutor for FakeTransfer {
    async fn begin(
        &self,
        url: &Url,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .begin_scripts
            .lock()
            .pop_front()
            .unwrap_or(TransferScript::Complete { size: VALID_SIZE });
        self.run(script, url.clone(), progress, cancel).await
    }

    async fn resume(
        &self,
        token: ResumeToken,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .resume_scripts
            .lock()
            .pop_front()
            .unwrap_or(TransferScript::Complete { size: VALID_SIZE });
        self.run(script, token.url().clone(), progress, cancel).await
    }

    async fn probe(&self, _url: &Url) -> Result<bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.probe_answer.lock())
    }
}

// ----------------------------------------------------------------------
// Fake playback driver
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Load(Url),
    Play,
    Pause,
    Seek(Duration),
}

/// Playback driver recording every call it receives.
#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<DriverCall>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl PlaybackDriver for FakeDriver {
    async fn load(&self, url: &Url) -> Result<()> {
        self.calls.lock().push(DriverCall::Load(url.clone()));
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        self.calls.lock().push(DriverCall::Play);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.calls.lock().push(DriverCall::Pause);
        Ok(())
    }

    async fn seek(&self, position: Duration) -> Result<()> {
        self.calls.lock().push(DriverCall::Seek(position));
        Ok(())
    }
}
