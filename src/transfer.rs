//! Transfer executor seam and HTTP implementation
//!
//! A transfer moves bytes from a source URL into a partial artifact on
//! disk, reporting progress per received chunk. Cancellation is
//! cooperative: tripping the token stops the stream, and when the server
//! supports range requests the executor yields a [`ResumeToken`] that a
//! later call can continue from. Whether a cancellation means "pause" or
//! "discard" is the caller's bookkeeping, not the executor's.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};

/// Progress callback: `(bytes_written, total_bytes)`. Total is `None`
/// until the server reports a length. Invoked at least once per chunk.
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Opaque state of a cancelled-but-resumable transfer.
///
/// Sufficient to restart from where the transfer left off: the partial
/// artifact's location and size, plus the validators used to detect that
/// the remote content changed in the meantime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub(crate) url: Url,
    pub(crate) part_path: PathBuf,
    pub(crate) bytes_written: u64,
    pub(crate) etag: Option<String>,
    pub(crate) last_modified: Option<String>,
}

impl ResumeToken {
    /// Build a token. Custom [`TransferExecutor`] implementations mint
    /// these when a cancelled transfer left continuable state behind.
    pub fn new(
        url: Url,
        part_path: PathBuf,
        bytes_written: u64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Self {
        Self {
            url,
            part_path,
            bytes_written,
            etag,
            last_modified,
        }
    }

    /// Source URL the transfer was reading from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path of the partial artifact this token would resume into.
    pub fn part_path(&self) -> &PathBuf {
        &self.part_path
    }

    /// Bytes already on disk when the transfer was cancelled.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// How a transfer ended, short of an error.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The transfer ran to completion; the artifact awaits validation
    /// and relocation by the caller.
    Completed { artifact: PathBuf },
    /// The transfer was cancelled. `resume` is present when the partial
    /// artifact can be continued later.
    Cancelled { resume: Option<ResumeToken> },
}

/// Drives a single transfer from a URL or a resume token.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Start a fresh transfer from `url`.
    async fn begin(
        &self,
        url: &Url,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome>;

    /// Continue a transfer from a previously yielded token. If the
    /// remote content changed since the token was taken, the transfer
    /// restarts from zero within the same call.
    async fn resume(
        &self,
        token: ResumeToken,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome>;

    /// Cheap reachability check: does `url` still serve content?
    async fn probe(&self, url: &Url) -> Result<bool>;
}

/// Production transfer executor over HTTP/HTTPS.
///
/// Streams the response body into `<scratch_dir>/<uuid>.part` with a
/// single connection. Resume uses a `Range` request validated against
/// the stored ETag/Last-Modified.
pub struct HttpTransfer {
    client: Client,
    scratch_dir: PathBuf,
    user_agent: String,
}

enum StreamEnd {
    Finished,
    Cancelled,
}

impl HttpTransfer {
    /// Build an executor from the crate configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout))
            .read_timeout(std::time::Duration::from_secs(config.read_timeout))
            .build()?;

        Ok(Self {
            client,
            scratch_dir: config.scratch_dir.clone(),
            user_agent: config.user_agent.clone(),
        })
    }

    async fn ensure_scratch_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| {
                Error::storage(
                    &self.scratch_dir,
                    format!("failed to create scratch dir: {}", e),
                )
            })?;
        Ok(())
    }

    /// Stream the response body into `file`, invoking `progress` for
    /// every chunk with the running total.
    async fn stream_to_file(
        &self,
        response: Response,
        file: &mut File,
        mut written: u64,
        total: Option<u64>,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(StreamEnd, u64)> {
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    file.flush().await.ok();
                    return Ok((StreamEnd::Cancelled, written));
                }
            };

            let chunk = match chunk {
                Some(result) => result
                    .map_err(|e| Error::transfer(format!("stream error: {}", e), true))?,
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| Error::transfer(format!("failed to write chunk: {}", e), false))?;

            written += chunk.len() as u64;
            progress(written, total);
        }

        file.flush()
            .await
            .map_err(|e| Error::transfer(format!("failed to flush: {}", e), false))?;
        file.sync_all()
            .await
            .map_err(|e| Error::transfer(format!("failed to sync: {}", e), false))?;

        Ok((StreamEnd::Finished, written))
    }

    async fn run(
        &self,
        url: Url,
        part_path: PathBuf,
        existing: u64,
        etag: Option<String>,
        last_modified: Option<String>,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        let mut request = self.client.get(url.clone()).header("User-Agent", self.user_agent.as_str());
        if existing > 0 {
            request = request.header("Range", format!("bytes={}-", existing));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::transfer(
                format!("HTTP error: {}", status),
                status.is_server_error(),
            ));
        }

        // A 200 to a ranged request means the server ignored the range;
        // the partial bytes on disk are useless then.
        let resuming = existing > 0 && status == StatusCode::PARTIAL_CONTENT;

        let headers = response.headers();
        let supports_range = resuming
            || headers
                .get("accept-ranges")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("bytes"))
                .unwrap_or(false);
        let etag = headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or(etag);
        let last_modified = headers
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or(last_modified);
        let total = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|len| if resuming { len + existing } else { len });

        let mut file = if resuming {
            OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await
                .map_err(|e| Error::storage(&part_path, format!("failed to open for append: {}", e)))?
        } else {
            File::create(&part_path)
                .await
                .map_err(|e| Error::storage(&part_path, format!("failed to create: {}", e)))?
        };

        let start = if resuming { existing } else { 0 };
        let (end, written) = self
            .stream_to_file(response, &mut file, start, total, &progress, &cancel)
            .await?;

        match end {
            StreamEnd::Finished => Ok(TransferOutcome::Completed { artifact: part_path }),
            StreamEnd::Cancelled => {
                if supports_range {
                    Ok(TransferOutcome::Cancelled {
                        resume: Some(ResumeToken {
                            url,
                            part_path,
                            bytes_written: written,
                            etag,
                            last_modified,
                        }),
                    })
                } else {
                    // Nothing to resume from; discard the partial bytes.
                    tokio::fs::remove_file(&part_path).await.ok();
                    Ok(TransferOutcome::Cancelled { resume: None })
                }
            }
        }
    }

    /// Check whether the stored validators still match the remote file.
    async fn validators_match(&self, token: &ResumeToken) -> bool {
        let response = match self
            .client
            .head(token.url.clone())
            .header("User-Agent", self.user_agent.as_str())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return false,
        };

        let current_etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok());
        let current_modified = response
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok());

        let etag_valid = match (&token.etag, current_etag) {
            (Some(saved), Some(current)) => saved == current,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let modified_valid = match (&token.last_modified, current_modified) {
            (Some(saved), Some(current)) => saved == current,
            (Some(_), None) => false,
            (None, _) => true,
        };

        etag_valid && modified_valid
    }
}

#[async_trait]
impl TransferExecutor for HttpTransfer {
    async fn begin(
        &self,
        url: &Url,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        self.ensure_scratch_dir().await?;
        let part_path = self.scratch_dir.join(format!("{}.part", Uuid::new_v4()));
        self.run(url.clone(), part_path, 0, None, None, progress, cancel)
            .await
    }

    async fn resume(
        &self,
        token: ResumeToken,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        self.ensure_scratch_dir().await?;

        let on_disk = tokio::fs::metadata(&token.part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        // Restart from zero if the partial artifact went missing, shrank
        // behind our back, or the remote content changed.
        let existing = if on_disk == token.bytes_written
            && on_disk > 0
            && self.validators_match(&token).await
        {
            on_disk
        } else {
            tracing::debug!(
                "cannot continue partial artifact {}, restarting",
                token.part_path.display()
            );
            tokio::fs::remove_file(&token.part_path).await.ok();
            0
        };

        self.run(
            token.url,
            token.part_path,
            existing,
            token.etag,
            token.last_modified,
            progress,
            cancel,
        )
        .await
    }

    async fn probe(&self, url: &Url) -> Result<bool> {
        let response = self
            .client
            .head(url.clone())
            .header("User-Agent", self.user_agent.as_str())
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                tracing::debug!("probe of {} failed: {}", url, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_token_round_trips_through_json() {
        let token = ResumeToken {
            url: Url::parse("https://example.com/a.m4a").unwrap(),
            part_path: PathBuf::from("/tmp/x.part"),
            bytes_written: 4096,
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
        };

        let json = serde_json::to_string(&token).unwrap();
        let back: ResumeToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes_written, 4096);
        assert_eq!(back.part_path, token.part_path);
        assert_eq!(back.etag, token.etag);
    }
}
