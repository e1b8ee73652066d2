//! Streamed blob download with integrity verification.
//!
//! Bodies are streamed into a `.tmp` sibling of the destination while a
//! sha256 runs over every chunk; the file is renamed into place only after
//! the digest matches. Observers therefore see either no blob file or a
//! complete, verified one.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Progress callback invoked after each chunk with
/// `(bytes_written, content_length_or_-1)`.
pub type ProgressCallback = Box<dyn Fn(u64, i64) + Send + Sync>;

/// Errors from download operations.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP status {0}")]
    Status(StatusCode),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("download canceled")]
    Canceled,

    #[error("download failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

/// Blob downloader with linear-backoff retries.
pub struct Fetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl Fetcher {
    /// Create a fetcher with the default retry budget (1 + 3 retries).
    pub fn new() -> Result<Self, FetchError> {
        Self::with_retries(3)
    }

    /// Create a fetcher allowing `max_retries` retries after the first
    /// attempt.
    pub fn with_retries(max_retries: u32) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1800))
            .build()?;

        Ok(Self {
            client,
            max_retries,
        })
    }

    /// Download `url` to `dest`, ensuring that on success the file at
    /// `dest` hashes to `expected_checksum` (lowercase hex sha256).
    ///
    /// Attempts are separated by a linear backoff (1 s, 2 s, ...) which,
    /// like the body read, honors the cancellation signal. All failures of
    /// the final attempt are wrapped with the attempt count.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_checksum: &str,
        cancel: &watch::Receiver<bool>,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), FetchError> {
        let mut cancel = cancel.clone();
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(u64::from(attempt))) => {}
                    _ = cancel_requested(&mut cancel) => return Err(FetchError::Canceled),
                }
            }

            match self.attempt(url, dest, expected_checksum, &cancel, progress).await {
                Ok(()) => {
                    debug!(url = %url, dest = %dest.display(), "Blob downloaded");
                    return Ok(());
                }
                Err(FetchError::Canceled) => return Err(FetchError::Canceled),
                Err(e) => {
                    warn!(url = %url, attempt = attempt + 1, error = %e, "Download attempt failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(source) => Err(FetchError::Exhausted {
                attempts: self.max_retries + 1,
                source: Box::new(source),
            }),
            None => Ok(()),
        }
    }

    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        expected_checksum: &str,
        cancel: &watch::Receiver<bool>,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), FetchError> {
        let response = self.client.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }

        let tmp_path = temp_path(dest);
        match self
            .stream_body(response, &tmp_path, expected_checksum, cancel, progress)
            .await
        {
            Ok(()) => {
                tokio::fs::rename(&tmp_path, dest).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn stream_body(
        &self,
        mut response: reqwest::Response,
        tmp_path: &Path,
        expected_checksum: &str,
        cancel: &watch::Receiver<bool>,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), FetchError> {
        let total = response.content_length().map_or(-1, |n| n as i64);

        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            if *cancel.borrow() {
                return Err(FetchError::Canceled);
            }

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;

            if let Some(cb) = progress {
                cb(written, total);
            }
        }

        file.sync_all().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if actual != expected_checksum {
            return Err(FetchError::ChecksumMismatch {
                expected: expected_checksum.to_string(),
                actual,
            });
        }

        Ok(())
    }
}

/// Compute the lowercase hex sha256 of a file on disk.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Resolves once the cancellation flag flips to true; pends forever if the
/// sender goes away without requesting cancellation.
pub(crate) async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut path = dest.as_os_str().to_os_string();
    path.push(".tmp");
    PathBuf::from(path)
}
