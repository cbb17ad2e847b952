//! Single-file transfers into a staging area.

use crate::error::{FetchError, IoContext};
use crate::progress::{upgrade_to_bytes, Progress};
use crate::types::FetchConfig;
use futures_util::StreamExt;
use indicatif::ProgressBar;
use md5::{Digest, Md5};
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

/// HTTP fetcher shared by every artifact of a run.
#[derive(Clone)]
pub struct Fetcher {
    pub(crate) client: reqwest::Client,
    pub(crate) config: FetchConfig,
    pub(crate) progress: Progress,
}

impl Fetcher {
    /// Builds the HTTP client from `config`.
    pub fn new(config: &FetchConfig, progress: Progress) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.fetch_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(FetchError::Client)?;

        Ok(Self {
            client,
            config: config.clone(),
            progress,
        })
    }

    /// Downloads `url` into `target`, returning the number of bytes written.
    ///
    /// Failed transfers are retried `retry_attempts` times with a fixed pause;
    /// with the default configuration there is exactly one attempt.
    pub async fn fetch_file(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        let retry_strategy =
            FixedInterval::from_millis(self.config.retry_interval.as_millis() as u64)
                .take(self.config.retry_attempts);

        Retry::spawn(retry_strategy, || async move {
            match self.download_once(url, target).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if is_transient(&e) && self.config.retry_attempts > 0 => {
                    warn!("Failed to download {} due to error: {}", url, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await
    }

    async fn download_once(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        let file_display_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(url)
            .to_string();

        info!("⬇️  Downloading: {}", file_display_name);
        debug!("From: {}", url);

        let pb = self.progress.spinner(format!("⬇️  {}", file_display_name));
        let result = self.stream_to_file(url, target, &pb).await;
        pb.finish_and_clear();

        let bytes = result?;
        info!(
            "✅ Downloaded {} ({:.1} KB)",
            file_display_name,
            bytes as f64 / 1024.0
        );
        Ok(bytes)
    }

    async fn stream_to_file(
        &self,
        url: &str,
        target: &Path,
        pb: &ProgressBar,
    ) -> Result<u64, FetchError> {
        // Create parent directory if needed
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.fetch_ctx(parent)?;
        }

        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let content_length = response.content_length();
        match content_length {
            Some(len) => upgrade_to_bytes(pb, len),
            None => debug!("Content-Length not present for {}", url),
        }

        let expected_md5 = if self.config.verify_etag {
            response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .and_then(md5_etag)
        } else {
            None
        };
        let mut hasher = expected_md5.as_ref().map(|_| Md5::new());

        let mut file = BufWriter::new(tokio::fs::File::create(target).await.fetch_ctx(target)?);
        let mut written = 0u64;
        let mut byte_stream = response.bytes_stream();

        while let Some(piece) = byte_stream.next().await {
            let chunk = piece.map_err(transport)?;
            if let Some(ref mut h) = hasher {
                h.update(&chunk);
            }
            file.write_all(&chunk).await.fetch_ctx(target)?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }
        file.flush().await.fetch_ctx(target)?;

        if let Some(expected) = content_length {
            if written != expected {
                return Err(FetchError::SizeMismatch {
                    url: url.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        if let (Some(expected), Some(hasher)) = (expected_md5, hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if actual != expected {
                return Err(FetchError::ChecksumMismatch {
                    url: url.to_string(),
                    expected,
                    actual,
                });
            }
            debug!("MD5 verified for {}", url);
        }

        Ok(written)
    }
}

/// Returns the ETag value when it is a plain MD5 digest.
///
/// Multipart uploads (`<md5>-<parts>`) and weak validators are not digests of
/// the body and yield `None`.
fn md5_etag(etag: &str) -> Option<String> {
    if etag.starts_with("W/") {
        return None;
    }
    let value = etag.trim_matches('"');
    (value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| value.to_ascii_lowercase())
}

fn is_transient(error: &FetchError) -> bool {
    match error {
        FetchError::Transport { .. }
        | FetchError::SizeMismatch { .. }
        | FetchError::ChecksumMismatch { .. } => true,
        FetchError::Status { status, .. } => {
            status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

/// File name of the last non-empty path segment of `url`, if any.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
}
