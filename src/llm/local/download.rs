// src/llm/local/download.rs
// Chunked, resumable model download with primary/secondary URL fallback.

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client as HttpClient, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::acquisition::AcquisitionSettings;
use super::LocalLlmError;
use crate::llm::fallback::RetryConfig;

/// Progress callback: (bytes downloaded, total expected bytes).
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Report progress on at least a 1% delta, or after this share of the
/// configured interval, whichever comes first.
const PROGRESS_PCT_STEP: f32 = 1.0;

pub(crate) struct Downloader {
    http_client: HttpClient,
    settings: Arc<AcquisitionSettings>,
    retry: RetryConfig,
}

impl Downloader {
    pub fn new(settings: Arc<AcquisitionSettings>) -> Result<Self, LocalLlmError> {
        let http_client = HttpClient::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("HTTP client error: {e}")))?;
        let retry = RetryConfig {
            max_attempts: settings.max_attempts,
            ..RetryConfig::default()
        };
        Ok(Self {
            http_client,
            settings,
            retry,
        })
    }

    /// Runs the download to completion, resuming from the `.tmp` sidecar.
    ///
    /// The sidecar's on-disk size is the authoritative resume offset: it is
    /// re-stat'ed before every attempt rather than trusted from memory.
    /// On success the file is verified against the minimum-valid size and
    /// atomically renamed into place.
    #[instrument(skip(self, progress))]
    pub async fn run(&self, progress: ProgressCallback) -> Result<PathBuf, LocalLlmError> {
        let final_path = self.settings.model_path();
        let tmp_path = self.settings.tmp_path();

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying model download");
                tokio::time::sleep(delay).await;
            }

            let offset = fs::metadata(&tmp_path).await.map(|m| m.len()).unwrap_or(0);

            let result = match self
                .fetch_into_tmp(&self.settings.primary_url, offset, &progress)
                .await
            {
                Ok(size) => Ok(size),
                Err(primary_err) => {
                    warn!(%primary_err, "primary download URL failed, trying secondary");
                    // The offset may have advanced before the primary failed.
                    let offset = fs::metadata(&tmp_path).await.map(|m| m.len()).unwrap_or(0);
                    self.fetch_into_tmp(&self.settings.secondary_url, offset, &progress)
                        .await
                }
            };

            match result {
                Ok(size) if size >= self.settings.min_valid_bytes => {
                    fs::rename(&tmp_path, &final_path).await.map_err(|e| {
                        LocalLlmError::ModelDownloadFailed(format!("rename error: {e}"))
                    })?;
                    info!(bytes = size, path = %final_path.display(), "model download complete");
                    return Ok(final_path);
                }
                Ok(size) => {
                    // A "complete" transfer below the validity floor is a
                    // truncated or corrupt payload. Discard, never accept.
                    warn!(bytes = size, "downloaded file below minimum valid size, discarding");
                    let _ = fs::remove_file(&tmp_path).await;
                    last_error = Some(LocalLlmError::ModelCorrupt {
                        size,
                        min_valid: self.settings.min_valid_bytes,
                    });
                }
                Err(err) => {
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LocalLlmError::ModelDownloadFailed("all download attempts failed".to_string())
        }))
    }

    /// Streams one URL into the `.tmp` sidecar, resuming at `offset` via a
    /// `Range` request. Returns the sidecar's size after the stream ends.
    async fn fetch_into_tmp(
        &self,
        url: &str,
        offset: u64,
        progress: &ProgressCallback,
    ) -> Result<u64, LocalLlmError> {
        let tmp_path = self.settings.tmp_path();

        let mut request = self.http_client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("connect failed: {e}")))?;

        let status = response.status();
        let (mut file, mut downloaded, total) = if status == StatusCode::PARTIAL_CONTENT {
            let remaining = response
                .content_length()
                .unwrap_or_else(|| self.settings.expected_bytes.saturating_sub(offset));
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&tmp_path)
                .await
                .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("open error: {e}")))?;
            debug!(offset, "resuming download from sidecar offset");
            (file, offset, offset + remaining)
        } else if status.is_success() {
            // Server ignored the range request; restart from zero.
            let total = response
                .content_length()
                .unwrap_or(self.settings.expected_bytes);
            let file = fs::File::create(&tmp_path)
                .await
                .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("create error: {e}")))?;
            (file, 0u64, total)
        } else {
            return Err(LocalLlmError::ModelDownloadFailed(format!(
                "status {status} from {url}"
            )));
        };

        let mut stream = response.bytes_stream();
        let mut last_reported_pct = pct(downloaded, total);
        let mut last_report = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| LocalLlmError::ModelDownloadFailed(format!("chunk error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("write error: {e}")))?;
            downloaded += chunk.len() as u64;

            let current_pct = pct(downloaded, total);
            if current_pct - last_reported_pct >= PROGRESS_PCT_STEP
                || last_report.elapsed() >= self.settings.progress_interval
            {
                progress(downloaded, total);
                last_reported_pct = current_pct;
                last_report = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| LocalLlmError::ModelDownloadFailed(format!("flush error: {e}")))?;
        drop(file);

        progress(downloaded, total);
        Ok(downloaded)
    }
}

fn pct(downloaded: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f32 / total as f32) * 100.0
}
