use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::checker::http_client;
use crate::config::ClientConfig;
use crate::error::UpdateError;
use crate::types::DownloadProgress;

/// Largest slice written (and reported) at a time.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Waits out the delay between download attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Delay before retry number `attempt` (1-based): `attempt * 2` seconds.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt) * 2)
}

/// Streaming package fetcher with linear backoff between attempts.
#[derive(Clone)]
pub struct Downloader<S = TokioSleeper> {
    http: reqwest::Client,
    base_url: String,
    program_id: String,
    token: Option<String>,
    max_retries: u32,
    sleeper: S,
}

impl Downloader<TokioSleeper> {
    pub fn new(config: &ClientConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        Ok(Self::with_client(http_client(config)?, config))
    }

    pub(crate) fn with_client(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            http,
            base_url: config.base_url().to_owned(),
            program_id: config.program_id.clone(),
            token: config.token.clone(),
            max_retries: config.max_retries,
            sleeper: TokioSleeper,
        }
    }
}

impl<S: Sleeper> Downloader<S> {
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> Downloader<T> {
        Downloader {
            http: self.http,
            base_url: self.base_url,
            program_id: self.program_id,
            token: self.token,
            max_retries: self.max_retries,
            sleeper,
        }
    }

    pub fn download_url(&self, channel: &str, version: &str) -> String {
        format!(
            "{}/api/programs/{}/download/{}/{}",
            self.base_url, self.program_id, channel, version
        )
    }

    /// Download `version` from `channel` into `dest`, returning the byte count.
    ///
    /// Makes up to `max_retries + 1` attempts. Only network and server errors
    /// are retried; the error from the final attempt is returned. A failed
    /// attempt may leave a partial file at `dest`.
    pub async fn fetch<F>(
        &self,
        channel: &str,
        version: &str,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<u64, UpdateError>
    where
        F: FnMut(&DownloadProgress) + Send,
    {
        let url = self.download_url(channel, version);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff(attempt);
                info!(attempt, max_retries = self.max_retries, ?delay, "retrying download");
                self.sleeper.sleep(delay).await;
            }

            match self.attempt(&url, version, dest, &mut on_progress).await {
                Ok(bytes) => {
                    info!(version, bytes, path = %dest.display(), "download complete");
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "download attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| UpdateError::Network("no download attempt made".into())))
    }

    async fn attempt<F>(
        &self,
        url: &str,
        version: &str,
        dest: &Path,
        on_progress: &mut F,
    ) -> Result<u64, UpdateError>
    where
        F: FnMut(&DownloadProgress) + Send,
    {
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpdateError::from_response(response).await);
        }

        let total = response.content_length().unwrap_or(0);
        debug!(url, total, "streaming package");

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(dest).await?;

        let started = Instant::now();
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Network(e.to_string()))?;
            for piece in chunk.chunks(CHUNK_SIZE) {
                file.write_all(piece).await?;
                downloaded += piece.len() as u64;

                if total > 0 {
                    let elapsed = started.elapsed().as_secs_f64();
                    on_progress(&DownloadProgress {
                        version: version.to_owned(),
                        downloaded,
                        total,
                        percentage: downloaded as f64 / total as f64 * 100.0,
                        speed: if elapsed > 0.0 {
                            downloaded as f64 / elapsed
                        } else {
                            0.0
                        },
                    });
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }
}
