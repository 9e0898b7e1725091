//! Authenticated HTTP fetches for dataset content.
//!
//! This module provides the [`FetchClient`] which attaches credentials,
//! distinguishes direct binary responses from JSON indirection listings,
//! and streams bodies to disk. Two retry flavours exist:
//!
//! - the **poll loop** ([`FetchClient::fetch`]) used for images and frames:
//!   retried every second until success, a 4xx, or the wall-clock budget;
//! - the **retrying session** ([`FetchClient::fetch_with_retry`]) used for
//!   segment containers and frame manifests: exponential backoff on 5xx.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::constants::{
    API_KEY_SCHEME, CONNECT_TIMEOUT_SECS, POLL_INTERVAL, POLL_TIMEOUT, PRESIGNED_MARKER,
    READ_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::filename::last_path_segment;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_poll_error};
use super::transform::PixelTransform;
use crate::progress::{NoProgress, ProgressSink};

/// Timeouts and poll-loop tuning for a [`FetchClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout (headers and body).
    pub read_timeout: Duration,
    /// Sleep between poll-loop attempts.
    pub poll_interval: Duration,
    /// Wall-clock budget of the poll loop.
    pub poll_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            poll_interval: POLL_INTERVAL,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// The two shapes a successful fetch can take.
#[derive(Debug)]
pub enum FetchResponse {
    /// The body is the file itself.
    Binary(Response),
    /// The body is a JSON listing of sub-resources that make up the file.
    Indirection {
        /// Sub-resource URLs, in listing order.
        urls: Vec<String>,
    },
}

/// What a fetch-and-write call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The destination already existed; no request was sent.
    Skipped {
        /// Existing destination.
        path: PathBuf,
    },
    /// The body was written to the destination.
    Written {
        /// Written file.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
    },
    /// An indirection listing was expanded into a directory of sub-files.
    Expanded {
        /// Directory named after the destination's stem.
        dir: PathBuf,
        /// Sub-files written, in listing order.
        files: Vec<PathBuf>,
    },
}

/// HTTP client for dataset content.
///
/// Created once per pull and cloned into workers; clones share the
/// connection pool and progress sink.
#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    api_key: Arc<str>,
    settings: FetchSettings,
    session_policy: RetryPolicy,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("settings", &self.settings)
            .field("session_policy", &self.session_policy)
            .finish_non_exhaustive()
    }
}

impl FetchClient {
    /// Creates a client with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_settings(api_key, FetchSettings::default())
    }

    /// Creates a client with explicit timeouts and poll tuning.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_settings(api_key: impl Into<String>, settings: FetchSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            client,
            api_key: Arc::from(api_key.into()),
            settings,
            session_policy: RetryPolicy::session(),
            progress: Arc::new(NoProgress),
        }
    }

    /// Replaces the retry policy of the retrying session.
    #[must_use]
    pub fn with_session_policy(mut self, policy: RetryPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    /// Routes per-file byte progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the configured timeouts.
    #[must_use]
    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Returns the progress sink shared by this client.
    #[must_use]
    pub fn progress(&self) -> Arc<dyn ProgressSink> {
        Arc::clone(&self.progress)
    }

    /// Fetches `url` with the poll loop.
    ///
    /// Retries every `poll_interval` until the server answers successfully,
    /// answers with a 4xx (returned immediately), or `poll_timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for client errors,
    /// [`DownloadError::Timeout`] when the budget is spent, and
    /// [`DownloadError::MalformedResponse`] for an indirection body without `urls`.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, DownloadError> {
        let started = Instant::now();
        loop {
            match self.send(url).await {
                Ok(response) => return interpret_response(url, response).await,
                Err(error) => {
                    if classify_poll_error(&error) == FailureType::Permanent {
                        return Err(error);
                    }
                    if started.elapsed() > self.settings.poll_timeout {
                        warn!(error = %error, "poll budget exhausted");
                        return Err(DownloadError::timeout(
                            url,
                            self.settings.poll_timeout.as_secs(),
                        ));
                    }
                    debug!(error = %error, "transient failure, polling again");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    /// Fetches `url` through the retrying session.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or
    /// [`DownloadError::RetriesExhausted`] once the policy gives up on a
    /// transient one.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_with_retry(&self, url: &str) -> Result<Response, DownloadError> {
        let policy = &self.session_policy;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.send(url).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            let failure_type = policy.classify(&error);
            match policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    info!(
                        attempt = next_attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "not retrying fetch");
                    if failure_type == FailureType::Transient {
                        return Err(DownloadError::retries_exhausted(url, attempt, error));
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Fetches `url` with the poll loop and writes it to `destination`.
    ///
    /// Does nothing when `destination` already exists. An indirection
    /// response is expanded into a directory named after the destination's
    /// stem, one file per listed URL. `transform` runs on every written file.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`fetch`](Self::fetch), any sub-fetch failure,
    /// and IO errors while writing.
    #[instrument(skip(self, transform), fields(url = %url, destination = %destination.display()))]
    pub async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        transform: Option<PixelTransform>,
    ) -> Result<FetchOutcome, DownloadError> {
        if destination.exists() {
            debug!("destination exists, skipping");
            return Ok(FetchOutcome::Skipped {
                path: destination.to_path_buf(),
            });
        }

        let outcome = match self.fetch(url).await? {
            FetchResponse::Binary(response) => {
                let bytes = self.write_response(url, response, destination).await?;
                FetchOutcome::Written {
                    path: destination.to_path_buf(),
                    bytes,
                }
            }
            FetchResponse::Indirection { urls } => self.expand(destination, &urls).await?,
        };

        if let Some(transform) = transform {
            for path in outcome_files(&outcome) {
                apply_transform(transform, path).await?;
            }
        }

        info!(?outcome, "download complete");
        Ok(outcome)
    }

    /// Fetches `url` through the retrying session and writes it to `destination`.
    ///
    /// Returns the number of bytes written. Existing files are overwritten.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`fetch_with_retry`](Self::fetch_with_retry) and
    /// IO errors while writing.
    #[instrument(skip(self), fields(url = %url, destination = %destination.display()))]
    pub async fn download_with_retry(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<u64, DownloadError> {
        let response = self.fetch_with_retry(url).await?;
        self.write_response(url, response, destination).await
    }

    /// Fetches every sub-resource of an indirection listing.
    async fn expand(
        &self,
        destination: &Path,
        urls: &[String],
    ) -> Result<FetchOutcome, DownloadError> {
        let dir = destination.with_extension("");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(dir.clone(), e))?;

        let mut files = Vec::with_capacity(urls.len());
        for sub_url in urls {
            let name = last_path_segment(sub_url)
                .ok_or_else(|| DownloadError::invalid_url(sub_url.clone()))?;
            let path = dir.join(name);
            let response = self.send_anonymous(sub_url).await?;
            self.write_response(sub_url, response, &path).await?;
            files.push(path);
        }
        debug!(dir = %dir.display(), count = files.len(), "expanded indirection response");
        Ok(FetchOutcome::Expanded { dir, files })
    }

    /// Sends one authenticated GET and maps non-success statuses to errors.
    async fn send(&self, url: &str) -> Result<Response, DownloadError> {
        self.execute(url, self.request(url)).await
    }

    /// Sends one GET without credentials.
    ///
    /// Indirection sub-URLs point at external storage and never see the API key.
    async fn send_anonymous(&self, url: &str) -> Result<Response, DownloadError> {
        self.execute(url, self.client.get(url)).await
    }

    async fn execute(&self, url: &str, request: RequestBuilder) -> Result<Response, DownloadError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url, self.settings.read_timeout.as_secs())
            } else if e.is_builder() {
                DownloadError::invalid_url(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DownloadError::http_status_with_body(
            url,
            status.as_u16(),
            &body,
        ))
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match authorization_header(url, &self.api_key) {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    /// Streams a response body to `destination`, removing the file on failure.
    async fn write_response(
        &self,
        url: &str,
        response: Response,
        destination: &Path,
    ) -> Result<u64, DownloadError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent.to_path_buf(), e))?;
        }
        let mut file = File::create(destination)
            .await
            .map_err(|e| DownloadError::io(destination.to_path_buf(), e))?;

        let result = stream_to_file(
            &mut file,
            response,
            url,
            destination,
            self.progress.as_ref(),
        )
        .await;
        if result.is_err() {
            debug!(path = %destination.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(destination).await;
        }
        result
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Value of the `Authorization` header for `url`, if any.
///
/// Pre-signed URLs (containing `token`) carry their own credentials and
/// must be sent without an `Authorization` header.
#[must_use]
pub fn authorization_header(url: &str, api_key: &str) -> Option<String> {
    if url.contains(PRESIGNED_MARKER) {
        None
    } else {
        Some(format!("{API_KEY_SCHEME} {api_key}"))
    }
}

/// Returns whether a response carries a JSON body.
fn has_json_content_type(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"))
}

/// Turns a successful response into a [`FetchResponse`].
async fn interpret_response(url: &str, response: Response) -> Result<FetchResponse, DownloadError> {
    if !has_json_content_type(&response) {
        return Ok(FetchResponse::Binary(response));
    }

    let body = response
        .text()
        .await
        .map_err(|e| DownloadError::network(url, e))?;
    let urls = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value.get("urls").and_then(Value::as_array).cloned())
        .and_then(|urls| {
            urls.iter()
                .map(|u| u.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| DownloadError::malformed_response(url, &body))?;
    debug!(count = urls.len(), "indirection response");
    Ok(FetchResponse::Indirection { urls })
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: Response,
    url: &str,
    file_path: &Path,
    progress: &dyn ProgressSink,
) -> Result<u64, DownloadError> {
    let content_length = response.content_length();
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

        bytes_written += chunk.len() as u64;
        progress.file_progress(file_path, content_length, bytes_written);
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;
    progress.file_progress(file_path, Some(bytes_written), bytes_written);

    Ok(bytes_written)
}

fn outcome_files(outcome: &FetchOutcome) -> Vec<&Path> {
    match outcome {
        FetchOutcome::Skipped { .. } => Vec::new(),
        FetchOutcome::Written { path, .. } => vec![path.as_path()],
        FetchOutcome::Expanded { files, .. } => files.iter().map(PathBuf::as_path).collect(),
    }
}

async fn apply_transform(transform: PixelTransform, path: &Path) -> Result<(), DownloadError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || transform.apply(&owned))
        .await
        .map_err(|e| DownloadError::io(path, std::io::Error::other(e)))??;
    Ok(())
}

fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("datasync/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header_for_api_urls() {
        assert_eq!(
            authorization_header("https://api.example/api/files/1", "secret").as_deref(),
            Some("ApiKey secret")
        );
    }

    #[test]
    fn test_authorization_header_skipped_for_presigned_urls() {
        assert_eq!(
            authorization_header("https://bucket.example/f.png?token=abc", "secret"),
            None
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = FetchSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.poll_timeout, Duration::from_secs(60));
        assert_eq!(settings.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_outcome_files() {
        let skipped = FetchOutcome::Skipped {
            path: PathBuf::from("a"),
        };
        assert!(outcome_files(&skipped).is_empty());
        let expanded = FetchOutcome::Expanded {
            dir: PathBuf::from("d"),
            files: vec![PathBuf::from("d/a"), PathBuf::from("d/b")],
        };
        assert_eq!(outcome_files(&expanded).len(), 2);
    }

    #[test]
    fn test_default_user_agent_has_version() {
        assert!(default_user_agent().starts_with("datasync/"));
    }
}
