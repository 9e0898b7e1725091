//! Error types for the download module.
//!
//! This module defines structured errors for all fetch operations,
//! providing context-rich error messages for debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

use super::transform::TransformError;

/// Errors that can occur while fetching remote content.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The poll loop ran out of wall-clock budget, or a request timed out.
    #[error("timeout downloading {url} after {waited_secs} seconds")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// How long the caller waited before giving up.
        waited_secs: u64,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}: {body}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Response body, truncated, for diagnostics.
        body: String,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A JSON indirection response did not carry a `urls` array.
    #[error("malformed response from {url}: {body}")]
    MalformedResponse {
        /// The URL that returned the response.
        url: String,
        /// The offending body.
        body: String,
    },

    /// The post-write pixel transform failed.
    #[error("pixel transform failed: {0}")]
    Transform(#[from] TransformError),

    /// The retrying session gave up.
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// The URL that kept failing.
        url: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        last: Box<DownloadError>,
    },
}

/// Maximum number of body characters kept in error messages.
const MAX_BODY_CHARS: usize = 512;

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error without a body.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::http_status_with_body(url, status, "")
    }

    /// Creates an HTTP status error keeping a truncated copy of the body.
    pub fn http_status_with_body(url: impl Into<String>, status: u16, body: &str) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body: truncate_body(body),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, waited_secs: u64) -> Self {
        Self::Timeout {
            url: url.into(),
            waited_secs,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a malformed indirection response error.
    pub fn malformed_response(url: impl Into<String>, body: &str) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            body: truncate_body(body),
        }
    }

    /// Wraps the final error of an exhausted retry loop.
    pub fn retries_exhausted(url: impl Into<String>, attempts: u32, last: DownloadError) -> Self {
        Self::RetriesExhausted {
            url: url.into(),
            attempts,
            last: Box::new(last),
        }
    }

    /// Returns true for 4xx responses, which are never retried.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if (400..=499).contains(status))
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_BODY_CHARS {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(MAX_BODY_CHARS).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/a.png", 60);
        let msg = error.to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("https://example.com/a.png"));
        assert!(msg.contains("60 seconds"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error =
            DownloadError::http_status_with_body("https://example.com/a.png", 404, "not here");
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("not here"), "Expected body in: {msg}");
    }

    #[test]
    fn test_download_error_body_is_truncated() {
        let body = "x".repeat(4096);
        let error = DownloadError::http_status_with_body("https://example.com", 500, &body);
        let DownloadError::HttpStatus { body, .. } = error else {
            panic!("expected HttpStatus");
        };
        assert_eq!(body.chars().count(), MAX_BODY_CHARS + 1);
    }

    #[test]
    fn test_download_error_is_client_error() {
        assert!(DownloadError::http_status("u", 404).is_client_error());
        assert!(DownloadError::http_status("u", 400).is_client_error());
        assert!(!DownloadError::http_status("u", 503).is_client_error());
        assert!(!DownloadError::timeout("u", 1).is_client_error());
    }

    #[test]
    fn test_download_error_malformed_response_display() {
        let error = DownloadError::malformed_response("https://x/item", r#"{"files":[]}"#);
        let msg = error.to_string();
        assert!(msg.contains("malformed response"));
        assert!(msg.contains(r#"{"files":[]}"#));
    }

    #[test]
    fn test_download_error_retries_exhausted_keeps_source() {
        let error = DownloadError::retries_exhausted(
            "https://x/seg.ts",
            5,
            DownloadError::http_status("https://x/seg.ts", 503),
        );
        let msg = error.to_string();
        assert!(msg.contains("5 attempts"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
