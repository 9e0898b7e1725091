//! Retry logic with exponential backoff for transient fetch failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types used by
//! the retrying session (segment containers and frame manifests).
//!
//! # Overview
//!
//! When a fetch fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays.
//!
//! # Example
//!
//! ```
//! use datasync::download::{DownloadError, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::session();
//! let error = DownloadError::http_status("https://example.com/seg.ts", 503);
//!
//! match policy.should_retry(policy.classify(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{
    SESSION_BACKOFF_BASE, SESSION_BACKOFF_MAX, SESSION_MAX_ATTEMPTS, SESSION_RETRY_STATUSES,
};

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection reset, request timeout, 502/503/504.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, malformed response, local IO failure.
    Permanent,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the fetch after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the fetch.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Session Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 500 ms
/// - `max_delay`: 120 seconds
/// - `backoff_multiplier`: 2.0
/// - retried statuses: 500, 502, 503, 504
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay)
/// ```
///
/// With session values, delays are 0.5s, 1s, 2s, 4s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f64,

    /// HTTP statuses treated as transient.
    retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::session()
    }
}

impl RetryPolicy {
    /// The policy of the retrying session used for segments and manifests.
    #[must_use]
    pub fn session() -> Self {
        Self {
            max_attempts: SESSION_MAX_ATTEMPTS,
            base_delay: SESSION_BACKOFF_BASE,
            max_delay: SESSION_BACKOFF_MAX,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retry_statuses: SESSION_RETRY_STATUSES.to_vec(),
        }
    }

    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            retry_statuses: SESSION_RETRY_STATUSES.to_vec(),
        }
    }

    /// Replaces the base delay, keeping everything else.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classifies a fetch error for this policy.
    ///
    /// | Error | Type |
    /// |-------|------|
    /// | HTTP status in the retry list | Transient |
    /// | Any other HTTP status | Permanent |
    /// | Timeout | Transient |
    /// | Network | Transient |
    /// | IO, invalid URL, malformed response | Permanent |
    #[must_use]
    pub fn classify(&self, error: &DownloadError) -> FailureType {
        match error {
            DownloadError::HttpStatus { status, .. } => {
                if self.retry_statuses.contains(status) {
                    FailureType::Transient
                } else {
                    FailureType::Permanent
                }
            }
            DownloadError::Timeout { .. } | DownloadError::Network { .. } => {
                FailureType::Transient
            }
            DownloadError::Io { .. }
            | DownloadError::InvalidUrl { .. }
            | DownloadError::MalformedResponse { .. }
            | DownloadError::Transform(_)
            | DownloadError::RetriesExhausted { .. } => FailureType::Permanent,
        }
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay)`
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs.max(0.0))
    }
}

/// Classifies an error for the single-file poll loop.
///
/// Client errors (4xx) are permanent and surface immediately; every other
/// HTTP status and every network-level failure is polled again until the
/// loop's wall-clock budget runs out.
#[must_use]
pub fn classify_poll_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } if (400..=499).contains(status) => {
            FailureType::Permanent
        }
        DownloadError::HttpStatus { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::Network { .. } => FailureType::Transient,
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::MalformedResponse { .. }
        | DownloadError::Transform(_)
        | DownloadError::RetriesExhausted { .. } => FailureType::Permanent,
    }
}
