//! Constants for the download module (timeouts, polling, session retries).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large segment containers).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Interval between attempts of the single-file poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wall-clock budget of the single-file poll loop.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts made by the retrying session (segments and manifests).
pub const SESSION_MAX_ATTEMPTS: u32 = 5;

/// Backoff factor of the retrying session; delays are 0.5s, 1s, 2s, 4s.
pub const SESSION_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound of a single session backoff delay.
pub const SESSION_BACKOFF_MAX: Duration = Duration::from_secs(120);

/// Statuses the retrying session retries on.
pub const SESSION_RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Header value prefix for API key authentication.
pub const API_KEY_SCHEME: &str = "ApiKey";

/// URL substring marking a pre-signed URL that must not carry credentials.
pub const PRESIGNED_MARKER: &str = "token";
