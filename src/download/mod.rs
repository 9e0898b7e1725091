//! Fetching, task dispatch and batch execution.
//!
//! # Features
//!
//! - Authenticated fetches, with pre-signed URLs sent without credentials
//! - Two response shapes: direct binary bodies and JSON indirection listings
//! - A 1-second poll loop for images and frames, an exponential-backoff
//!   session for segment containers and manifests
//! - Streaming writes with per-file byte progress
//! - Serializable [`DownloadTask`]s run by a semaphore-bounded engine
//!
//! # Example
//!
//! ```no_run
//! use datasync::download::FetchClient;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FetchClient::new("api-key");
//! let outcome = client
//!     .download_file("https://example.com/files/1", Path::new("./images/cat.png"), None)
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
pub mod filename;
mod retry;
mod task;
mod transform;

pub use client::{FetchClient, FetchOutcome, FetchResponse, FetchSettings, authorization_header};
pub use engine::{BatchReport, EngineError, ExecutionEngine, Plan, RunOutcome};
pub use error::DownloadError;
pub use filename::sanitize_filename;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_poll_error};
pub use task::{Dispatcher, DownloadTask, TaskError, TaskOutcome, TaskRunner};
pub use transform::{PixelTransform, RG16_COLORSPACE, TransformError};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
