//! Datasync Library
//!
//! Materializes remote annotated datasets on local disk: still images,
//! short videos as per-frame PNGs, and long videos reconstructed frame by
//! frame from time-segmented containers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`annotation`] - Parsed item descriptors (slots, source files)
//! - [`manifest`] - Frame manifests of long videos
//! - [`download`] - Fetch layer, download tasks and the execution engine
//! - [`video`] - Frame-accurate segment decoding
//! - [`plan`] - Per-annotation download planning
//! - [`pull`] - Whole-release pull preparation
//! - [`progress`] - Progress reporting sinks

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod annotation;
pub mod download;
pub mod layout;
pub mod manifest;
pub mod plan;
pub mod progress;
pub mod pull;
pub mod video;

// Re-export commonly used types
pub use annotation::{AnnotationError, AnnotationFile, Slot, SourceFile};
pub use download::{
    BatchReport, Dispatcher, DownloadError, DownloadTask, EngineError, ExecutionEngine,
    FailureType, FetchClient, FetchOutcome, FetchSettings, Plan, RetryDecision, RetryPolicy,
    RunOutcome, TaskError, TaskOutcome, TaskRunner,
};
pub use layout::DatasetLayout;
pub use manifest::{ManifestError, ManifestItem, SegmentManifest};
pub use plan::{PlanError, PlanOptions, Planner, SlotStrategy};
pub use progress::{IndicatifProgress, NoProgress, ProgressSink};
pub use pull::{PullError, PullOptions, PullPlan, prepare};
pub use video::{ExtractError, FrameExtractor, FrameSource, default_extractor};
