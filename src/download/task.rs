//! Deferred download actions and their dispatcher.
//!
//! A [`DownloadTask`] is plain data: what to fetch and where to put it. The
//! planner produces them, the engine schedules them, and a [`TaskRunner`]
//! (normally the [`Dispatcher`]) carries each one out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::client::{FetchClient, FetchOutcome};
use super::error::DownloadError;
use super::transform::PixelTransform;
use crate::annotation::record_local_path;
use crate::manifest::SegmentManifest;
use crate::video::{ExtractError, FrameExtractor, default_extractor, frame_path};

/// One deferred fetch-and-write action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadTask {
    /// Fetch a source file with the poll loop.
    SingleFile {
        /// Source URL.
        url: String,
        /// Destination file.
        destination: PathBuf,
        /// Post-write transform.
        transform: Option<PixelTransform>,
        /// Annotation JSON to record the local path in once written.
        trace: Option<PathBuf>,
    },
    /// Fetch one frame of a short video with the poll loop.
    FrameUrl {
        /// Frame URL.
        url: String,
        /// Destination `<index:07>.png`.
        destination: PathBuf,
        /// Post-write transform.
        transform: Option<PixelTransform>,
    },
    /// Download a segment container, extract its visible frames, delete it.
    VideoSegment {
        /// Segment container URL.
        url: String,
        /// Where the container is downloaded; frames go next to it.
        scratch_path: PathBuf,
        /// Frames of this segment.
        manifest: SegmentManifest,
    },
}

impl DownloadTask {
    /// Source URL of the task.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::SingleFile { url, .. }
            | Self::FrameUrl { url, .. }
            | Self::VideoSegment { url, .. } => url,
        }
    }

    /// Files this task leaves on disk when it succeeds.
    #[must_use]
    pub fn outputs(&self) -> Vec<PathBuf> {
        match self {
            Self::SingleFile { destination, .. } | Self::FrameUrl { destination, .. } => {
                vec![destination.clone()]
            }
            Self::VideoSegment {
                scratch_path,
                manifest,
                ..
            } => {
                let dir = frames_dir(scratch_path);
                manifest
                    .visible_frame_indices()
                    .map(|visible| frame_path(dir, visible))
                    .collect()
            }
        }
    }

    /// Whether this task needs a frame extractor.
    #[must_use]
    pub fn requires_frame_extraction(&self) -> bool {
        matches!(self, Self::VideoSegment { .. })
    }
}

fn frames_dir(scratch_path: &Path) -> &Path {
    scratch_path.parent().unwrap_or_else(|| Path::new("."))
}

/// What a task did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A single file or frame was fetched (or already present).
    Fetched(FetchOutcome),
    /// A segment was decoded into frame files.
    Extracted {
        /// Directory holding the frames.
        dir: PathBuf,
        /// Frames written.
        frames: usize,
    },
    /// Every visible frame of a segment was already on disk.
    SegmentSkipped {
        /// Directory holding the frames.
        dir: PathBuf,
    },
}

/// Errors a single task can fail with.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The fetch failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Frame extraction failed or is unavailable.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The worker running the task panicked.
    #[error("task panicked: {message}")]
    Panicked {
        /// Panic description.
        message: String,
    },
}

impl TaskError {
    /// Creates a panic error from a join failure.
    #[must_use]
    pub fn panicked(error: &tokio::task::JoinError) -> Self {
        Self::Panicked {
            message: error.to_string(),
        }
    }
}

/// Executes one [`DownloadTask`].
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs `task` to completion.
    async fn run_task(&self, task: &DownloadTask) -> Result<TaskOutcome, TaskError>;
}

/// The production [`TaskRunner`]: fetches through a [`FetchClient`] and
/// decodes segments with a [`FrameExtractor`].
pub struct Dispatcher {
    client: FetchClient,
    extractor: Option<Arc<dyn FrameExtractor>>,
    trace_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client", &self.client)
            .field("has_extractor", &self.extractor.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher; segments use [`default_extractor`] when run.
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            extractor: None,
            trace_locks: DashMap::new(),
        }
    }

    /// Uses `extractor` for segment tasks.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    async fn run_single(
        &self,
        url: &str,
        destination: &Path,
        transform: Option<PixelTransform>,
        trace: Option<&Path>,
    ) -> Result<TaskOutcome, TaskError> {
        let outcome = self.client.download_file(url, destination, transform).await?;
        if let Some(annotation_path) = trace
            && !matches!(outcome, FetchOutcome::Skipped { .. })
        {
            self.record_trace(annotation_path, url, destination).await;
        }
        Ok(TaskOutcome::Fetched(outcome))
    }

    #[instrument(skip(self, manifest), fields(url = %url, segment = manifest.segment))]
    async fn run_segment(
        &self,
        url: &str,
        scratch_path: &Path,
        manifest: &SegmentManifest,
    ) -> Result<TaskOutcome, TaskError> {
        let dir = frames_dir(scratch_path).to_path_buf();
        let frames: Vec<PathBuf> = manifest
            .visible_frame_indices()
            .map(|visible| frame_path(&dir, visible))
            .collect();
        if frames.iter().all(|frame| frame.exists()) {
            debug!(dir = %dir.display(), "all visible frames present, skipping segment");
            return Ok(TaskOutcome::SegmentSkipped { dir });
        }

        let extractor = match &self.extractor {
            Some(extractor) => Arc::clone(extractor),
            None => default_extractor()?,
        };

        self.client.download_with_retry(url, scratch_path).await?;

        let segment = scratch_path.to_path_buf();
        let owned_manifest = manifest.clone();
        let decoded =
            tokio::task::spawn_blocking(move || extractor.extract(&segment, &owned_manifest))
                .await;

        if let Err(e) = tokio::fs::remove_file(scratch_path).await {
            warn!(path = %scratch_path.display(), error = %e, "failed to delete segment container");
        }

        let written = decoded.map_err(|e| TaskError::panicked(&e))??;
        info!(dir = %dir.display(), frames = written, "segment extracted");
        Ok(TaskOutcome::Extracted {
            dir,
            frames: written,
        })
    }

    /// Records `destination` as the local path of `url` in the annotation.
    ///
    /// Failures are logged; the download itself already succeeded.
    async fn record_trace(&self, annotation_path: &Path, url: &str, destination: &Path) {
        let lock = Arc::clone(
            self.trace_locks
                .entry(annotation_path.to_path_buf())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;

        let path = annotation_path.to_path_buf();
        let owned_url = url.to_string();
        let local = destination.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || record_local_path(&path, &owned_url, &local)).await;

        match result {
            Ok(Ok(true)) => debug!(annotation = %annotation_path.display(), "recorded local path"),
            Ok(Ok(false)) => {
                debug!(annotation = %annotation_path.display(), url, "no source file matched url");
            }
            Ok(Err(e)) => {
                warn!(annotation = %annotation_path.display(), error = %e, "failed to record local path");
            }
            Err(e) => {
                warn!(annotation = %annotation_path.display(), error = %e, "local path update panicked");
            }
        }
    }
}

#[async_trait]
impl TaskRunner for Dispatcher {
    async fn run_task(&self, task: &DownloadTask) -> Result<TaskOutcome, TaskError> {
        match task {
            DownloadTask::SingleFile {
                url,
                destination,
                transform,
                trace,
            } => {
                self.run_single(url, destination, *transform, trace.as_deref())
                    .await
            }
            DownloadTask::FrameUrl {
                url,
                destination,
                transform,
            } => self.run_single(url, destination, *transform, None).await,
            DownloadTask::VideoSegment {
                url,
                scratch_path,
                manifest,
            } => self.run_segment(url, scratch_path, manifest).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::build_segments;

    fn segment_task() -> DownloadTask {
        let manifest = build_segments(&[("m", "0:3:1:0\n1:3:0:0\n2:3:1:0\n")])
            .unwrap()
            .remove(0);
        DownloadTask::VideoSegment {
            url: "https://x/s3.ts".to_string(),
            scratch_path: PathBuf::from("v/sections/.0000003.ts"),
            manifest,
        }
    }

    #[test]
    fn test_segment_outputs_are_visible_frame_files() {
        assert_eq!(
            segment_task().outputs(),
            vec![
                PathBuf::from("v/sections/0000000.png"),
                PathBuf::from("v/sections/0000001.png"),
            ]
        );
        assert!(segment_task().requires_frame_extraction());
    }

    #[test]
    fn test_single_file_outputs_destination() {
        let task = DownloadTask::SingleFile {
            url: "https://x/a.png".to_string(),
            destination: PathBuf::from("out/a.png"),
            transform: None,
            trace: None,
        };
        assert_eq!(task.outputs(), vec![PathBuf::from("out/a.png")]);
        assert_eq!(task.url(), "https://x/a.png");
        assert!(!task.requires_frame_extraction());
    }

    #[test]
    fn test_task_serializes_with_kind_tag() {
        let task = DownloadTask::FrameUrl {
            url: "https://x/f".to_string(),
            destination: PathBuf::from("v/0000001.png"),
            transform: Some(PixelTransform::Rg16ToGrayscale),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "frame_url");
        assert_eq!(json["transform"], "Rg16ToGrayscale");
        let back: DownloadTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[tokio::test]
    async fn test_segment_with_all_frames_present_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let sections = dir.path().join("sections");
        std::fs::create_dir_all(&sections).unwrap();
        std::fs::write(sections.join("0000000.png"), b"x").unwrap();
        std::fs::write(sections.join("0000001.png"), b"x").unwrap();

        let DownloadTask::VideoSegment { manifest, .. } = segment_task() else {
            unreachable!()
        };
        let task = DownloadTask::VideoSegment {
            url: "http://127.0.0.1:1/never".to_string(),
            scratch_path: sections.join(".0000003.ts"),
            manifest,
        };

        let dispatcher = Dispatcher::new(FetchClient::new("key"));
        let outcome = dispatcher.run_task(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::SegmentSkipped { dir: sections });
    }
}
