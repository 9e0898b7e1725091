//! Turning annotations into download tasks.
//!
//! The [`Planner`] inspects one [`AnnotationFile`] and produces the ordered
//! [`Plan`] that materializes it on disk. Three layouts exist:
//!
//! - **single-slot**: only the first slot (by name) is downloaded, straight
//!   into the item's parent directory;
//! - **multi-slot**: every slot is downloaded under `<item>/<slot>/`;
//! - **video frames**: a non-image slot becomes numbered PNG frames, either
//!   fetched one by one (short videos) or decoded from segment containers
//!   indexed by frame manifests (long videos).
//!
//! # Layout precedence
//!
//! `ignore_slots` always selects the single-slot layout. Otherwise the
//! multi-slot layout is used when `force_slots` is set or the item needs it
//! (more than one slot, or a slot with more than one file).

mod error;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::annotation::{AnnotationFile, Slot};
use crate::download::filename::{dotted_extension, sanitize_filename};
use crate::download::{DownloadTask, FetchClient, PixelTransform, Plan};
use crate::manifest::{self, SegmentManifest};
use crate::video::SECTIONS_DIR;

pub use error::PlanError;

/// Assembled manifests of a long video, saved beside its frames.
pub const MANIFEST_CACHE_FILE: &str = ".manifest.json";

/// Switches controlling how annotations are laid out on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Mirror each item's remote folder under the images root.
    pub use_folders: bool,
    /// Download non-image slots as numbered frames instead of video files.
    pub video_frames: bool,
    /// Always use the per-slot layout.
    pub force_slots: bool,
    /// Always use the single-slot layout.
    pub ignore_slots: bool,
    /// Read a long video's manifests from the copy saved by an earlier
    /// pull instead of fetching them again.
    pub reuse_manifests: bool,
}

/// Layout chosen for one annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStrategy {
    /// Only the first slot, written into the parent directory.
    SingleSlot,
    /// Every slot, under `<item>/<slot>/`.
    MultiSlot,
}

impl PlanOptions {
    /// Picks the layout for `annotation`.
    #[must_use]
    pub fn strategy_for(&self, annotation: &AnnotationFile) -> SlotStrategy {
        if self.ignore_slots {
            SlotStrategy::SingleSlot
        } else if self.force_slots || annotation.needs_slot_layout() {
            SlotStrategy::MultiSlot
        } else {
            SlotStrategy::SingleSlot
        }
    }
}

/// Builds download plans. Long videos need the client to fetch manifests.
#[derive(Debug, Clone)]
pub struct Planner {
    client: FetchClient,
}

impl Planner {
    /// Creates a planner fetching manifests through `client`.
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self { client }
    }

    /// Loads the annotation at `path` and plans it.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Annotation`] when the file cannot be parsed, and
    /// the errors of [`plan`](Self::plan).
    pub async fn plan_path(
        &self,
        path: &Path,
        images_root: &Path,
        options: &PlanOptions,
    ) -> Result<Plan, PlanError> {
        let annotation = AnnotationFile::from_path(path)?;
        self.plan(&annotation, images_root, options).await
    }

    /// Plans every download needed to materialize `annotation` under `images_root`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when a directory cannot be created, a manifest
    /// cannot be assembled, a segment URL is missing, or a slot needed for
    /// the per-slot layout has no name.
    #[instrument(skip(self, annotation, options), fields(item = %annotation.filename))]
    pub async fn plan(
        &self,
        annotation: &AnnotationFile,
        images_root: &Path,
        options: &PlanOptions,
    ) -> Result<Plan, PlanError> {
        let parent = parent_dir(annotation, images_root, options.use_folders);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| PlanError::io(&parent, e))?;

        let mut annotation = annotation.clone();
        annotation.sort_slots();

        let strategy = options.strategy_for(&annotation);
        let mut plan = Plan::default();
        match strategy {
            SlotStrategy::SingleSlot => {
                if let Some(slot) = annotation.slots.first() {
                    plan = self
                        .plan_single_slot(&annotation, slot, &parent, options)
                        .await?;
                }
            }
            SlotStrategy::MultiSlot => {
                let item_dir = parent.join(sanitize_filename(&annotation.filename));
                for slot in &annotation.slots {
                    let name = slot.name.as_deref().ok_or_else(|| PlanError::MissingSlotName {
                        item: annotation.filename.clone(),
                    })?;
                    let slot_dir = item_dir.join(sanitize_filename(name));
                    plan.extend(
                        self.plan_slot(&annotation, slot, &slot_dir, &slot_dir, None, options)
                            .await?,
                    );
                }
            }
        }

        debug!(?strategy, tasks = plan.len(), "planned annotation");
        Ok(plan)
    }

    async fn plan_single_slot(
        &self,
        annotation: &AnnotationFile,
        slot: &Slot,
        parent: &Path,
        options: &PlanOptions,
    ) -> Result<Plan, PlanError> {
        let video_dir = parent.join(video_dir_name(annotation));
        let item_name = item_file_name(annotation, slot);
        self.plan_slot(annotation, slot, parent, &video_dir, Some(&item_name), options)
            .await
    }

    /// Plans one slot: frames into `video_dir`, or files into `files_dir`.
    ///
    /// `first_name` renames the slot's first source file.
    async fn plan_slot(
        &self,
        annotation: &AnnotationFile,
        slot: &Slot,
        files_dir: &Path,
        video_dir: &Path,
        first_name: Option<&str>,
        options: &PlanOptions,
    ) -> Result<Plan, PlanError> {
        let transform = PixelTransform::for_colorspace(slot.colorspace());

        if options.video_frames && !slot.is_image() {
            if let Some(frame_urls) = slot.frame_urls() {
                return Ok(frame_urls
                    .iter()
                    .enumerate()
                    .map(|(index, url)| DownloadTask::FrameUrl {
                        url: url.clone(),
                        destination: video_dir.join(format!("{index:07}.png")),
                        transform,
                    })
                    .collect());
            }
            let manifest_urls = slot.manifest_urls();
            if !manifest_urls.is_empty() {
                return self
                    .plan_segments(
                        annotation,
                        slot,
                        &manifest_urls,
                        video_dir,
                        options.reuse_manifests,
                    )
                    .await;
            }
            debug!("slot has neither frame URLs nor manifests, downloading source files");
        }

        let trace = (annotation.version_major >= 2).then(|| annotation.path.clone());
        Ok(slot
            .source_files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let name = match first_name {
                    Some(name) if index == 0 => name.to_string(),
                    _ => sanitize_filename(&file.file_name),
                };
                DownloadTask::SingleFile {
                    url: file.url.clone(),
                    destination: files_dir.join(name),
                    transform,
                    trace: trace.clone(),
                }
            })
            .collect())
    }

    /// Assembles the manifests of a long video into one task per segment.
    ///
    /// The assembled manifests are saved under `sections/`; with
    /// `reuse_manifests` a saved copy is used instead of the network.
    async fn plan_segments(
        &self,
        annotation: &AnnotationFile,
        slot: &Slot,
        manifest_urls: &[&str],
        video_dir: &Path,
        reuse_manifests: bool,
    ) -> Result<Plan, PlanError> {
        let sections = video_dir.join(SECTIONS_DIR);
        let cache = sections.join(MANIFEST_CACHE_FILE);
        let saved = if reuse_manifests {
            read_manifest_cache(&cache).await
        } else {
            None
        };
        let segments = match saved {
            Some(segments) => {
                debug!(cache = %cache.display(), "reusing saved frame manifests");
                segments
            }
            None => {
                let segments = manifest::assemble(&self.client, manifest_urls, video_dir)
                    .await
                    .map_err(|source| PlanError::Manifest {
                        item: annotation.filename.clone(),
                        source,
                    })?;
                write_manifest_cache(&cache, &segments).await;
                segments
            }
        };
        let segment_urls = slot.segment_urls();

        segments
            .into_iter()
            .enumerate()
            .map(|(position, manifest)| {
                let url = segment_urls
                    .get(position)
                    .ok_or_else(|| PlanError::MissingSegment {
                        item: annotation.filename.clone(),
                        position,
                        available: segment_urls.len(),
                    })?;
                Ok(DownloadTask::VideoSegment {
                    url: (*url).to_string(),
                    scratch_path: sections.join(format!(".{position:07}.ts")),
                    manifest,
                })
            })
            .collect::<Result<Vec<_>, PlanError>>()
            .map(Plan::new)
    }
}

async fn read_manifest_cache(path: &Path) -> Option<Vec<SegmentManifest>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(segments) => Some(segments),
        Err(e) => {
            warn!(cache = %path.display(), error = %e, "ignoring unreadable manifest cache");
            None
        }
    }
}

/// Saves assembled manifests. Failures are logged.
async fn write_manifest_cache(path: &Path, segments: &[SegmentManifest]) {
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(segments).map_err(std::io::Error::other)?;
        tokio::fs::write(path, bytes).await
    }
    .await;
    if let Err(e) = result {
        warn!(cache = %path.display(), error = %e, "failed to save manifest cache");
    }
}

/// Directory the item's files (or slot directories) are written under.
fn parent_dir(annotation: &AnnotationFile, images_root: &Path, use_folders: bool) -> PathBuf {
    if !use_folders {
        return images_root.to_path_buf();
    }
    let relative = annotation.remote_path.trim_start_matches('/');
    if relative.is_empty() {
        images_root.to_path_buf()
    } else {
        images_root.join(relative)
    }
}

/// Name of the frame directory of a single-slot video.
fn video_dir_name(annotation: &AnnotationFile) -> String {
    annotation.annotation_stem().unwrap_or_else(|| {
        Path::new(&sanitize_filename(&annotation.filename))
            .file_stem()
            .map_or_else(String::new, |s| s.to_string_lossy().into_owned())
    })
}

/// Sanitized item file name, borrowing the first source file's extension
/// when the item name has none.
fn item_file_name(annotation: &AnnotationFile, slot: &Slot) -> String {
    let name = sanitize_filename(&annotation.filename);
    if !dotted_extension(Path::new(&name)).is_empty() {
        return name;
    }
    slot.source_files
        .first()
        .map(|file| dotted_extension(Path::new(&file.file_name)))
        .map_or_else(|| name.clone(), |ext| format!("{name}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn annotation(json: &str) -> AnnotationFile {
        AnnotationFile::from_json_str(Path::new("ann/item.json"), json).unwrap()
    }

    #[test]
    fn test_strategy_precedence() {
        let two_slots = annotation(
            r#"{"item": {"name": "x", "slots": [{"slot_name": "a"}, {"slot_name": "b"}]}}"#,
        );
        let one_slot = annotation(r#"{"item": {"name": "x", "slots": [{"slot_name": "a"}]}}"#);

        let defaults = PlanOptions::default();
        assert_eq!(defaults.strategy_for(&two_slots), SlotStrategy::MultiSlot);
        assert_eq!(defaults.strategy_for(&one_slot), SlotStrategy::SingleSlot);

        let forced = PlanOptions {
            force_slots: true,
            ..PlanOptions::default()
        };
        assert_eq!(forced.strategy_for(&one_slot), SlotStrategy::MultiSlot);

        let ignored = PlanOptions {
            force_slots: true,
            ignore_slots: true,
            ..PlanOptions::default()
        };
        assert_eq!(ignored.strategy_for(&two_slots), SlotStrategy::SingleSlot);
    }

    #[test]
    fn test_parent_dir_mirrors_remote_path() {
        let file = annotation(r#"{"item": {"name": "x", "path": "/a/b", "slots": []}}"#);
        assert_eq!(
            parent_dir(&file, Path::new("images"), true),
            PathBuf::from("images/a/b")
        );
        assert_eq!(
            parent_dir(&file, Path::new("images"), false),
            PathBuf::from("images")
        );
        let root = annotation(r#"{"item": {"name": "x", "path": "/", "slots": []}}"#);
        assert_eq!(
            parent_dir(&root, Path::new("images"), true),
            PathBuf::from("images")
        );
    }

    #[test]
    fn test_item_file_name_borrows_extension() {
        let file = annotation(
            r#"{"item": {"name": "scan", "slots": [
                {"slot_name": "0", "source_files": [{"file_name": "scan.dcm", "url": "u"}]}]}}"#,
        );
        assert_eq!(item_file_name(&file, &file.slots[0]), "scan.dcm");

        let named = annotation(
            r#"{"item": {"name": "a?b.png", "slots": [
                {"slot_name": "0", "source_files": [{"file_name": "x.jpg", "url": "u"}]}]}}"#,
        );
        assert_eq!(item_file_name(&named, &named.slots[0]), "a_b.png");
    }

    #[test]
    fn test_video_dir_uses_annotation_stem() {
        let file = annotation(r#"{"item": {"name": "clip.mp4", "slots": []}}"#);
        assert_eq!(video_dir_name(&file), "item");
    }
}
