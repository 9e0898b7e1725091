//! Preparing a whole pull: every annotation of a release, minus what is
//! already on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::Plan;
use crate::download::filename::is_media_path;
use crate::plan::{PlanError, PlanOptions, Planner};

/// Errors that stop a pull from being prepared at all.
#[derive(Debug, Error)]
pub enum PullError {
    /// The annotations directory or the images root could not be listed.
    #[error("failed to list {path}: {source}")]
    Io {
        /// Directory being listed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Options of a pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Layout switches passed to the planner.
    pub plan: PlanOptions,
    /// Download even when the destination already exists.
    pub force_replace: bool,
    /// Delete local media with no matching annotation.
    pub remove_extra: bool,
}

/// Everything needed to run a pull.
#[derive(Debug, Default)]
pub struct PullPlan {
    /// Tasks still to run.
    pub plan: Plan,
    /// Annotation files found.
    pub annotations: usize,
    /// Annotations that could not be planned, with the reason.
    pub blocked: Vec<(PathBuf, PlanError)>,
    /// Tasks dropped because their outputs already exist.
    pub skipped_existing: usize,
    /// Files deleted by `remove_extra`.
    pub removed: Vec<PathBuf>,
}

/// Plans every `*.json` annotation in `annotations_dir` into `images_root`.
///
/// The images root is scanned once, up front (recursively when
/// `use_folders`). Unless `force_replace` is set, tasks whose outputs are
/// all among the scanned files are dropped, so a re-run after a partial
/// failure only plans what is missing. An annotation that fails to load or
/// plan is logged and reported in [`PullPlan::blocked`].
///
/// # Errors
///
/// Returns [`PullError::Io`] when either directory cannot be listed.
#[instrument(skip(planner, options), fields(annotations_dir = %annotations_dir.display(), images_root = %images_root.display()))]
pub async fn prepare(
    planner: &Planner,
    annotations_dir: &Path,
    images_root: &Path,
    options: &PullOptions,
) -> Result<PullPlan, PullError> {
    let annotation_paths = list_annotations(annotations_dir)?;
    let mut existing = scan_media(images_root, options.plan.use_folders)?;
    debug!(
        annotations = annotation_paths.len(),
        existing = existing.len(),
        "scanned pull inputs"
    );

    let mut pull = PullPlan {
        annotations: annotation_paths.len(),
        ..PullPlan::default()
    };

    if options.remove_extra {
        pull.removed = remove_extra(&annotation_paths, &mut existing);
    }

    let plan_options = PlanOptions {
        reuse_manifests: !options.force_replace,
        ..options.plan
    };
    for path in &annotation_paths {
        match planner.plan_path(path, images_root, &plan_options).await
        {
            Ok(mut plan) => {
                if !options.force_replace {
                    let before = plan.len();
                    plan.retain(|task| !task.outputs().iter().all(|o| existing.contains(o)));
                    pull.skipped_existing += before - plan.len();
                }
                pull.plan.extend(plan);
            }
            Err(error) => {
                warn!(annotation = %path.display(), error = %error, "annotation blocked");
                pull.blocked.push((path.clone(), error));
            }
        }
    }

    info!(
        tasks = pull.plan.len(),
        skipped_existing = pull.skipped_existing,
        blocked = pull.blocked.len(),
        removed = pull.removed.len(),
        "pull prepared"
    );
    Ok(pull)
}

/// Annotation JSON files directly inside `dir`, sorted by path.
fn list_annotations(dir: &Path) -> Result<Vec<PathBuf>, PullError> {
    let io_error = |source| PullError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Media files under `root`; a missing root has none.
fn scan_media(root: &Path, recursive: bool) -> Result<HashSet<PathBuf>, PullError> {
    let mut found = HashSet::new();
    if !root.exists() {
        return Ok(found);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let io_error = |source| PullError::Io {
            path: dir.clone(),
            source,
        };
        for entry in std::fs::read_dir(&dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if is_media_path(&path) {
                found.insert(path);
            }
        }
    }
    Ok(found)
}

/// Deletes scanned media whose stem matches no annotation stem.
fn remove_extra(annotation_paths: &[PathBuf], existing: &mut HashSet<PathBuf>) -> Vec<PathBuf> {
    let stems: HashSet<_> = annotation_paths
        .iter()
        .filter_map(|p| p.file_stem().map(std::ffi::OsStr::to_os_string))
        .collect();

    let extra: Vec<PathBuf> = existing
        .iter()
        .filter(|path| path.file_stem().is_none_or(|stem| !stems.contains(stem)))
        .cloned()
        .collect();

    let mut removed = Vec::with_capacity(extra.len());
    for path in extra {
        existing.remove(&path);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "removed file without annotation");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove extra file"),
        }
    }
    removed.sort();
    removed
}
