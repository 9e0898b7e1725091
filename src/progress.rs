//! Progress reporting for pulls.
//!
//! Reporting is two-tiered: a "total files" counter advanced once per
//! finished task, and a per-file byte counter updated while a response body
//! is streamed to disk. [`ProgressSink`] is the seam; [`IndicatifProgress`]
//! renders both tiers in the terminal.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Receiver of progress events. Implementations must be cheap and thread-safe.
pub trait ProgressSink: Send + Sync {
    /// Advances the "total files" counter by `advance_by` out of `total`.
    fn advance_total(&self, total: usize, advance_by: usize);

    /// Reports `bytes_sent` bytes written so far to `destination`.
    fn file_progress(&self, destination: &Path, total_bytes: Option<u64>, bytes_sent: u64);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advance_total(&self, _total: usize, _advance_by: usize) {}

    fn file_progress(&self, _destination: &Path, _total_bytes: Option<u64>, _bytes_sent: u64) {}
}

/// Terminal progress UI built on `indicatif`.
///
/// Per-file bars are keyed by destination path, since frame files of
/// different videos share names, and are created the first time a path is
/// seen. Once more
/// bars are tracked than there are workers, finished bars are removed.
pub struct IndicatifProgress {
    multi: MultiProgress,
    total: OnceLock<ProgressBar>,
    files: DashMap<PathBuf, ProgressBar>,
    max_tracked: usize,
}

impl std::fmt::Debug for IndicatifProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatifProgress")
            .field("tracked_files", &self.files.len())
            .field("max_tracked", &self.max_tracked)
            .finish_non_exhaustive()
    }
}

impl IndicatifProgress {
    /// Creates a progress UI that keeps at most `workers` finished file bars around.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self::with_multi(MultiProgress::new(), workers)
    }

    /// Creates a progress UI drawing into an existing `MultiProgress`.
    #[must_use]
    pub fn with_multi(multi: MultiProgress, workers: usize) -> Self {
        Self {
            multi,
            total: OnceLock::new(),
            files: DashMap::new(),
            max_tracked: workers.max(1),
        }
    }

    /// Number of per-file bars currently tracked.
    #[must_use]
    pub fn tracked_files(&self) -> usize {
        self.files.len()
    }

    fn total_bar(&self, total: usize) -> &ProgressBar {
        self.total.get_or_init(|| {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(
                ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_prefix("Total files");
            bar
        })
    }

    fn new_file_bar(&self, destination: &Path, total_bytes: Option<u64>) -> ProgressBar {
        let bar = self
            .multi
            .add(total_bytes.map_or_else(ProgressBar::no_length, ProgressBar::new));
        bar.set_style(
            ProgressStyle::with_template("{msg:30} {bytes}/{total_bytes} {bytes_per_sec}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(bar_label(destination));
        bar
    }

    fn prune_finished(&self) {
        if self.files.len() <= self.max_tracked {
            return;
        }
        let finished: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|entry| entry.value().is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        for key in finished {
            if self.files.len() <= self.max_tracked {
                break;
            }
            if let Some((_, bar)) = self.files.remove(&key) {
                self.multi.remove(&bar);
            }
        }
    }
}

impl ProgressSink for IndicatifProgress {
    fn advance_total(&self, total: usize, advance_by: usize) {
        let bar = self.total_bar(total);
        bar.inc(advance_by as u64);
        if bar.position() >= total as u64 {
            bar.finish();
        }
    }

    fn file_progress(&self, destination: &Path, total_bytes: Option<u64>, bytes_sent: u64) {
        {
            let bar = self
                .files
                .entry(destination.to_path_buf())
                .or_insert_with(|| self.new_file_bar(destination, total_bytes));
            if let Some(total) = total_bytes {
                bar.set_length(total);
            }
            bar.set_position(bytes_sent);
            if total_bytes.is_some_and(|total| bytes_sent >= total) {
                bar.finish();
            }
        }
        self.prune_finished();
    }
}

/// `<parent>/<file>` for display.
fn bar_label(destination: &Path) -> String {
    let file = destination
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    match destination.parent().and_then(Path::file_name) {
        Some(parent) => format!("{}/{file}", parent.to_string_lossy()),
        None => file,
    }
}
