//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use datasync::{DatasetLayout, PlanOptions, PullOptions};

/// Pull the media of an annotated dataset release to local disk.
///
/// Reads the release's annotation JSON files and downloads every image,
/// video, or video frame they reference, skipping what is already present.
#[derive(Parser, Debug)]
#[command(name = "datasync")]
#[command(author, version, about)]
pub struct Args {
    /// Directory holding the release's annotation JSON files
    #[arg(long, requires = "images", conflicts_with = "dataset")]
    pub annotations: Option<PathBuf>,

    /// Directory media is written to
    #[arg(long, requires = "annotations", conflicts_with = "dataset")]
    pub images: Option<PathBuf>,

    /// Local dataset directory (`<team>/<dataset>`), used with --release
    #[arg(long, requires = "release")]
    pub dataset: Option<PathBuf>,

    /// Release name under <dataset>/releases
    #[arg(long, requires = "dataset")]
    pub release: Option<String>,

    /// API key sent with requests that are not pre-signed
    #[arg(long, env = "DATASYNC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Mirror remote folders under the images directory
    #[arg(long)]
    pub use_folders: bool,

    /// Download videos as numbered PNG frames
    ///
    /// Long videos are decoded locally and need a build with the `video` feature.
    #[arg(long)]
    pub video_frames: bool,

    /// Always lay out items one directory per slot
    #[arg(long)]
    pub force_slots: bool,

    /// Only download the first slot of every item
    #[arg(long)]
    pub ignore_slots: bool,

    /// Download files even if they already exist
    #[arg(long)]
    pub force_replace: bool,

    /// Delete local media with no matching annotation
    #[arg(long)]
    pub remove_extra: bool,

    /// Run downloads one at a time, in order
    #[arg(long)]
    pub sequential: bool,

    /// Maximum concurrent downloads (defaults to the number of CPUs)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub workers: Option<u16>,

    /// Print the planned tasks as JSON lines instead of running them
    #[arg(long)]
    pub plan_only: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// The annotations and images directories to pull between.
    ///
    /// Returns `None` when neither `--annotations/--images` nor
    /// `--dataset/--release` was given.
    #[must_use]
    pub fn directories(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.annotations, &self.images, &self.dataset, &self.release) {
            (Some(annotations), Some(images), _, _) => Some((annotations.clone(), images.clone())),
            (_, _, Some(dataset), Some(release)) => {
                let layout = DatasetLayout::new(dataset);
                Some((layout.annotations_dir(release), layout.images_dir()))
            }
            _ => None,
        }
    }

    /// Pull options selected by the flags.
    #[must_use]
    pub fn pull_options(&self) -> PullOptions {
        PullOptions {
            plan: PlanOptions {
                use_folders: self.use_folders,
                video_frames: self.video_frames,
                force_slots: self.force_slots,
                ignore_slots: self.ignore_slots,
                ..PlanOptions::default()
            },
            force_replace: self.force_replace,
            remove_extra: self.remove_extra,
        }
    }
}
