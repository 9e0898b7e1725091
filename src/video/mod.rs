//! Frame-accurate extraction of visible frames from segment containers.
//!
//! Decoding is strictly sequential from the first frame: seeking inside
//! segment containers is not reliable enough to land on exact frames. The
//! codec itself sits behind [`FrameSource`]; the matching of decoded
//! frames against the manifest lives in [`extract_visible_frames`] and is
//! shared by every backend.

mod error;
#[cfg(feature = "video")]
mod ffmpeg;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{ImageFormat, RgbImage};
use tracing::{debug, instrument};

use crate::manifest::SegmentManifest;

pub use error::ExtractError;
#[cfg(feature = "video")]
pub use ffmpeg::{FfmpegExtractor, FfmpegFrameSource};

/// Directory (relative to a video's directory) holding extracted frames.
pub const SECTIONS_DIR: &str = "sections";

/// A sequential stream of decoded frames.
pub trait FrameSource {
    /// Decodes the next frame, or returns `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Decode`] when the stream cannot be read.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, ExtractError>;
}

/// A codec backend able to turn a downloaded segment into frame files.
pub trait FrameExtractor: Send + Sync {
    /// Decodes `segment` and writes its visible frames next to it.
    ///
    /// Returns the number of frames written.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] on decode failure or exhaustion.
    fn extract(&self, segment: &Path, manifest: &SegmentManifest) -> Result<usize, ExtractError>;
}

/// Path of the frame with visible index `visible` inside `dir`.
#[must_use]
pub fn frame_path(dir: &Path, visible: u64) -> PathBuf {
    dir.join(format!("{visible:07}.png"))
}

/// Writes every visible frame of `manifest` decoded from `source` into `out_dir`.
///
/// Frames are matched by their decode position against the manifest's
/// segment-local frame numbers. Decoding stops as soon as every visible
/// frame has been written. Frames already written stay on disk if the
/// stream runs out early.
///
/// # Errors
///
/// Returns [`ExtractError::Exhausted`] when the stream ends first, and
/// decode or write errors as they occur.
#[instrument(skip(source, manifest), fields(segment = manifest.segment, out_dir = %out_dir.display()))]
pub fn extract_visible_frames(
    source: &mut dyn FrameSource,
    manifest: &SegmentManifest,
    out_dir: &Path,
) -> Result<usize, ExtractError> {
    let mut pending = manifest.visible_lookup();
    if pending.is_empty() {
        return Ok(0);
    }
    std::fs::create_dir_all(out_dir).map_err(|e| ExtractError::io(out_dir, e))?;

    let mut written = 0usize;
    let mut position = 0u64;
    while !pending.is_empty() {
        let Some(frame) = source.next_frame()? else {
            return Err(ExtractError::Exhausted {
                segment: manifest.segment,
                missing: pending.len(),
            });
        };
        if let Some(visible) = pending.remove(&position) {
            let path = frame_path(out_dir, visible);
            frame
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|source| ExtractError::Image { path, source })?;
            written += 1;
        }
        position += 1;
    }

    debug!(written, decoded = position, "extracted visible frames");
    Ok(written)
}

/// Returns the extractor compiled into this build.
///
/// # Errors
///
/// Returns [`ExtractError::MissingDependency`] when the crate was built
/// without the `video` feature or FFmpeg fails to initialise.
pub fn default_extractor() -> Result<Arc<dyn FrameExtractor>, ExtractError> {
    #[cfg(feature = "video")]
    {
        Ok(Arc::new(FfmpegExtractor::new()?))
    }
    #[cfg(not(feature = "video"))]
    {
        Err(ExtractError::MissingDependency {
            dependency: "ffmpeg",
            hint: "long-video extraction needs FFmpeg; rebuild with `--features video`"
                .to_string(),
        })
    }
}
