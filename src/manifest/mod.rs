//! Frame manifests of long videos.
//!
//! A long video is stored as time-segmented containers. Each manifest line
//! `frame:segment:visibility:timestamp` describes one frame; the assembler
//! merges every manifest of a slot into [`SegmentManifest`]s ordered by
//! segment id, numbering visible frames and absolute positions as it goes.
//!
//! # Example
//!
//! ```
//! use datasync::manifest::build_segments;
//!
//! let segments = build_segments(&[("m.txt", "0:0:1:0.0\n1:0:0:0.04\n")]).unwrap();
//! assert_eq!(segments[0].total_frames, 2);
//! assert_eq!(segments[0].items[0].visible_frame_index, Some(0));
//! ```

mod error;
mod parse;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::download::FetchClient;

pub use error::ManifestError;
pub use parse::build_segments;

/// One decoded manifest line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestItem {
    /// Segment-local frame ordinal.
    pub frame: u64,
    /// Segment id.
    pub segment: u64,
    /// Whether the frame is part of the visible (annotated) timeline.
    pub visible: bool,
    /// Presentation timestamp in seconds.
    pub timestamp: f64,
    /// Position in the visible timeline; set only for visible frames.
    pub visible_frame_index: Option<u64>,
    /// Position among all frames of the slot, in segment order.
    pub absolute_frame: u64,
}

/// All manifest items of one segment, sorted by frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    /// Segment id.
    pub segment: u64,
    /// Number of items in the segment.
    pub total_frames: usize,
    /// Items, ascending by frame.
    pub items: Vec<ManifestItem>,
}

impl SegmentManifest {
    /// Maps each visible segment-local frame to its visible index.
    #[must_use]
    pub fn visible_lookup(&self) -> BTreeMap<u64, u64> {
        self.items
            .iter()
            .filter_map(|item| item.visible_frame_index.map(|v| (item.frame, v)))
            .collect()
    }

    /// Visible indices of this segment, ascending by frame.
    pub fn visible_frame_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().filter_map(|item| item.visible_frame_index)
    }
}

/// Downloads every manifest of a slot and builds its segment manifests.
///
/// Manifests go to a temporary directory created inside `scratch_parent`
/// (so it shares a filesystem with the destination) that is removed on
/// every exit path. Each download uses the retrying session.
///
/// # Errors
///
/// Returns [`ManifestError::Fetch`] for any failed download and
/// [`ManifestError::MalformedLine`] for an unparseable line.
#[instrument(skip(client, urls), fields(manifests = urls.len(), scratch = %scratch_parent.display()))]
pub async fn assemble(
    client: &FetchClient,
    urls: &[&str],
    scratch_parent: &Path,
) -> Result<Vec<SegmentManifest>, ManifestError> {
    tokio::fs::create_dir_all(scratch_parent)
        .await
        .map_err(|e| ManifestError::io(scratch_parent, e))?;
    let scratch =
        tempfile::TempDir::new_in(scratch_parent).map_err(|e| ManifestError::io(scratch_parent, e))?;

    let mut files = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let name = format!("manifest_{}.txt", index + 1);
        let path = scratch.path().join(&name);
        client.download_with_retry(url, &path).await?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ManifestError::io(&path, e))?;
        debug!(%name, bytes = contents.len(), "fetched frame manifest");
        files.push((name, contents));
    }

    build_segments(&files)
}
