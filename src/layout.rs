//! On-disk layout of a pulled dataset.
//!
//! ```text
//! <dataset>/
//!   images/[<remote path>/]<item>[/<slot>[/sections]]/<file or frame>
//!   releases/<release>/annotations/*.json
//! ```

use std::path::{Path, PathBuf};

/// Directory names of a local dataset checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    /// Layout rooted at `<team>/<dataset>`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The dataset directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where media is materialized.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Parent of every release.
    #[must_use]
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// Annotation JSON files of `release`.
    #[must_use]
    pub fn annotations_dir(&self, release: &str) -> PathBuf {
        self.releases_dir().join(release).join("annotations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = DatasetLayout::new("team/bees");
        assert_eq!(layout.root(), Path::new("team/bees"));
        assert_eq!(layout.images_dir(), PathBuf::from("team/bees/images"));
        assert_eq!(
            layout.annotations_dir("latest"),
            PathBuf::from("team/bees/releases/latest/annotations")
        );
    }
}
