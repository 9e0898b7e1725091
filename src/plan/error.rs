//! Error types for download planning.

use std::path::PathBuf;

use thiserror::Error;

use crate::annotation::AnnotationError;
use crate::manifest::ManifestError;

/// Errors that stop one annotation from being planned.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A destination directory could not be created.
    #[error("failed to create {path}: {source}")]
    Io {
        /// Directory being created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The annotation could not be loaded.
    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    /// The frame manifests of a long video could not be assembled.
    #[error("frame manifest of '{item}': {source}")]
    Manifest {
        /// Item file name.
        item: String,
        /// Underlying manifest error.
        #[source]
        source: ManifestError,
    },

    /// The manifests describe more segments than the slot lists.
    #[error("'{item}' has no segment URL for segment #{position} ({available} listed)")]
    MissingSegment {
        /// Item file name.
        item: String,
        /// Position of the segment in manifest order.
        position: usize,
        /// Segment URLs the slot lists.
        available: usize,
    },

    /// The per-slot layout needs every slot to be named.
    #[error("'{item}' has an unnamed slot; per-slot layout requires slot names")]
    MissingSlotName {
        /// Item file name.
        item: String,
    },
}

impl PlanError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
