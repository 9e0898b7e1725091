//! Error types for segment frame extraction.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding a segment container and writing its frames.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The codec backend is not available in this build or on this host.
    #[error("missing optional dependency '{dependency}': {hint}")]
    MissingDependency {
        /// Name of the missing library.
        dependency: &'static str,
        /// What to do about it.
        hint: String,
    },

    /// The container could not be opened or a frame could not be decoded.
    #[error("failed to decode {path}: {message}")]
    Decode {
        /// Segment container.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// The stream ended before every visible frame was found.
    #[error("segment {segment} ended with {missing} visible frame(s) not decoded")]
    Exhausted {
        /// Segment id.
        segment: u64,
        /// Visible frames never reached.
        missing: usize,
    },

    /// A directory or file could not be accessed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A decoded frame could not be encoded to disk.
    #[error("failed to write frame {path}: {source}")]
    Image {
        /// Frame file.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },
}

impl ExtractError {
    /// Creates a decode error from any displayable decoder failure.
    pub fn decode(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when extraction cannot run at all in this build.
    #[must_use]
    pub fn is_missing_dependency(&self) -> bool {
        matches!(self, Self::MissingDependency { .. })
    }
}
