//! Error types for frame manifest assembly.

use std::path::PathBuf;

use thiserror::Error;

use crate::download::DownloadError;

/// Errors that can occur while fetching or parsing frame manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A manifest file could not be downloaded.
    #[error("failed to fetch frame manifest: {0}")]
    Fetch(#[from] DownloadError),

    /// The scratch directory or a downloaded manifest could not be accessed.
    #[error("IO error on manifest scratch {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line did not match `frame:segment:visibility:timestamp`.
    #[error("malformed manifest line {line_number} in {file}: {reason} (line: '{line}')")]
    MalformedLine {
        /// Manifest file name.
        file: String,
        /// 1-based line number.
        line_number: usize,
        /// The offending line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ManifestError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a malformed-line error.
    #[must_use]
    pub fn malformed(file: &str, line_number: usize, line: &str, reason: &str) -> Self {
        Self::MalformedLine {
            file: file.to_string(),
            line_number,
            line: line.to_string(),
            reason: reason.to_string(),
        }
    }
}
