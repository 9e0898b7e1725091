//! Parsed remote item descriptors.
//!
//! An [`AnnotationFile`] is a read-only snapshot of one exported item: its
//! file name, its folder in the remote dataset, and its [`Slot`]s. Both the
//! 2.x export layout (`item.slots[]`) and the legacy 1.x layout (`image`) are
//! accepted; a 1.x item becomes a single unnamed slot.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Slot type of still images. Every other type is treated as video.
pub const IMAGE_SLOT_TYPE: &str = "image";

/// Errors raised while loading or patching an annotation file.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// The file could not be read or written.
    #[error("IO error on annotation {path}: {source}")]
    Io {
        /// Annotation path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or does not match the export schema.
    #[error("invalid annotation JSON in {path}: {source}")]
    Json {
        /// Annotation path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The JSON has neither an `item` nor an `image` section.
    #[error("unsupported annotation format in {path}")]
    UnsupportedFormat {
        /// Annotation path.
        path: PathBuf,
    },
}

/// One file uploaded to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Download URL.
    pub url: String,
    /// Original file name.
    pub file_name: String,
}

/// A URL-only reference (frame manifest or segment container).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRef {
    /// Download URL.
    pub url: String,
}

/// One logical channel of an item (a DICOM series, a video track, an image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot name; absent for legacy items.
    #[serde(rename = "slot_name", default)]
    pub name: Option<String>,
    /// `"image"`, `"video"`, `"dicom"`, ...
    #[serde(rename = "type", default = "default_slot_type")]
    pub slot_type: String,
    /// Uploaded files.
    #[serde(default)]
    pub source_files: Vec<SourceFile>,
    /// Per-frame URLs of short videos.
    #[serde(default)]
    pub frame_urls: Option<Vec<String>>,
    /// Per-segment frame manifests of long videos.
    #[serde(default)]
    pub frame_manifests: Option<Vec<UrlRef>>,
    /// Segment containers of long videos, in segment order.
    #[serde(default)]
    pub segments: Option<Vec<UrlRef>>,
    /// Free-form metadata; may carry a `colorspace` hint.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

fn default_slot_type() -> String {
    IMAGE_SLOT_TYPE.to_string()
}

impl Slot {
    /// Whether this slot holds a still image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.slot_type == IMAGE_SLOT_TYPE
    }

    /// The `colorspace` metadata hint, if any.
    #[must_use]
    pub fn colorspace(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("colorspace"))
            .and_then(Value::as_str)
    }

    /// Non-empty per-frame URLs.
    #[must_use]
    pub fn frame_urls(&self) -> Option<&[String]> {
        self.frame_urls.as_deref().filter(|urls| !urls.is_empty())
    }

    /// Manifest URLs, empty when absent.
    #[must_use]
    pub fn manifest_urls(&self) -> Vec<&str> {
        self.frame_manifests
            .iter()
            .flatten()
            .map(|m| m.url.as_str())
            .collect()
    }

    /// Segment URLs, empty when absent.
    #[must_use]
    pub fn segment_urls(&self) -> Vec<&str> {
        self.segments
            .iter()
            .flatten()
            .map(|s| s.url.as_str())
            .collect()
    }

    /// Key slots are ordered by; a missing name sorts as `"0"`.
    #[must_use]
    pub fn sort_key(&self) -> &str {
        self.name.as_deref().unwrap_or("0")
    }
}

/// One parsed remote item.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationFile {
    /// Where the annotation JSON lives on disk.
    pub path: PathBuf,
    /// Item file name.
    pub filename: String,
    /// Folder of the item in the remote dataset (`/` for the root).
    pub remote_path: String,
    /// Major version of the export schema.
    pub version_major: u32,
    /// Slots, in export order until [`sort_slots`](Self::sort_slots) is called.
    pub slots: Vec<Slot>,
}

#[derive(Deserialize)]
struct RawItem {
    name: String,
    #[serde(default = "root_path")]
    path: String,
    #[serde(default)]
    slots: Vec<Slot>,
}

#[derive(Deserialize)]
struct RawLegacyImage {
    filename: String,
    #[serde(default = "root_path")]
    path: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    frame_urls: Option<Vec<String>>,
}

fn root_path() -> String {
    "/".to_string()
}

impl AnnotationFile {
    /// Reads and parses the annotation JSON at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotationError`] when the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, AnnotationError> {
        let text = std::fs::read_to_string(path).map_err(|source| AnnotationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(path, &text)
    }

    /// Parses annotation JSON text; `path` is recorded as its location.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotationError`] when the text does not match either layout.
    pub fn from_json_str(path: &Path, text: &str) -> Result<Self, AnnotationError> {
        let json_error = |source| AnnotationError::Json {
            path: path.to_path_buf(),
            source,
        };
        let mut value: Value = serde_json::from_str(text).map_err(json_error)?;

        if let Some(item) = value.get_mut("item").map(Value::take) {
            let version_major = value
                .get("version")
                .and_then(Value::as_str)
                .and_then(parse_major)
                .unwrap_or(2);
            let item: RawItem = serde_json::from_value(item).map_err(json_error)?;
            return Ok(Self {
                path: path.to_path_buf(),
                filename: item.name,
                remote_path: item.path,
                version_major,
                slots: item.slots,
            });
        }

        if let Some(image) = value.get_mut("image").map(Value::take) {
            let image: RawLegacyImage = serde_json::from_value(image).map_err(json_error)?;
            let is_video = image.frame_urls.is_some();
            let slot = Slot {
                name: None,
                slot_type: if is_video { "video" } else { IMAGE_SLOT_TYPE }.to_string(),
                source_files: image
                    .url
                    .map(|url| SourceFile {
                        url,
                        file_name: image.filename.clone(),
                    })
                    .into_iter()
                    .collect(),
                frame_urls: image.frame_urls,
                frame_manifests: None,
                segments: None,
                metadata: None,
            };
            return Ok(Self {
                path: path.to_path_buf(),
                filename: image.filename,
                remote_path: image.path,
                version_major: 1,
                slots: vec![slot],
            });
        }

        Err(AnnotationError::UnsupportedFormat {
            path: path.to_path_buf(),
        })
    }

    /// Orders slots by name; a missing name sorts as `"0"`.
    pub fn sort_slots(&mut self) {
        self.slots.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
    }

    /// Whether this item must be laid out one directory per slot.
    ///
    /// True when it has more than one slot or a slot with more than one file.
    #[must_use]
    pub fn needs_slot_layout(&self) -> bool {
        self.slots.len() > 1 || self.slots.iter().any(|s| s.source_files.len() > 1)
    }

    /// File stem of the annotation JSON.
    #[must_use]
    pub fn annotation_stem(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
    }
}

fn parse_major(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Writes `local_path` into every `item.slots[].source_files[]` entry of
/// the raw annotation JSON whose `url` equals `url`.
///
/// Returns whether any entry matched. Other fields are preserved.
///
/// # Errors
///
/// Returns [`AnnotationError`] when the file cannot be read, parsed or written.
pub fn record_local_path(
    annotation_path: &Path,
    url: &str,
    local_path: &Path,
) -> Result<bool, AnnotationError> {
    let io_error = |source| AnnotationError::Io {
        path: annotation_path.to_path_buf(),
        source,
    };
    let json_error = |source| AnnotationError::Json {
        path: annotation_path.to_path_buf(),
        source,
    };

    let text = std::fs::read_to_string(annotation_path).map_err(io_error)?;
    let mut raw: Value = serde_json::from_str(&text).map_err(json_error)?;

    let mut matched = false;
    let slots = raw
        .get_mut("item")
        .and_then(|item| item.get_mut("slots"))
        .and_then(Value::as_array_mut);
    for slot in slots.into_iter().flatten() {
        let files = slot.get_mut("source_files").and_then(Value::as_array_mut);
        for source_file in files.into_iter().flatten() {
            if source_file.get("url").and_then(Value::as_str) == Some(url)
                && let Some(entry) = source_file.as_object_mut()
            {
                entry.insert(
                    "local_path".to_string(),
                    Value::String(local_path.to_string_lossy().into_owned()),
                );
                matched = true;
            }
        }
    }

    if matched {
        let pretty = serde_json::to_string_pretty(&raw).map_err(json_error)?;
        std::fs::write(annotation_path, pretty).map_err(io_error)?;
    }
    Ok(matched)
}
