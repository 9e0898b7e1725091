//! Filename sanitization, extension checks and URL-derived names.

use std::path::Path;

use url::Url;

/// Image extensions recognised as already-materialized media.
pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 8] = [
    ".png", ".jpeg", ".jpg", ".jfif", ".tif", ".tiff", ".bmp", ".svs",
];

/// Video (and multi-frame document) extensions recognised as media.
pub const SUPPORTED_VIDEO_EXTENSIONS: [&str; 7] =
    [".avi", ".bpm", ".dcm", ".mov", ".mp4", ".pdf", ".ndpi"];

/// Characters replaced with `_` on every platform.
const FORBIDDEN_CHARS: [char; 8] = ['<', '>', '"', '/', '\\', '|', '?', '*'];

/// Replaces characters that cannot appear in a file name with `_`.
///
/// `:` is also replaced on targets that are not Unix-like.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || (!cfg!(unix) && c == ':') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Returns whether the extension (with leading dot, any case) is an image extension.
#[must_use]
pub fn is_image_extension_allowed(extension: &str) -> bool {
    let lower = extension.to_lowercase();
    SUPPORTED_IMAGE_EXTENSIONS.contains(&lower.as_str())
}

/// Returns whether the extension is an image or video extension.
#[must_use]
pub fn is_extension_allowed(extension: &str) -> bool {
    let lower = extension.to_lowercase();
    SUPPORTED_IMAGE_EXTENSIONS.contains(&lower.as_str())
        || SUPPORTED_VIDEO_EXTENSIONS.contains(&lower.as_str())
}

/// Returns the dotted extension of a path, or an empty string.
#[must_use]
pub fn dotted_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Returns whether a path carries a supported media extension.
#[must_use]
pub fn is_media_path(path: &Path) -> bool {
    is_extension_allowed(&dotted_extension(path))
}

/// Name of the last path segment of a URL, percent-decoded.
///
/// Returns `None` when the URL cannot be parsed or ends in `/`.
#[must_use]
pub fn last_path_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(sanitize_filename(&decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_replaces_forbidden() {
        assert_eq!(sanitize_filename(r#"a<b>c"d/e\f|g?h*i"#), "a_b_c_d_e_f_g_h_i");
    }

    #[test]
    fn test_sanitize_filename_keeps_regular_names() {
        assert_eq!(sanitize_filename("scan 01 (final).dcm"), "scan 01 (final).dcm");
    }

    #[cfg(unix)]
    #[test]
    fn test_sanitize_filename_keeps_colon_on_unix() {
        assert_eq!(sanitize_filename("10:30.png"), "10:30.png");
    }

    #[cfg(not(unix))]
    #[test]
    fn test_sanitize_filename_replaces_colon_elsewhere() {
        assert_eq!(sanitize_filename("10:30.png"), "10_30.png");
    }

    #[test]
    fn test_extension_checks_ignore_case() {
        assert!(is_image_extension_allowed(".PNG"));
        assert!(!is_image_extension_allowed(".mp4"));
        assert!(is_extension_allowed(".mp4"));
        assert!(is_extension_allowed(".Jpg"));
        assert!(!is_extension_allowed(".json"));
    }

    #[test]
    fn test_is_media_path() {
        assert!(is_media_path(Path::new("/a/b/c.tiff")));
        assert!(!is_media_path(Path::new("/a/b/c.txt")));
        assert!(!is_media_path(Path::new("/a/b/noext")));
    }

    #[test]
    fn test_last_path_segment() {
        assert_eq!(
            last_path_segment("http://x/files/a.dcm?sig=1").as_deref(),
            Some("a.dcm")
        );
        assert_eq!(
            last_path_segment("http://x/files/my%20scan.dcm").as_deref(),
            Some("my scan.dcm")
        );
        assert_eq!(last_path_segment("http://x/files/"), None);
        assert_eq!(last_path_segment("not a url"), None);
    }
}
