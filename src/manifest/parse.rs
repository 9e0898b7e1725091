//! Line parsing and segment grouping.

use std::collections::BTreeMap;

use tracing::debug;

use super::error::ManifestError;
use super::{ManifestItem, SegmentManifest};

/// Number of colon-separated fields on a manifest line.
const FIELD_COUNT: usize = 4;

/// One decoded line before index assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ManifestLine {
    pub frame: u64,
    pub segment: u64,
    pub visible: bool,
    pub timestamp: f64,
}

/// Parses `frame:segment:visibility:timestamp`.
///
/// Returns the reason on failure.
pub(crate) fn parse_line(line: &str) -> Result<ManifestLine, String> {
    let fields: Vec<&str> = line.split(':').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(format!(
            "expected {FIELD_COUNT} fields, found {}",
            fields.len()
        ));
    }

    let frame = fields[0]
        .parse::<u64>()
        .map_err(|e| format!("invalid frame '{}': {e}", fields[0]))?;
    let segment = fields[1]
        .parse::<u64>()
        .map_err(|e| format!("invalid segment '{}': {e}", fields[1]))?;
    let visible = match fields[2] {
        "0" => false,
        "1" => true,
        other => return Err(format!("invalid visibility '{other}', expected 0 or 1")),
    };
    let timestamp = fields[3]
        .parse::<f64>()
        .map_err(|e| format!("invalid timestamp '{}': {e}", fields[3]))?;

    Ok(ManifestLine {
        frame,
        segment,
        visible,
        timestamp,
    })
}

/// Builds ordered segment manifests from the text of every manifest file.
///
/// `files` holds `(file name, contents)` pairs in listing order. Visible
/// indices run across all files in line order; absolute frames run across
/// all items in segment order after each segment is sorted by frame.
/// Blank lines are ignored.
///
/// # Errors
///
/// Returns [`ManifestError::MalformedLine`] for the first line that cannot
/// be parsed.
pub fn build_segments<S: AsRef<str>>(
    files: &[(S, S)],
) -> Result<Vec<SegmentManifest>, ManifestError> {
    let mut by_segment: BTreeMap<u64, Vec<ManifestItem>> = BTreeMap::new();
    let mut next_visible = 0u64;

    for (name, contents) in files {
        for (index, raw) in contents.as_ref().lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let line = parse_line(raw)
                .map_err(|reason| ManifestError::malformed(name.as_ref(), index + 1, raw, &reason))?;

            let visible_frame_index = line.visible.then(|| {
                let current = next_visible;
                next_visible += 1;
                current
            });
            by_segment.entry(line.segment).or_default().push(ManifestItem {
                frame: line.frame,
                segment: line.segment,
                visible: line.visible,
                timestamp: line.timestamp,
                visible_frame_index,
                absolute_frame: 0,
            });
        }
    }

    let mut absolute = 0u64;
    let segments: Vec<SegmentManifest> = by_segment
        .into_iter()
        .map(|(segment, mut items)| {
            items.sort_by_key(|item| item.frame);
            for item in &mut items {
                item.absolute_frame = absolute;
                absolute += 1;
            }
            SegmentManifest {
                segment,
                total_frames: items.len(),
                items,
            }
        })
        .collect();

    debug!(
        segments = segments.len(),
        frames = absolute,
        visible = next_visible,
        "assembled frame manifest"
    );
    Ok(segments)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_valid() {
        let line = parse_line("12:3:1:0.48").unwrap();
        assert_eq!(line.frame, 12);
        assert_eq!(line.segment, 3);
        assert!(line.visible);
        assert!((line.timestamp - 0.48).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_line_trims_whitespace() {
        let line = parse_line(" 0:0:0:1.5\r").unwrap();
        assert_eq!(line.frame, 0);
        assert!(!line.visible);
    }

    #[test]
    fn test_parse_line_rejects_field_count() {
        let reason = parse_line("1:2:1").unwrap_err();
        assert!(reason.contains("expected 4 fields"));
    }

    #[test]
    fn test_parse_line_rejects_visibility() {
        let reason = parse_line("1:2:yes:0.0").unwrap_err();
        assert!(reason.contains("visibility"));
    }

    #[test]
    fn test_parse_line_rejects_non_numeric_frame() {
        assert!(parse_line("a:0:1:0.0").unwrap_err().contains("frame"));
    }

    #[test]
    fn test_empty_file_yields_no_segments() {
        let segments = build_segments(&[("m.txt", "")]).unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn test_build_segments_sorts_and_numbers() {
        let first = "1:1:1:0.1\n0:1:0:0.0\n";
        let second = "\n1:0:1:0.3\n0:0:1:0.2\n";
        let segments = build_segments(&[("a.txt", first), ("b.txt", second)]).unwrap();

        assert_eq!(
            segments.iter().map(|s| s.segment).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let seg0 = &segments[0];
        assert_eq!(seg0.total_frames, 2);
        assert_eq!(
            seg0.items.iter().map(|i| i.frame).collect::<Vec<_>>(),
            vec![0, 1]
        );
        // visible indices follow line order across files
        assert_eq!(seg0.items[0].visible_frame_index, Some(2));
        assert_eq!(seg0.items[1].visible_frame_index, Some(1));

        let seg1 = &segments[1];
        assert_eq!(seg1.items[0].visible_frame_index, None);
        assert_eq!(seg1.items[1].visible_frame_index, Some(0));

        let absolute: Vec<u64> = segments
            .iter()
            .flat_map(|s| s.items.iter().map(|i| i.absolute_frame))
            .collect();
        assert_eq!(absolute, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_malformed_line_reports_file_and_line() {
        let err = build_segments(&[("m.txt", "0:0:1:0.0\n\nbroken\n")]).unwrap_err();
        match err {
            ManifestError::MalformedLine {
                file, line_number, ..
            } => {
                assert_eq!(file, "m.txt");
                assert_eq!(line_number, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
