//! Post-write pixel transforms.
//!
//! A transform runs once a file is completely written, in place, and applies
//! to every file a fetch produces (including indirection sub-files).

use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat, ImageReader, Luma};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Slot metadata value selecting [`PixelTransform::Rg16ToGrayscale`].
pub const RG16_COLORSPACE: &str = "RG16";

/// Errors raised while transforming a written file.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The file could not be opened or decoded.
    #[error("failed to decode {path} for pixel transform: {source}")]
    Decode {
        /// File that was being transformed.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// The transformed image could not be written back.
    #[error("failed to write transformed image {path}: {source}")]
    Encode {
        /// File that was being transformed.
        path: PathBuf,
        /// Underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// The file could not be read from disk.
    #[error("IO error transforming {path}: {source}")]
    Io {
        /// File that was being transformed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// A pixel reinterpretation applied after download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelTransform {
    /// 16-bit values packed as R (high byte) and G (low byte), reduced to 8-bit grayscale.
    Rg16ToGrayscale,
}

impl PixelTransform {
    /// Picks the transform for a slot's `colorspace` metadata hint.
    #[must_use]
    pub fn for_colorspace(colorspace: Option<&str>) -> Option<Self> {
        match colorspace {
            Some(RG16_COLORSPACE) => Some(Self::Rg16ToGrayscale),
            _ => None,
        }
    }

    /// Applies the transform to the file at `path`, overwriting it.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the file cannot be decoded or rewritten.
    pub fn apply(self, path: &Path) -> Result<(), TransformError> {
        match self {
            Self::Rg16ToGrayscale => rg16_to_grayscale(path),
        }
    }
}

fn rg16_to_grayscale(path: &Path) -> Result<(), TransformError> {
    let decoded = ImageReader::open(path)
        .map_err(|source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let format = decoded.format().unwrap_or(ImageFormat::Png);
    let rgb = decoded
        .decode()
        .map_err(|source| TransformError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let (width, height) = rgb.dimensions();
    let gray = GrayImage::from_fn(width, height, |x, y| {
        let pixel = rgb.get_pixel(x, y);
        Luma([rg16_to_gray8(pixel[0], pixel[1])])
    });

    gray.save_with_format(path, format)
        .map_err(|source| TransformError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), width, height, "converted RG16 image to grayscale");
    Ok(())
}

/// `((r << 8) | g) / 65536 * 255`, truncated.
fn rg16_to_gray8(r: u8, g: u8) -> u8 {
    let value = (u32::from(r) << 8) | u32::from(g);
    u8::try_from(value * 255 / 65_536).unwrap_or(u8::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_for_colorspace() {
        assert_eq!(
            PixelTransform::for_colorspace(Some("RG16")),
            Some(PixelTransform::Rg16ToGrayscale)
        );
        assert_eq!(PixelTransform::for_colorspace(Some("sRGB")), None);
        assert_eq!(PixelTransform::for_colorspace(None), None);
    }

    #[test]
    fn test_rg16_to_gray8_scaling() {
        assert_eq!(rg16_to_gray8(0, 0), 0);
        assert_eq!(rg16_to_gray8(255, 255), 254);
        assert_eq!(rg16_to_gray8(128, 0), 127);
        assert_eq!(rg16_to_gray8(1, 0), 0);
    }

    #[test]
    fn test_apply_rewrites_file_as_grayscale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slice.png");
        let mut source = RgbImage::new(2, 1);
        source.put_pixel(0, 0, Rgb([255, 255, 9]));
        source.put_pixel(1, 0, Rgb([128, 0, 77]));
        source.save(&path).unwrap();

        PixelTransform::Rg16ToGrayscale.apply(&path).unwrap();

        let result = image::open(&path).unwrap();
        assert_eq!(result.color(), image::ColorType::L8);
        let gray = result.to_luma8();
        assert_eq!(gray.get_pixel(0, 0)[0], 254);
        assert_eq!(gray.get_pixel(1, 0)[0], 127);
    }

    #[test]
    fn test_apply_reports_undecodable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(PixelTransform::Rg16ToGrayscale.apply(&path).is_err());
    }
}
