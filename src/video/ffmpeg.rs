//! FFmpeg-backed frame decoding.

use std::path::{Path, PathBuf};

use ffmpeg_next::{
    Error as FfmpegError, Packet,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    format::{Pixel, context::Input},
    frame::Video as VideoFrame,
    media::Type as MediaType,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::RgbImage;
use tracing::debug;

use super::{ExtractError, FrameExtractor, FrameSource, extract_visible_frames};
use crate::manifest::SegmentManifest;

/// Sequential RGB frame reader over one container's best video stream.
pub struct FfmpegFrameSource {
    path: PathBuf,
    input: Input,
    decoder: VideoDecoder,
    scaler: ScalingContext,
    stream_index: usize,
    decoded: VideoFrame,
    eof_sent: bool,
}

impl FfmpegFrameSource {
    /// Opens `path` and prepares a decoder for its best video stream.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Decode`] when the container has no decodable
    /// video stream.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        let input = ffmpeg_next::format::input(&path).map_err(|e| ExtractError::decode(path, e))?;
        let (stream_index, parameters) = {
            let stream = input
                .streams()
                .best(MediaType::Video)
                .ok_or_else(|| ExtractError::decode(path, "no video stream"))?;
            (stream.index(), stream.parameters())
        };
        let decoder = CodecContext::from_parameters(parameters)
            .and_then(|context| context.decoder().video())
            .map_err(|e| ExtractError::decode(path, e))?;
        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ScalingFlags::BILINEAR,
        )
        .map_err(|e| ExtractError::decode(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            input,
            decoder,
            scaler,
            stream_index,
            decoded: VideoFrame::empty(),
            eof_sent: false,
        })
    }

    fn convert_current_frame(&mut self) -> Result<RgbImage, ExtractError> {
        let mut rgb = VideoFrame::empty();
        self.scaler
            .run(&self.decoded, &mut rgb)
            .map_err(|e| ExtractError::decode(&self.path, e))?;
        let (width, height) = (rgb.width(), rgb.height());
        RgbImage::from_raw(width, height, packed_rgb(&rgb, width, height))
            .ok_or_else(|| ExtractError::decode(&self.path, "frame buffer size mismatch"))
    }
}

impl FrameSource for FfmpegFrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, ExtractError> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_current_frame().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .map_err(|e| ExtractError::decode(&self.path, e))?;
                    }
                }
                Err(FfmpegError::Eof) => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| ExtractError::decode(&self.path, e))?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(ExtractError::decode(&self.path, e)),
            }
        }
    }
}

/// Copies the RGB plane of `frame` without row padding.
fn packed_rgb(frame: &VideoFrame, width: u32, height: u32) -> Vec<u8> {
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;
    let data = frame.data(0);
    if stride == row_bytes {
        return data[..row_bytes * height as usize].to_vec();
    }
    let mut buffer = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        buffer.extend_from_slice(&data[start..start + row_bytes]);
    }
    buffer
}

/// [`FrameExtractor`] decoding with FFmpeg.
#[derive(Debug)]
pub struct FfmpegExtractor(());

impl FfmpegExtractor {
    /// Initialises FFmpeg.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::MissingDependency`] when the libraries cannot
    /// be initialised.
    pub fn new() -> Result<Self, ExtractError> {
        ffmpeg_next::init().map_err(|e| ExtractError::MissingDependency {
            dependency: "ffmpeg",
            hint: format!("FFmpeg failed to initialise ({e}); check the installed libraries"),
        })?;
        Ok(Self(()))
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn extract(&self, segment: &Path, manifest: &SegmentManifest) -> Result<usize, ExtractError> {
        let out_dir = segment.parent().unwrap_or_else(|| Path::new("."));
        let mut source = FfmpegFrameSource::open(segment)?;
        let written = extract_visible_frames(&mut source, manifest, out_dir)?;
        debug!(segment = %segment.display(), written, "decoded segment");
        Ok(written)
    }
}
