//! RGBA frames: YUYV conversion, dark-frame check, JPEG encoding.

use crate::encode::EncodedImage;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};

/// A captured RGBA camera frame.
#[derive(Clone)]
pub struct Frame {
    /// RGBA pixel data (width * height * 4 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap an RGBA buffer, checking that it holds exactly `width * height` pixels.
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 4) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        })
    }

    /// Convert a decoded image of any color type into an RGBA frame.
    pub fn from_image(img: &DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            data: rgba.into_raw(),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.data.len() / 4
    }

    /// Average per-pixel brightness `(R+G+B)/3` (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.pixel_count();
        if pixels == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .data
            .chunks_exact(4)
            .map(|px| px[0] as u64 + px[1] as u64 + px[2] as u64)
            .sum();
        sum as f32 / (pixels as f32 * 3.0)
    }

    /// Encode as a JPEG data URI. `quality` is on a 0–1 scale.
    pub fn encode_jpeg(&self, quality: f32) -> Result<EncodedImage, FrameError> {
        let rgba = RgbaImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width * self.height * 4) as usize,
                actual: self.data.len(),
            },
        )?;
        // JPEG has no alpha channel.
        let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, jpeg_quality(quality)).encode_image(&rgb)?;

        tracing::debug!(
            width = self.width,
            height = self.height,
            bytes = buf.len(),
            "encoded frame as JPEG"
        );
        Ok(EncodedImage::from_bytes("image/jpeg", &buf))
    }
}

/// Map a 0–1 quality factor onto the encoder's 1–100 scale.
fn jpeg_quality(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8
}

/// Convert packed YUYV (4:2:2) to RGBA using integer BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgba(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgba.extend_from_slice(&yuv_to_rgba(y0, u, v));
        rgba.extend_from_slice(&yuv_to_rgba(y1, u, v));
    }
    Ok(rgba)
}

fn yuv_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
        255,
    ]
}

/// Check if an RGBA frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels have a mean channel value below 32.
pub fn is_dark_frame(rgba: &[u8], threshold_pct: f32) -> bool {
    let total = rgba.len() / 4;
    if total == 0 {
        return true;
    }
    let dark_count = rgba
        .chunks_exact(4)
        .filter(|px| (px[0] as u16 + px[1] as u16 + px[2] as u16) < 96)
        .count();
    (dark_count as f32 / total as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
    #[error("malformed data URI: {0}")]
    MalformedDataUri(String),
}
