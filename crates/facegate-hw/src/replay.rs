//! Replay source: serves still images as if they came from a camera.
//!
//! Frames come either from image files in a directory (loaded on `open`,
//! sorted by file name, served in a loop) or from an in-memory list.

use crate::camera::CameraError;
use crate::claim::DeviceClaim;
use crate::frame::Frame;
use crate::source::FrameSource;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct ReplaySource {
    label: String,
    dir: Option<PathBuf>,
    frames: Vec<Frame>,
    cursor: usize,
    sequence: u32,
    claim: Option<DeviceClaim>,
}

impl ReplaySource {
    /// Replay every JPEG/PNG file in `dir`.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            label: format!("replay:{}", dir.display()),
            dir: Some(dir),
            frames: Vec::new(),
            cursor: 0,
            sequence: 0,
            claim: None,
        }
    }

    /// Replay a fixed list of frames under the given device key.
    pub fn from_frames(label: &str, frames: Vec<Frame>) -> Self {
        Self {
            label: label.to_string(),
            dir: None,
            frames,
            cursor: 0,
            sequence: 0,
            claim: None,
        }
    }
}

async fn load_dir(dir: &Path) -> Result<Vec<Frame>, CameraError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", dir.display())))?
    {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            paths.push(path);
        }
    }
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable replay frame");
                continue;
            }
        };
        match image::load_from_memory(&bytes) {
            Ok(img) => frames.push(Frame::from_image(&img)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable replay frame");
            }
        }
    }
    Ok(frames)
}

#[async_trait]
impl FrameSource for ReplaySource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn open(&mut self) -> Result<(), CameraError> {
        if self.claim.is_some() {
            return Ok(());
        }
        let claim = DeviceClaim::acquire(&self.label)?;

        if let Some(dir) = &self.dir {
            self.frames = load_dir(dir).await?;
            self.cursor = 0;
        }
        if self.frames.is_empty() {
            return Err(CameraError::DeviceNotFound(format!(
                "{}: no frames to replay",
                self.label
            )));
        }

        tracing::info!(device = %self.label, frames = self.frames.len(), "replay source opened");
        self.claim = Some(claim);
        Ok(())
    }

    fn close(&mut self) {
        if self.claim.take().is_some() {
            tracing::info!(device = %self.label, "replay source released");
        }
    }

    fn is_streaming(&self) -> bool {
        self.claim.is_some()
    }

    async fn sample_frame(&mut self) -> Result<Frame, CameraError> {
        if self.claim.is_none() || self.frames.is_empty() {
            return Err(CameraError::BufferUnavailable);
        }
        let mut frame = self.frames[self.cursor % self.frames.len()].clone();
        self.cursor += 1;
        self.sequence += 1;
        frame.sequence = self.sequence;
        frame.timestamp = std::time::Instant::now();
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::is_claimed;

    fn solid(value: u8) -> Frame {
        Frame::from_rgba(vec![value; 4 * 4 * 4], 4, 4).unwrap()
    }

    #[tokio::test]
    async fn test_sample_requires_open() {
        let mut src = ReplaySource::from_frames("test-replay-closed", vec![solid(10)]);
        assert!(matches!(
            src.sample_frame().await,
            Err(CameraError::BufferUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_frames_cycle_in_order() {
        let mut src = ReplaySource::from_frames("test-replay-cycle", vec![solid(10), solid(20)]);
        src.open().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = src.sample_frame().await.unwrap();
            seen.push((frame.data[0], frame.sequence));
        }
        assert_eq!(seen, vec![(10, 1), (20, 2), (10, 3)]);
    }

    #[tokio::test]
    async fn test_open_close_manages_claim() {
        let key = "test-replay-claim";
        let mut src = ReplaySource::from_frames(key, vec![solid(10)]);
        src.open().await.unwrap();
        src.open().await.unwrap(); // idempotent
        assert!(src.is_streaming());
        assert!(is_claimed(key));

        let mut rival = ReplaySource::from_frames(key, vec![solid(10)]);
        assert!(matches!(rival.open().await, Err(CameraError::DeviceBusy(_))));

        src.close();
        src.close(); // idempotent
        assert!(!src.is_streaming());
        assert!(!is_claimed(key));
    }

    #[tokio::test]
    async fn test_drop_releases_claim() {
        let key = "test-replay-drop";
        {
            let mut src = ReplaySource::from_frames(key, vec![solid(10)]);
            src.open().await.unwrap();
            assert!(is_claimed(key));
        }
        assert!(!is_claimed(key));
    }

    #[tokio::test]
    async fn test_empty_source_fails_without_claim() {
        let key = "test-replay-empty";
        let mut src = ReplaySource::from_frames(key, Vec::new());
        assert!(matches!(src.open().await, Err(CameraError::DeviceNotFound(_))));
        assert!(!is_claimed(key));
    }

    #[tokio::test]
    async fn test_missing_dir_is_unavailable() {
        let mut src = ReplaySource::from_dir("/nonexistent/facegate-replay");
        assert!(src.open().await.is_err());
        assert!(!src.is_streaming());
    }

    #[tokio::test]
    async fn test_encode_current_frame() {
        let mut src = ReplaySource::from_frames("test-replay-encode", vec![solid(150)]);
        src.open().await.unwrap();
        let img = src.encode_current_frame(0.8).await.unwrap();
        assert_eq!(img.mime(), "image/jpeg");
        let decoded = image::load_from_memory(&img.decode_bytes().unwrap()).unwrap();
        assert_eq!(decoded.width(), 4);
    }
}
