//! The frame source contract shared by real cameras and replay sources.

use crate::camera::CameraError;
use crate::encode::EncodedImage;
use crate::frame::Frame;
use async_trait::async_trait;

/// Requested capture width.
pub const DEFAULT_WIDTH: u32 = 640;
/// Requested capture height.
pub const DEFAULT_HEIGHT: u32 = 480;
/// JPEG quality for final captures, on a 0–1 scale.
pub const DEFAULT_JPEG_QUALITY: f32 = 0.8;

/// A device that can stream frames and encode stills on demand.
///
/// `open` and `close` are idempotent. Implementations release the
/// device when dropped, so an abandoned source never leaks the camera.
#[async_trait]
pub trait FrameSource: Send {
    /// Device key used for claims and logs.
    fn label(&self) -> &str;

    /// Acquire the device and start streaming. No-op if already open.
    async fn open(&mut self) -> Result<(), CameraError>;

    /// Release the device. No-op if not open.
    fn close(&mut self);

    fn is_streaming(&self) -> bool;

    /// Grab the current frame as RGBA. Fails with `BufferUnavailable` when not streaming.
    ///
    /// Device reads must not block the calling task.
    async fn sample_frame(&mut self) -> Result<Frame, CameraError>;

    /// Grab the current frame and encode it as a JPEG data URI.
    async fn encode_current_frame(&mut self, quality: f32) -> Result<EncodedImage, CameraError> {
        let frame = self.sample_frame().await?;
        Ok(frame.encode_jpeg(quality)?)
    }
}
