//! V4L2 camera capture via the `v4l` crate.

use crate::claim::DeviceClaim;
use crate::frame::{self, Frame, FrameError};
use crate::source::{FrameSource, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame buffer unavailable: source is not streaming")]
    BufferUnavailable,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel), converted to RGBA.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer, decoded to RGBA.
    Mjpg,
}

/// State held while the device is streaming.
struct OpenDevice {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    _claim: DeviceClaim,
}

/// V4L2 camera frame source.
pub struct V4lCamera {
    device_path: String,
    requested_width: u32,
    requested_height: u32,
    warmup_frames: usize,
    open: Option<Arc<OpenDevice>>,
}

impl V4lCamera {
    /// Camera for a device path (e.g., "/dev/video0") at 640x480.
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            requested_width: DEFAULT_WIDTH,
            requested_height: DEFAULT_HEIGHT,
            warmup_frames: 0,
            open: None,
        }
    }

    /// Frames to discard right after opening (AE/AWB stabilization).
    pub fn with_warmup_frames(mut self, warmup_frames: usize) -> Self {
        self.warmup_frames = warmup_frames;
        self
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Open, negotiate and warm up the device. Runs on the blocking pool.
fn open_device(
    device_path: &str,
    width: u32,
    height: u32,
    warmup_frames: usize,
    claim: DeviceClaim,
) -> Result<OpenDevice, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CameraError::PermissionDenied(device_path.to_string())
        } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
            CameraError::DeviceBusy(device_path.to_string())
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })?;

    let caps = device.query_caps().map_err(|e| {
        CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
    })?;

    tracing::info!(
        device = device_path,
        driver = %caps.driver,
        card = %caps.card,
        "opened camera"
    );

    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    // Ask for YUYV; webcams that only stream compressed frames negotiate MJPG.
    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;

    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let negotiated = device.set_format(&fmt).map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
    })?;

    let fourcc = negotiated.fourcc;
    let pixel_format = if fourcc == FourCC::new(b"YUYV") {
        PixelFormat::Yuyv
    } else if fourcc == FourCC::new(b"MJPG") {
        PixelFormat::Mjpg
    } else {
        return Err(CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {fourcc:?} (need YUYV or MJPG)"
        )));
    };

    tracing::info!(
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?fourcc,
        "negotiated format"
    );

    let open = OpenDevice {
        device,
        width: negotiated.width,
        height: negotiated.height,
        pixel_format,
        _claim: claim,
    };

    if warmup_frames > 0 {
        tracing::debug!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = open.capture_frame();
        }
    }

    Ok(open)
}

impl OpenDevice {
    /// Dequeue one buffer and convert it to RGBA.
    fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let mut frame = match self.pixel_format {
            PixelFormat::Yuyv => {
                let rgba = frame::yuyv_to_rgba(buf, self.width, self.height)?;
                Frame::from_rgba(rgba, self.width, self.height)?
            }
            PixelFormat::Mjpg => {
                let used = (meta.bytesused as usize).min(buf.len());
                let img = image::load_from_memory_with_format(&buf[..used], image::ImageFormat::Jpeg)
                    .map_err(FrameError::from)?;
                Frame::from_image(&img)
            }
        };
        frame.sequence = meta.sequence;
        Ok(frame)
    }
}

#[async_trait]
impl FrameSource for V4lCamera {
    fn label(&self) -> &str {
        &self.device_path
    }

    async fn open(&mut self) -> Result<(), CameraError> {
        if self.open.is_some() {
            return Ok(());
        }

        // Claim first so a concurrent session fails without touching the device.
        let claim = DeviceClaim::acquire(&self.device_path)?;

        let path = self.device_path.clone();
        let (width, height, warmup) =
            (self.requested_width, self.requested_height, self.warmup_frames);
        let open = tokio::task::spawn_blocking(move || {
            open_device(&path, width, height, warmup, claim)
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("open task failed: {e}")))??;

        self.open = Some(Arc::new(open));
        Ok(())
    }

    fn close(&mut self) {
        if self.open.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn is_streaming(&self) -> bool {
        self.open.is_some()
    }

    async fn sample_frame(&mut self) -> Result<Frame, CameraError> {
        let open = self.open.clone().ok_or(CameraError::BufferUnavailable)?;
        tokio::task::spawn_blocking(move || open.capture_frame())
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }
}
