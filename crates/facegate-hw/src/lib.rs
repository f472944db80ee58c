//! facegate-hw — Frame sources for the capture pipeline.
//!
//! Provides V4L2-based camera access, a replay source that serves image
//! files as a simulated camera, RGBA frame handling, and JPEG data-URI
//! encoding of captured stills.

pub mod camera;
pub mod claim;
pub mod encode;
pub mod frame;
pub mod replay;
pub mod source;

pub use camera::{CameraError, DeviceInfo, PixelFormat, V4lCamera};
pub use claim::{is_claimed, DeviceClaim};
pub use encode::EncodedImage;
pub use frame::{is_dark_frame, Frame, FrameError};
pub use replay::ReplaySource;
pub use source::{FrameSource, DEFAULT_HEIGHT, DEFAULT_JPEG_QUALITY, DEFAULT_WIDTH};
