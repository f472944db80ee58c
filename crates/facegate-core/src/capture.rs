//! Capture state machine.
//!
//! ```text
//! Idle --open--> Streaming --request_capture--> Detecting
//!                   ^  |                           |  no presence: back to Streaming
//!                   |  +--capture_now--+           v  presence
//!                 stop                 |      Countdown(3) -tick-> ... Countdown(0)
//!                                      v                                  | finalize
//!                                   Captured <----------------------------+
//! ```
//!
//! The machine holds no timers. The session driver feeds it `tick` and
//! `finalize` calls tagged with the generation they were scheduled for;
//! anything stale or duplicated is ignored, so at most one image is
//! captured per countdown.

use crate::presence;
use crate::types::DetectionResult;
use facegate_hw::{CameraError, EncodedImage, FrameSource, DEFAULT_JPEG_QUALITY};
use thiserror::Error;

/// Countdown length, in ticks, after presence is detected.
pub const DEFAULT_COUNTDOWN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Streaming,
    Detecting,
    /// Ticks remaining; `Countdown(0)` is the settle window before capture.
    Countdown(u8),
    Captured,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[source] CameraError),
    #[error("cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: CaptureState },
}

/// Result of a smart-capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutcome {
    /// No face-like frame; still streaming, retry when ready.
    NoPresence,
    /// Countdown armed for `generation`, starting at `from`.
    CountdownStarted { generation: u64, from: u8 },
}

/// Result of feeding one tick into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stale generation or not counting down.
    Ignored,
    /// Still counting; ticks remaining.
    Counting(u8),
    /// Reached zero; call `finalize` after the settle delay.
    Settling,
}

pub struct CaptureMachine {
    source: Box<dyn FrameSource>,
    state: CaptureState,
    generation: u64,
    countdown_from: u8,
    quality: f32,
    captured: Option<EncodedImage>,
    result: Option<DetectionResult>,
}

impl CaptureMachine {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            state: CaptureState::Idle,
            generation: 0,
            countdown_from: DEFAULT_COUNTDOWN,
            quality: DEFAULT_JPEG_QUALITY,
            captured: None,
            result: None,
        }
    }

    pub fn with_countdown(mut self, ticks: u8) -> Self {
        self.countdown_from = ticks.max(1);
        self
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn captured_image(&self) -> Option<&EncodedImage> {
        self.captured.as_ref()
    }

    pub fn detection_result(&self) -> Option<&DetectionResult> {
        self.result.as_ref()
    }

    pub fn source_label(&self) -> &str {
        self.source.label()
    }

    pub fn is_source_streaming(&self) -> bool {
        self.source.is_streaming()
    }

    fn transition(&mut self, next: CaptureState) {
        tracing::debug!(from = ?self.state, to = ?next, generation = self.generation, "capture transition");
        self.state = next;
    }

    /// Start streaming. A no-op while a session is already live.
    pub async fn open(&mut self) -> Result<(), CaptureError> {
        match self.state {
            CaptureState::Idle => {}
            CaptureState::Captured => {
                return Err(CaptureError::InvalidState {
                    op: "open",
                    state: self.state,
                })
            }
            _ => return Ok(()),
        }

        if let Err(e) = self.source.open().await {
            tracing::warn!(device = %self.source.label(), error = %e, "camera unavailable");
            self.source.close();
            return Err(CaptureError::CameraUnavailable(e));
        }
        self.transition(CaptureState::Streaming);
        Ok(())
    }

    /// Sample one frame and run the presence heuristic.
    pub async fn request_capture(&mut self) -> Result<DetectOutcome, CaptureError> {
        self.require(CaptureState::Streaming, "request capture")?;
        self.transition(CaptureState::Detecting);

        let frame = self.sample().await?;
        if !presence::detect_presence(&frame.data) {
            tracing::info!(sequence = frame.sequence, "no face detected");
            self.transition(CaptureState::Streaming);
            return Ok(DetectOutcome::NoPresence);
        }

        self.generation += 1;
        self.transition(CaptureState::Countdown(self.countdown_from));
        tracing::info!(generation = self.generation, from = self.countdown_from, "countdown started");
        Ok(DetectOutcome::CountdownStarted {
            generation: self.generation,
            from: self.countdown_from,
        })
    }

    /// Advance the countdown for `generation` by one tick.
    pub fn tick(&mut self, generation: u64) -> TickOutcome {
        if generation != self.generation {
            return TickOutcome::Ignored;
        }
        match self.state {
            CaptureState::Countdown(n) if n > 1 => {
                self.transition(CaptureState::Countdown(n - 1));
                TickOutcome::Counting(n - 1)
            }
            CaptureState::Countdown(1) => {
                self.transition(CaptureState::Countdown(0));
                TickOutcome::Settling
            }
            _ => TickOutcome::Ignored,
        }
    }

    /// Take the picture at the end of the countdown.
    ///
    /// Returns `Ok(None)` for stale or repeated calls; only the first
    /// call after `Settling` for the current generation captures.
    pub async fn finalize(&mut self, generation: u64) -> Result<Option<EncodedImage>, CaptureError> {
        if generation != self.generation
            || self.state != CaptureState::Countdown(0)
            || self.captured.is_some()
        {
            return Ok(None);
        }
        self.capture().await.map(Some)
    }

    /// Capture immediately without the presence check.
    pub async fn capture_now(&mut self) -> Result<EncodedImage, CaptureError> {
        self.require(CaptureState::Streaming, "capture")?;
        if self.captured.is_some() {
            return Err(CaptureError::InvalidState {
                op: "capture",
                state: CaptureState::Captured,
            });
        }
        self.generation += 1;
        self.capture().await
    }

    /// Abort before capture: release the camera and drop any pending countdown.
    pub fn stop(&mut self) {
        match self.state {
            CaptureState::Streaming | CaptureState::Detecting | CaptureState::Countdown(_) => {
                self.generation += 1;
                self.source.close();
                self.transition(CaptureState::Idle);
            }
            CaptureState::Idle | CaptureState::Captured => {}
        }
    }

    /// Return to `Idle` from anywhere, discarding the image and result.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.source.close();
        self.captured = None;
        self.result = None;
        self.transition(CaptureState::Idle);
    }

    /// Record a recognition result for the capture of `generation`.
    /// Returns false when the result is stale and was dropped.
    pub fn apply_result(&mut self, generation: u64, result: DetectionResult) -> bool {
        if generation != self.generation
            || self.state != CaptureState::Captured
            || self.result.is_some()
        {
            tracing::debug!(generation, current = self.generation, "discarding stale recognition result");
            return false;
        }
        self.result = Some(result);
        true
    }

    fn require(&self, expected: CaptureState, op: &'static str) -> Result<(), CaptureError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    async fn sample(&mut self) -> Result<facegate_hw::Frame, CaptureError> {
        let sampled = self.source.sample_frame().await;
        match sampled {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.device_lost(e)),
        }
    }

    async fn capture(&mut self) -> Result<EncodedImage, CaptureError> {
        let encoded = self.source.encode_current_frame(self.quality).await;
        let image = match encoded {
            Ok(image) => image,
            Err(e) => return Err(self.device_lost(e)),
        };
        // The camera is not needed once the still exists.
        self.source.close();
        self.captured = Some(image.clone());
        self.transition(CaptureState::Captured);
        tracing::info!(generation = self.generation, bytes = image.len(), "image captured");
        Ok(image)
    }

    /// A source failure while we believe we are streaming.
    fn device_lost(&mut self, err: CameraError) -> CaptureError {
        // Every caller checked the state first; a closed buffer here means
        // the machine and the source disagree about the stream.
        assert!(
            !matches!(err, CameraError::BufferUnavailable),
            "frame source not streaming in state {:?}",
            self.state
        );
        tracing::error!(device = %self.source.label(), error = %err, "capture failed; closing camera");
        self.generation += 1;
        self.source.close();
        self.transition(CaptureState::Idle);
        CaptureError::CameraUnavailable(err)
    }
}
