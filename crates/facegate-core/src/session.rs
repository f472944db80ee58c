//! Capture session driver.
//!
//! Owns a [`CaptureMachine`] on a tokio task and multiplexes caller
//! requests, the countdown timer, the settle delay and the in-flight
//! recognition in a single `select!` loop. Only this task touches the
//! machine, so transitions are strictly sequential. Stopping or
//! resetting drops the timers and aborts recognition in the same loop
//! iteration; anything that still arrives late is rejected by generation.

use crate::capture::{CaptureError, CaptureMachine, CaptureState, DetectOutcome, TickOutcome};
use crate::recognizer::Recognizer;
use crate::registry::UserRegistry;
use crate::types::DetectionResult;
use facegate_hw::EncodedImage;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("capture session exited")]
    ChannelClosed,
}

/// Countdown pacing.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Interval between countdown ticks.
    pub tick: Duration,
    /// Delay between the last tick and the capture.
    pub settle: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            settle: Duration::from_millis(100),
        }
    }
}

/// Recognition step run automatically after each capture.
#[derive(Clone)]
pub struct Recognition {
    pub recognizer: Arc<Recognizer>,
    pub registry: Arc<UserRegistry>,
}

/// Progress notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Streaming,
    /// Camera could not be opened or was lost; the session is idle again.
    CameraUnavailable(String),
    /// Smart capture found no face; still streaming.
    NoFaceDetected,
    /// Ticks remaining before capture.
    Countdown(u8),
    Captured(EncodedImage),
    /// Recognition is running on the captured image.
    Processing,
    Recognized(DetectionResult),
    Stopped,
    Reset,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: CaptureState,
    pub generation: u64,
    pub captured: Option<EncodedImage>,
    pub result: Option<DetectionResult>,
    pub processing: bool,
    pub camera_streaming: bool,
}

enum SessionRequest {
    Open {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    SmartCapture {
        reply: oneshot::Sender<Result<DetectOutcome, CaptureError>>,
    },
    CaptureNow {
        reply: oneshot::Sender<Result<EncodedImage, CaptureError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to a session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Open the camera and start streaming.
    pub async fn open(&self) -> Result<(), SessionError> {
        Ok(self.request(|reply| SessionRequest::Open { reply }).await??)
    }

    /// Check for a face and, if one is likely present, arm the countdown.
    pub async fn smart_capture(&self) -> Result<DetectOutcome, SessionError> {
        Ok(self
            .request(|reply| SessionRequest::SmartCapture { reply })
            .await??)
    }

    /// Capture the current frame immediately, skipping presence detection.
    pub async fn capture_now(&self) -> Result<EncodedImage, SessionError> {
        Ok(self
            .request(|reply| SessionRequest::CaptureNow { reply })
            .await??)
    }

    /// Abort streaming or a pending countdown and release the camera.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Stop { reply }).await
    }

    /// Discard the capture and any result, returning to idle.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Reset { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionRequest::Snapshot { reply }).await
    }

    pub async fn state(&self) -> Result<CaptureState, SessionError> {
        Ok(self.snapshot().await?.state)
    }

    /// Release the camera and end the session task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Shutdown { reply }).await
    }
}

struct Countdown {
    generation: u64,
    interval: Interval,
}

struct Settle {
    generation: u64,
    sleep: Pin<Box<Sleep>>,
}

struct PendingRecognition {
    generation: u64,
    task: JoinHandle<DetectionResult>,
}

struct Driver {
    machine: CaptureMachine,
    timing: SessionTiming,
    recognition: Option<Recognition>,
    events: mpsc::UnboundedSender<SessionEvent>,
    countdown: Option<Countdown>,
    settle: Option<Settle>,
    pending: Option<PendingRecognition>,
}

/// Move `machine` onto its own task.
///
/// The task ends on `shutdown` or once every handle is dropped; either
/// way the camera is released.
pub fn spawn_session(
    machine: CaptureMachine,
    timing: SessionTiming,
    recognition: Option<Recognition>,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        machine,
        timing,
        recognition,
        events: events_tx,
        countdown: None,
        settle: None,
        pending: None,
    };
    tokio::spawn(driver.run(rx));

    (SessionHandle { tx }, events_rx)
}

async fn next_tick(countdown: &mut Option<Countdown>) -> u64 {
    match countdown {
        Some(c) => {
            c.interval.tick().await;
            c.generation
        }
        None => pending().await,
    }
}

async fn settled(settle: &mut Option<Settle>) -> u64 {
    match settle {
        Some(s) => {
            s.sleep.as_mut().await;
            s.generation
        }
        None => pending().await,
    }
}

async fn recognized(
    pending_recognition: &mut Option<PendingRecognition>,
) -> (u64, Result<DetectionResult, JoinError>) {
    match pending_recognition {
        Some(p) => {
            let joined = (&mut p.task).await;
            (p.generation, joined)
        }
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        tracing::debug!(device = %self.machine.source_label(), "capture session started");
        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(SessionRequest::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(req) => self.handle(req).await,
                    None => break,
                },
                generation = next_tick(&mut self.countdown) => self.on_tick(generation),
                generation = settled(&mut self.settle) => self.on_settled(generation).await,
                (generation, joined) = recognized(&mut self.pending) => {
                    self.on_recognized(generation, joined)
                }
            }
        }
        self.teardown();
        tracing::debug!("capture session exited");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, req: SessionRequest) {
        match req {
            SessionRequest::Open { reply } => {
                let result = self.machine.open().await;
                match &result {
                    Ok(()) => self.emit(SessionEvent::Streaming),
                    Err(e) => self.report_failure(e),
                }
                let _ = reply.send(result);
            }
            SessionRequest::SmartCapture { reply } => {
                let result = self.machine.request_capture().await;
                match &result {
                    Ok(DetectOutcome::NoPresence) => self.emit(SessionEvent::NoFaceDetected),
                    Ok(DetectOutcome::CountdownStarted { generation, from }) => {
                        self.arm_countdown(*generation);
                        self.emit(SessionEvent::Countdown(*from));
                    }
                    Err(e) => self.report_failure(e),
                }
                let _ = reply.send(result);
            }
            SessionRequest::CaptureNow { reply } => {
                let result = self.machine.capture_now().await;
                match &result {
                    Ok(image) => self.on_captured(image.clone()),
                    Err(e) => self.report_failure(e),
                }
                let _ = reply.send(result);
            }
            SessionRequest::Stop { reply } => {
                if self.machine.state() != CaptureState::Captured {
                    let was_idle = self.machine.state() == CaptureState::Idle;
                    self.cancel_timers();
                    self.machine.stop();
                    if !was_idle {
                        self.emit(SessionEvent::Stopped);
                    }
                }
                let _ = reply.send(());
            }
            SessionRequest::Reset { reply } => {
                self.teardown();
                self.emit(SessionEvent::Reset);
                let _ = reply.send(());
            }
            SessionRequest::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    state: self.machine.state(),
                    generation: self.machine.generation(),
                    captured: self.machine.captured_image().cloned(),
                    result: self.machine.detection_result().cloned(),
                    processing: self.pending.is_some(),
                    camera_streaming: self.machine.is_source_streaming(),
                });
            }
            // Handled in `run` so the loop can exit.
            SessionRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn report_failure(&mut self, err: &CaptureError) {
        if let CaptureError::CameraUnavailable(e) = err {
            self.cancel_timers();
            self.emit(SessionEvent::CameraUnavailable(e.to_string()));
        }
    }

    fn arm_countdown(&mut self, generation: u64) {
        let period = self.timing.tick;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        // A stalled loop must not replay missed ticks back to back.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.settle = None;
        self.countdown = Some(Countdown { generation, interval });
    }

    fn cancel_timers(&mut self) {
        self.countdown = None;
        self.settle = None;
    }

    /// Cancel everything and return the machine to idle.
    fn teardown(&mut self) {
        self.cancel_timers();
        if let Some(p) = self.pending.take() {
            p.task.abort();
            tracing::debug!(generation = p.generation, "recognition aborted");
        }
        self.machine.reset();
    }

    fn on_tick(&mut self, generation: u64) {
        match self.machine.tick(generation) {
            TickOutcome::Counting(n) => self.emit(SessionEvent::Countdown(n)),
            TickOutcome::Settling => {
                self.countdown = None;
                self.settle = Some(Settle {
                    generation,
                    sleep: Box::pin(tokio::time::sleep(self.timing.settle)),
                });
                self.emit(SessionEvent::Countdown(0));
            }
            TickOutcome::Ignored => self.countdown = None,
        }
    }

    async fn on_settled(&mut self, generation: u64) {
        self.settle = None;
        match self.machine.finalize(generation).await {
            Ok(Some(image)) => self.on_captured(image),
            Ok(None) => tracing::debug!(generation, "late capture callback ignored"),
            Err(e) => self.report_failure(&e),
        }
    }

    fn on_captured(&mut self, image: EncodedImage) {
        self.cancel_timers();
        self.emit(SessionEvent::Captured(image.clone()));

        let Some(recognition) = self.recognition.clone() else {
            return;
        };
        let generation = self.machine.generation();
        let task = tokio::spawn(async move {
            recognition
                .recognizer
                .recognize(&image, &recognition.registry)
                .await
        });
        self.pending = Some(PendingRecognition { generation, task });
        self.emit(SessionEvent::Processing);
    }

    fn on_recognized(&mut self, generation: u64, joined: Result<DetectionResult, JoinError>) {
        self.pending = None;
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                tracing::error!(error = %e, "recognition task failed");
                DetectionResult {
                    success: false,
                    confidence: 0.0,
                    user: None,
                }
            }
        };
        if self.machine.apply_result(generation, result.clone()) {
            self.emit(SessionEvent::Recognized(result));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{SequenceRandom, DEFAULT_LATENCY};
    use crate::store::MemoryStore;
    use facegate_hw::{is_claimed, Frame, ReplaySource};

    fn face_frame() -> Frame {
        let mut data = Vec::new();
        for i in 0..100 {
            let rgb = if i < 30 { [200, 120, 90] } else { [128, 128, 128] };
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Frame::from_rgba(data, 10, 10).unwrap()
    }

    fn empty_frame() -> Frame {
        Frame::from_rgba([20, 20, 20, 255].repeat(100), 10, 10).unwrap()
    }

    fn session(
        label: &str,
        frame: Frame,
        recognition: Option<Recognition>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let source = ReplaySource::from_frames(label, vec![frame]);
        let machine = CaptureMachine::new(Box::new(source));
        spawn_session(machine, SessionTiming::default(), recognition)
    }

    async fn recognition(values: Vec<f64>) -> Recognition {
        let registry = Arc::new(UserRegistry::new(Box::new(MemoryStore::new())));
        registry
            .add("Ana", "E1", EncodedImage::from_bytes("image/jpeg", &[0xff, 0xd8]))
            .await
            .unwrap();
        Recognition {
            recognizer: Arc::new(Recognizer::new(
                DEFAULT_LATENCY,
                Box::new(SequenceRandom::new(values)),
            )),
            registry,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_capture_counts_down_then_recognizes() {
        let label = "test-session-full";
        let (handle, mut events) = session(label, face_frame(), Some(recognition(vec![0.9, 0.0, 0.5]).await));

        handle.open().await.unwrap();
        let outcome = handle.smart_capture().await.unwrap();
        assert!(matches!(outcome, DetectOutcome::CountdownStarted { from: 3, .. }));

        let mut seen = Vec::new();
        while let Some(ev) = events.recv().await {
            let done = matches!(ev, SessionEvent::Recognized(_));
            seen.push(ev);
            if done {
                break;
            }
        }

        let countdown: Vec<_> = seen
            .iter()
            .filter_map(|ev| match ev {
                SessionEvent::Countdown(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(countdown, vec![3, 2, 1, 0]);
        assert_eq!(
            seen.iter().filter(|ev| matches!(ev, SessionEvent::Captured(_))).count(),
            1
        );
        let Some(SessionEvent::Recognized(result)) = seen.last() else {
            panic!("expected recognition result");
        };
        assert!(result.success);
        assert_eq!(result.user.as_ref().unwrap().employee_id, "E1");

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, CaptureState::Captured);
        assert!(!snap.camera_streaming);
        assert!(!snap.processing);
        assert_eq!(snap.result.as_ref(), Some(result));
        assert!(!is_claimed(label));

        // Nothing else fires afterwards.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_face_keeps_streaming() {
        let (handle, mut events) = session("test-session-noface", empty_frame(), None);
        handle.open().await.unwrap();
        assert_eq!(handle.smart_capture().await.unwrap(), DetectOutcome::NoPresence);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Streaming, SessionEvent::NoFaceDetected]
        );
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, CaptureState::Streaming);
        assert!(snap.camera_streaming);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_countdown_prevents_capture() {
        let label = "test-session-stop";
        let (handle, mut events) = session(label, face_frame(), None);
        handle.open().await.unwrap();
        handle.smart_capture().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.stop().await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, CaptureState::Idle);
        assert!(snap.captured.is_none());
        assert!(!is_claimed(label));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::Countdown(2)));
        assert!(seen.contains(&SessionEvent::Stopped));
        assert!(!seen.iter().any(|ev| matches!(ev, SessionEvent::Captured(_))));
        assert!(!seen.contains(&SessionEvent::Countdown(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_inflight_recognition() {
        let (handle, mut events) = session(
            "test-session-reset",
            face_frame(),
            Some(recognition(vec![0.9, 0.0, 0.5]).await),
        );
        handle.open().await.unwrap();
        handle.capture_now().await.unwrap();
        assert!(handle.snapshot().await.unwrap().processing);

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.reset().await.unwrap();
        tokio::time::sleep(DEFAULT_LATENCY * 3).await;

        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::Processing));
        assert!(seen.contains(&SessionEvent::Reset));
        assert!(!seen.iter().any(|ev| matches!(ev, SessionEvent::Recognized(_))));

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, CaptureState::Idle);
        assert!(snap.result.is_none());
        assert!(!snap.processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_without_recognition() {
        let (handle, mut events) = session("test-session-enroll", empty_frame(), None);
        handle.open().await.unwrap();
        let image = handle.capture_now().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Streaming, SessionEvent::Captured(image)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_unavailable_reported() {
        let source = ReplaySource::from_frames("test-session-nocam", Vec::new());
        let (handle, mut events) = spawn_session(
            CaptureMachine::new(Box::new(source)),
            SessionTiming::default(),
            None,
        );
        let err = handle.open().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capture(CaptureError::CameraUnavailable(_))
        ));
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::CameraUnavailable(_))
        ));
        assert_eq!(handle.snapshot().await.unwrap().state, CaptureState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_removed_while_processing_is_not_matched() {
        let recognition = recognition(vec![0.9, 0.0, 0.5]).await;
        let registry = recognition.registry.clone();
        let ana = registry.list().await.unwrap().remove(0);
        let (handle, mut events) = session("test-session-removed", face_frame(), Some(recognition));

        handle.open().await.unwrap();
        handle.capture_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.remove(&ana.id).await.unwrap();

        let result = loop {
            match events.recv().await {
                Some(SessionEvent::Recognized(result)) => break result,
                Some(_) => continue,
                None => panic!("session ended without a result"),
            }
        };
        assert!(!result.success);
        assert!(result.user.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_stay_spaced() {
        let (handle, mut events) = session("test-session-pacing", face_frame(), None);
        handle.open().await.unwrap();
        handle.smart_capture().await.unwrap();

        let start = Instant::now();
        let mut ticks = Vec::new();
        while let Some(ev) = events.recv().await {
            match ev {
                SessionEvent::Countdown(n) if n < 3 => ticks.push(start.elapsed()),
                SessionEvent::Captured(_) => break,
                _ => {}
            }
        }
        assert_eq!(ticks.len(), 3);
        for pair in ticks.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_camera() {
        let label = "test-session-shutdown";
        let (handle, _events) = session(label, face_frame(), None);
        handle.open().await.unwrap();
        assert!(is_claimed(label));

        handle.shutdown().await.unwrap();
        assert!(!is_claimed(label));
        assert!(matches!(
            handle.snapshot().await,
            Err(SessionError::ChannelClosed)
        ));
    }
}
