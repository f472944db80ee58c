//! facegate-core — Capture, simulated recognition and the user registry.
//!
//! Drives a frame source through presence detection and a countdown to a
//! single captured still, runs a randomized stand-in for face matching on
//! it, and persists enrolled users.

pub mod capture;
pub mod presence;
pub mod recognizer;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{CaptureError, CaptureMachine, CaptureState, DetectOutcome, TickOutcome};
pub use recognizer::{RandomSource, Recognizer, SeededRandom, SequenceRandom};
pub use registry::{RegistryError, UserRegistry};
pub use session::{
    spawn_session, Recognition, SessionError, SessionEvent, SessionHandle, SessionSnapshot,
    SessionTiming,
};
pub use store::{JsonFileStore, MemoryStore, RegistryStore, SqliteStore, StoreError};
pub use types::{DetectionResult, UserRecord};
