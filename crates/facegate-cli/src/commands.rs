//! Subcommand implementations.

use crate::config::{Config, StoreKind};
use anyhow::{anyhow, bail, Context, Result};
use facegate_core::{
    presence, spawn_session, CaptureError, CaptureMachine, DetectOutcome, DetectionResult,
    JsonFileStore, Recognition, Recognizer, RegistryStore, SeededRandom, SessionError,
    SessionEvent, SessionHandle, SessionTiming, SqliteStore, UserRecord, UserRegistry,
};
use facegate_hw::{is_dark_frame, EncodedImage, Frame, FrameSource, ReplaySource, V4lCamera};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const CAMERA_UNAVAILABLE: &str = "Unable to access camera. Please check permissions.";
const NO_FACE: &str = "No face detected. Please position yourself properly in front of the camera.";

/// Pause between smart-capture attempts that found no face.
const RETRY_DELAY: Duration = Duration::from_secs(1);

fn build_source(cfg: &Config) -> Box<dyn FrameSource> {
    match &cfg.replay_dir {
        Some(dir) => Box::new(ReplaySource::from_dir(dir)),
        None => Box::new(V4lCamera::new(&cfg.camera_device).with_warmup_frames(cfg.warmup_frames)),
    }
}

async fn build_registry(cfg: &Config) -> Result<UserRegistry> {
    let store: Box<dyn RegistryStore> = match cfg.store {
        StoreKind::Json => Box::new(JsonFileStore::new(&cfg.registry_path)),
        StoreKind::Sqlite => Box::new(
            SqliteStore::open(&cfg.registry_path)
                .await
                .with_context(|| format!("opening {}", cfg.registry_path.display()))?,
        ),
    };
    tracing::debug!(store = ?cfg.store, path = %cfg.registry_path.display(), "registry opened");
    Ok(UserRegistry::new(store))
}

fn build_recognizer(cfg: &Config) -> Recognizer {
    let rng = match cfg.rng_seed {
        Some(seed) => SeededRandom::from_seed(seed),
        None => SeededRandom::from_entropy(),
    };
    Recognizer::new(
        Duration::from_millis(cfg.recognition_latency_ms),
        Box::new(rng),
    )
}

fn start_session(
    cfg: &Config,
    recognition: Option<Recognition>,
) -> (SessionHandle, UnboundedReceiver<SessionEvent>) {
    session_for(build_source(cfg), cfg, recognition)
}

fn session_for(
    source: Box<dyn FrameSource>,
    cfg: &Config,
    recognition: Option<Recognition>,
) -> (SessionHandle, UnboundedReceiver<SessionEvent>) {
    let machine = CaptureMachine::new(source)
        .with_countdown(cfg.countdown_secs)
        .with_quality(cfg.jpeg_quality);
    let timing = SessionTiming {
        settle: Duration::from_millis(cfg.settle_ms),
        ..SessionTiming::default()
    };
    spawn_session(machine, timing, recognition)
}

fn is_camera_failure(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Capture(CaptureError::CameraUnavailable(_))
    )
}

async fn open_camera(session: &SessionHandle) -> Result<()> {
    match session.open().await {
        Ok(()) => Ok(()),
        Err(e) if is_camera_failure(&e) => {
            tracing::debug!(error = %e, "open failed");
            bail!(CAMERA_UNAVAILABLE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run `work` until it finishes or Ctrl-C arrives, then release the camera.
async fn until_interrupted<T>(
    session: &SessionHandle,
    work: impl Future<Output = Result<Option<T>>>,
) -> Result<Option<T>> {
    let outcome = tokio::select! {
        res = work => res,
        _ = tokio::signal::ctrl_c() => {
            session.stop().await?;
            println!("Stopped.");
            Ok(None)
        }
    };
    session.shutdown().await?;
    outcome
}

/// Smart-capture up to `attempts` times until a countdown starts.
async fn arm_countdown(session: &SessionHandle, attempts: u32) -> Result<bool> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match session.smart_capture().await {
            Ok(DetectOutcome::CountdownStarted { .. }) => return Ok(true),
            Ok(DetectOutcome::NoPresence) => {
                println!("{NO_FACE}");
                if attempt < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            Err(e) if is_camera_failure(&e) => bail!(CAMERA_UNAVAILABLE),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

/// Print session progress until `done` picks an event to return.
async fn follow<T>(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut done: impl FnMut(SessionEvent) -> Option<T>,
) -> Result<Option<T>> {
    while let Some(event) = events.recv().await {
        match &event {
            SessionEvent::Countdown(n) if *n > 0 => println!("Capturing in {n}..."),
            SessionEvent::Captured(image) => {
                tracing::debug!(bytes = image.len(), "still captured");
                println!("Image captured.");
            }
            SessionEvent::Processing => println!("Processing..."),
            SessionEvent::CameraUnavailable(reason) => {
                tracing::error!(%reason, "camera lost");
                bail!(CAMERA_UNAVAILABLE);
            }
            _ => {}
        }
        if let Some(value) = done(event) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

async fn capture_and_recognize(
    session: &SessionHandle,
    events: &mut UnboundedReceiver<SessionEvent>,
    manual: bool,
    attempts: u32,
) -> Result<Option<DetectionResult>> {
    if manual {
        session.capture_now().await?;
    } else if !arm_countdown(session, attempts).await? {
        return Ok(None);
    }
    follow(events, |event| match event {
        SessionEvent::Recognized(result) => Some(result),
        _ => None,
    })
    .await
}

pub async fn scan(cfg: &Config, manual: bool, attempts: u32) -> Result<()> {
    let registry = Arc::new(build_registry(cfg).await?);
    let recognition = Recognition {
        recognizer: Arc::new(build_recognizer(cfg)),
        registry,
    };
    let (session, mut events) = start_session(cfg, Some(recognition));
    open_camera(&session).await?;

    let result = until_interrupted(
        &session,
        capture_and_recognize(&session, &mut events, manual, attempts),
    )
    .await?;

    if let Some(result) = result {
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &DetectionResult) {
    println!();
    println!(
        "{}",
        if result.success {
            "Access Granted"
        } else {
            "Access Denied"
        }
    );
    println!("Confidence: {}", result.confidence_percent());
    if let Some(user) = &result.user {
        println!("Welcome: {}", user.name);
        println!("Employee ID: {}", user.employee_id);
    }
    if !result.success {
        println!("Face not recognized. Please try again or contact administrator.");
    }
}

async fn load_photo(path: &Path, quality: f32) -> Result<EncodedImage> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let img = image::load_from_memory(&bytes)
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(Frame::from_image(&img).encode_jpeg(quality)?)
}

async fn capture_photo(cfg: &Config, smart: bool, attempts: u32) -> Result<Option<EncodedImage>> {
    let (session, mut events) = start_session(cfg, None);
    open_camera(&session).await?;

    until_interrupted(&session, take_photo(&session, &mut events, smart, attempts)).await
}

async fn take_photo(
    session: &SessionHandle,
    events: &mut UnboundedReceiver<SessionEvent>,
    smart: bool,
    attempts: u32,
) -> Result<Option<EncodedImage>> {
    if !smart {
        return Ok(Some(session.capture_now().await?));
    }
    if !arm_countdown(session, attempts).await? {
        return Ok(None);
    }
    follow(events, |event| match event {
        SessionEvent::Captured(image) => Some(image),
        _ => None,
    })
    .await
}

pub async fn enroll(
    cfg: &Config,
    name: &str,
    employee_id: &str,
    photo: Option<&Path>,
    smart: bool,
) -> Result<()> {
    // Validate before touching the camera.
    if name.trim().is_empty() || employee_id.trim().is_empty() {
        bail!("Please fill all fields and capture an image");
    }
    let registry = build_registry(cfg).await?;

    let image = match photo {
        Some(path) => load_photo(path, cfg.jpeg_quality).await?,
        None => match capture_photo(cfg, smart, 3).await? {
            Some(image) => image,
            None => {
                println!("Enrollment cancelled; nothing saved.");
                return Ok(());
            }
        },
    };

    let user = registry.add(name, employee_id, image).await?;
    println!("User registered successfully!");
    println!("ID: {}", user.id);
    Ok(())
}

/// Listing view of a record, without the photo payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListedUser<'a> {
    id: &'a str,
    name: &'a str,
    employee_id: &'a str,
    registered_at: String,
    /// Decoded photo size; absent when the stored URI is corrupt.
    image_bytes: Option<usize>,
}

impl<'a> From<&'a UserRecord> for ListedUser<'a> {
    fn from(user: &'a UserRecord) -> Self {
        Self {
            id: &user.id,
            name: &user.name,
            employee_id: &user.employee_id,
            registered_at: user.registered_at.to_rfc3339(),
            image_bytes: user.image_data.decode_bytes().ok().map(|b| b.len()),
        }
    }
}

pub async fn list(cfg: &Config, json: bool) -> Result<()> {
    let users = build_registry(cfg).await?.list().await?;

    if json {
        let listed: Vec<ListedUser<'_>> = users.iter().map(ListedUser::from).collect();
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }

    if users.is_empty() {
        println!("No users registered");
        return Ok(());
    }
    println!("Registered Users ({})", users.len());
    for user in &users {
        println!(
            "  {}  {} ({})  Registered: {}",
            user.id,
            user.name,
            user.employee_id,
            user.registered_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub async fn remove(cfg: &Config, id: &str) -> Result<()> {
    let registry = build_registry(cfg).await?;
    let user = registry
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("no user with id {id}"))?;
    registry.remove(id).await?;
    println!("Removed {} ({})", user.name, user.employee_id);
    Ok(())
}

pub async fn test(cfg: &Config) -> Result<()> {
    println!("Running camera diagnostics...");
    if cfg.replay_dir.is_none() {
        let devices = V4lCamera::list_devices();
        if devices.is_empty() {
            println!("No V4L2 capture devices found");
        }
        for dev in &devices {
            println!("  {}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
        }
    }

    let mut source = build_source(cfg);
    println!("Opening {}...", source.label());
    if let Err(e) = source.open().await {
        tracing::debug!(error = %e, "open failed");
        bail!("{CAMERA_UNAVAILABLE} ({e})");
    }
    let frame = source.sample_frame().await;
    source.close();
    let frame = frame?;

    let stats = presence::analyze(&frame.data);
    println!("Frame:       {}x{} (#{})", frame.width, frame.height, frame.sequence);
    println!("Brightness:  {:.1}", frame.avg_brightness());
    if is_dark_frame(&frame.data, 0.95) {
        println!("Warning:     frame is almost entirely dark");
    }
    println!("Skin ratio:  {:.3}", stats.skin_ratio());
    println!("Bright ratio:{:>6.3}", stats.bright_ratio());
    println!(
        "Presence:    {}",
        if stats.face_likely() {
            "face likely"
        } else {
            "no face"
        }
    );
    Ok(())
}
