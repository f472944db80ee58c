//! Enrollment and recognition across the whole core pipeline.

use facegate_core::recognizer::DEFAULT_LATENCY;
use facegate_core::{
    spawn_session, CaptureMachine, CaptureState, DetectOutcome, JsonFileStore, Recognition,
    Recognizer, SeededRandom, SequenceRandom, SessionEvent, SessionTiming, UserRegistry,
};
use facegate_hw::{is_claimed, Frame, ReplaySource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn face_frame() -> Frame {
    let mut data = Vec::with_capacity(64 * 48 * 4);
    for y in 0..48 {
        for x in 0..64 {
            // Skin-toned block in the middle, ~25% of the frame.
            let skin = (16..48).contains(&x) && (12..36).contains(&y);
            let rgb = if skin { [210, 140, 110] } else { [120, 120, 130] };
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
    }
    Frame::from_rgba(data, 64, 48).unwrap()
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("facegate-e2e-{}", uuid::Uuid::new_v4()))
}

async fn enroll(registry: &UserRegistry, label: &str, name: &str, employee_id: &str) -> String {
    let source = ReplaySource::from_frames(label, vec![face_frame()]);
    let (session, mut events) = spawn_session(
        CaptureMachine::new(Box::new(source)),
        SessionTiming::default(),
        None,
    );
    session.open().await.unwrap();
    let photo = session.capture_now().await.unwrap();
    assert_eq!(photo.mime(), "image/jpeg");
    session.shutdown().await.unwrap();

    let mut captured = false;
    while let Some(ev) = events.recv().await {
        captured |= matches!(ev, SessionEvent::Captured(_));
    }
    assert!(captured);
    assert!(!is_claimed(label));

    registry.add(name, employee_id, photo).await.unwrap().id
}

#[tokio::test(start_paused = true)]
async fn test_enroll_then_recognize() {
    let dir = scratch_dir();
    let registry = Arc::new(UserRegistry::new(Box::new(JsonFileStore::new(
        dir.join("users.json"),
    ))));
    enroll(&registry, "e2e-enroll-cam", "Ana", "E1").await;

    let recognition = Recognition {
        recognizer: Arc::new(Recognizer::new(
            DEFAULT_LATENCY,
            Box::new(SeededRandom::from_seed(42)),
        )),
        registry: registry.clone(),
    };
    let source = ReplaySource::from_frames("e2e-scan-cam", vec![face_frame()]);
    let (session, mut events) = spawn_session(
        CaptureMachine::new(Box::new(source)),
        SessionTiming::default(),
        Some(recognition),
    );
    session.open().await.unwrap();
    let outcome = session.smart_capture().await.unwrap();
    assert!(matches!(outcome, DetectOutcome::CountdownStarted { .. }));

    let result = loop {
        match events.recv().await {
            Some(SessionEvent::Recognized(result)) => break result,
            Some(_) => continue,
            None => panic!("session ended without a result"),
        }
    };

    if result.success {
        let user = result.user.as_ref().unwrap();
        assert_eq!(user.employee_id, "E1");
        assert_eq!(user.name, "Ana");
        assert!((0.7..1.0).contains(&result.confidence));
    } else {
        assert!(result.user.is_none());
        assert!((0.2..0.7).contains(&result.confidence));
    }
    assert_eq!(session.state().await.unwrap(), CaptureState::Captured);
    assert!(!is_claimed("e2e-scan-cam"));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(start_paused = true)]
async fn test_remove_after_enrolling_two() {
    let dir = scratch_dir();
    let path = dir.join("users.json");
    let registry = UserRegistry::new(Box::new(JsonFileStore::new(&path)));

    let first = enroll(&registry, "e2e-two-cam", "Ana", "E1").await;
    let second = enroll(&registry, "e2e-two-cam", "Ben", "E2").await;
    registry.remove(&first).await.unwrap();

    // A fresh registry over the same file sees the persisted result.
    let reopened = UserRegistry::new(Box::new(JsonFileStore::new(&path)));
    let users = reopened.list().await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, second);
    assert_eq!(users[0].employee_id, "E2");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_capture_releases_camera() {
    let label = "e2e-stop-cam";
    let registry = Arc::new(UserRegistry::new(Box::new(
        facegate_core::MemoryStore::new(),
    )));
    let recognition = Recognition {
        recognizer: Arc::new(Recognizer::new(
            DEFAULT_LATENCY,
            Box::new(SequenceRandom::new(vec![0.9, 0.0, 0.0])),
        )),
        registry,
    };
    let source = ReplaySource::from_frames(label, vec![face_frame()]);
    let (session, mut events) = spawn_session(
        CaptureMachine::new(Box::new(source)),
        SessionTiming::default(),
        Some(recognition),
    );

    session.open().await.unwrap();
    session.smart_capture().await.unwrap();
    assert!(is_claimed(label));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    session.stop().await.unwrap();
    assert!(!is_claimed(label));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CaptureState::Idle);
    assert!(snapshot.captured.is_none());
    assert!(snapshot.result.is_none());

    session.shutdown().await.unwrap();
    while let Some(ev) = events.recv().await {
        assert!(!matches!(
            ev,
            SessionEvent::Captured(_) | SessionEvent::Recognized(_)
        ));
    }
}
