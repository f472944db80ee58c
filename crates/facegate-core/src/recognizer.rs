//! Simulated face matching.
//!
//! No recognition happens here: after a fixed processing delay the outcome
//! is drawn at random, accepting roughly 70% of attempts against a
//! non-empty registry. The captured pixels do not influence the result.

use crate::registry::UserRegistry;
use crate::types::{DetectionResult, UserRecord};
use facegate_hw::EncodedImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Simulated processing time before a result is returned.
pub const DEFAULT_LATENCY: Duration = Duration::from_secs(2);
/// A draw above this value counts as a match.
pub const ACCEPT_THRESHOLD: f64 = 0.3;

const MATCH_CONFIDENCE: (f64, f64) = (0.7, 1.0);
const REJECT_CONFIDENCE: (f64, f64) = (0.2, 0.7);

/// Source of uniform values in `[0, 1)`.
pub trait RandomSource: Send {
    fn next_f64(&mut self) -> f64;
}

/// `StdRng`-backed source; seed it for reproducible runs.
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Replays a fixed list of values, cycling when exhausted.
pub struct SequenceRandom {
    values: Vec<f64>,
    pos: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, pos: 0 }
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let v = self.values[self.pos % self.values.len()];
        self.pos += 1;
        v
    }
}

/// Map a unit draw onto `[lo, hi)`, never returning `hi` itself.
fn uniform_in((lo, hi): (f64, f64), unit: f64) -> f64 {
    let v = lo + unit * (hi - lo);
    if v < hi {
        v
    } else {
        // Largest double below `hi` (hi is positive).
        f64::from_bits(hi.to_bits() - 1)
    }
}

/// The randomized stand-in for a face matcher.
pub struct Recognizer {
    latency: Duration,
    rng: Mutex<Box<dyn RandomSource>>,
}

impl Recognizer {
    pub fn new(latency: Duration, rng: Box<dyn RandomSource>) -> Self {
        Self {
            latency,
            rng: Mutex::new(rng),
        }
    }

    /// Wait out the processing delay, then draw a result against the
    /// users registered at that moment.
    ///
    /// Dropping the returned future before it resolves cancels the attempt.
    pub async fn recognize(&self, image: &EncodedImage, registry: &UserRegistry) -> DetectionResult {
        tracing::debug!(image_bytes = image.len(), "recognition started");
        tokio::time::sleep(self.latency).await;
        let users = match registry.list().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!(error = %e, "registry unavailable; matching against no users");
                Vec::new()
            }
        };
        let result = self.decide(&users);
        tracing::info!(
            success = result.success,
            confidence = result.confidence,
            user = result.user.as_ref().map(|u| u.id.as_str()),
            "recognition finished"
        );
        result
    }

    /// Draw an outcome immediately.
    pub fn decide(&self, users: &[UserRecord]) -> DetectionResult {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let is_match = rng.next_f64() > ACCEPT_THRESHOLD;
        if is_match && !users.is_empty() {
            let idx = ((rng.next_f64() * users.len() as f64) as usize).min(users.len() - 1);
            return DetectionResult {
                success: true,
                confidence: uniform_in(MATCH_CONFIDENCE, rng.next_f64()),
                user: Some(users[idx].clone()),
            };
        }

        DetectionResult {
            success: false,
            confidence: uniform_in(REJECT_CONFIDENCE, rng.next_f64()),
            user: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn user(id: &str, employee_id: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            name: format!("user {id}"),
            employee_id: employee_id.into(),
            image_data: EncodedImage::from_bytes("image/jpeg", &[0xff, 0xd8]),
            registered_at: Utc::now(),
        }
    }

    fn recognizer(values: Vec<f64>) -> Recognizer {
        Recognizer::new(DEFAULT_LATENCY, Box::new(SequenceRandom::new(values)))
    }

    #[test]
    fn test_match_picks_indexed_user() {
        let users = vec![user("a", "E1"), user("b", "E2"), user("c", "E3")];
        // accept, index floor(0.5 * 3) = 1, confidence 0.7 + 0.5 * 0.3
        let result = recognizer(vec![0.9, 0.5, 0.5]).decide(&users);
        assert!(result.success);
        assert_eq!(result.user.unwrap().id, "b");
        assert!((result.confidence - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let users = vec![user("a", "E1")];
        let result = recognizer(vec![0.3, 0.0]).decide(&users);
        assert!(!result.success);
        assert!(result.user.is_none());
        assert!((result.confidence - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let result = recognizer(vec![0.99, 0.5]).decide(&[]);
        assert!(!result.success);
        assert!(result.user.is_none());
        assert!((result.confidence - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_upper_bounds_are_exclusive() {
        let below_one = f64::from_bits(1.0f64.to_bits() - 1);
        let users = vec![user("a", "E1")];

        let hit = recognizer(vec![0.9, 0.0, below_one]).decide(&users);
        assert!(hit.confidence < 1.0);

        let miss = recognizer(vec![0.1, below_one]).decide(&users);
        assert!(miss.confidence < 0.7);
    }

    #[test]
    fn test_outcome_distribution() {
        let users = vec![user("a", "E1"), user("b", "E2")];
        let rec = Recognizer::new(DEFAULT_LATENCY, Box::new(SeededRandom::from_seed(7)));

        let trials = 20_000;
        let mut successes = 0;
        for _ in 0..trials {
            let result = rec.decide(&users);
            if result.success {
                successes += 1;
                assert!((0.7..1.0).contains(&result.confidence));
                assert!(result.user.is_some());
            } else {
                assert!((0.2..0.7).contains(&result.confidence));
                assert!(result.user.is_none());
            }
        }
        let rate = successes as f64 / trials as f64;
        assert!((rate - 0.7).abs() < 0.02, "success rate {rate}");
    }

    fn registry() -> UserRegistry {
        UserRegistry::new(Box::new(MemoryStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognize_waits_for_latency() {
        let rec = recognizer(vec![0.9, 0.0, 0.0]);
        let reg = registry();
        reg.add("Ana", "E1", EncodedImage::from_bytes("image/jpeg", &[1]))
            .await
            .unwrap();
        let image = EncodedImage::from_bytes("image/jpeg", &[1]);

        let start = tokio::time::Instant::now();
        let result = rec.recognize(&image, &reg).await;
        assert!(start.elapsed() >= DEFAULT_LATENCY);
        assert!(result.success);
        assert_eq!(result.user.unwrap().employee_id, "E1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognize_sees_users_added_during_latency() {
        let rec = recognizer(vec![0.9, 0.0, 0.0]);
        let reg = registry();
        let image = EncodedImage::from_bytes("image/jpeg", &[1]);

        let (result, _) = tokio::join!(rec.recognize(&image, &reg), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            reg.add("Ben", "E2", EncodedImage::from_bytes("image/jpeg", &[1]))
                .await
                .unwrap();
        });
        assert!(result.success);
        assert_eq!(result.user.unwrap().name, "Ben");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognize_is_cancellable() {
        let rec = recognizer(vec![0.9]);
        let reg = registry();
        let image = EncodedImage::from_bytes("image/jpeg", &[1]);
        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            rec.recognize(&image, &reg),
        )
        .await;
        assert!(outcome.is_err());
    }
}
