use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Registry storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Json,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown store backend {other:?} (expected json or sqlite)"),
        }
    }
}

/// CLI configuration: defaults, then the TOML file, then `FACEGATE_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Serve frames from image files in this directory instead of a camera.
    pub replay_dir: Option<PathBuf>,
    pub store: StoreKind,
    /// Registry file; defaults to `users.json` or `facegate.db` in the data directory.
    pub registry_path: PathBuf,
    /// JPEG quality for captured stills, 0–1.
    pub jpeg_quality: f32,
    /// Countdown length in one-second ticks.
    pub countdown_secs: u8,
    /// Delay between the last tick and the capture.
    pub settle_ms: u64,
    /// Simulated recognition time.
    pub recognition_latency_ms: u64,
    /// Frames to discard after opening the camera (AE/AWB stabilization).
    pub warmup_frames: usize,
    /// Fixed seed for reproducible recognition outcomes.
    pub rng_seed: Option<u64>,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    replay_dir: Option<PathBuf>,
    store: Option<StoreKind>,
    registry_path: Option<PathBuf>,
    jpeg_quality: Option<f32>,
    countdown_secs: Option<u8>,
    settle_ms: Option<u64>,
    recognition_latency_ms: Option<u64>,
    warmup_frames: Option<usize>,
    rng_seed: Option<u64>,
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => {
                let default = config_dir(&env).join("config.toml");
                if default.exists() {
                    Some(read_file(&default)?)
                } else {
                    None
                }
            }
        };
        Self::resolve(file.unwrap_or_default(), &env)
    }

    fn resolve(file: FileConfig, env: EnvLookup<'_>) -> Result<Self> {
        let store = match env("FACEGATE_STORE") {
            Some(v) => v.parse()?,
            None => file.store.unwrap_or(StoreKind::Json),
        };

        let registry_path = env("FACEGATE_REGISTRY_PATH")
            .map(PathBuf::from)
            .or(file.registry_path)
            .unwrap_or_else(|| {
                let name = match store {
                    StoreKind::Json => "users.json",
                    StoreKind::Sqlite => "facegate.db",
                };
                data_dir(env).join(name)
            });

        let jpeg_quality = env_parse(env, "FACEGATE_JPEG_QUALITY")
            .or(file.jpeg_quality)
            .unwrap_or(facegate_hw::DEFAULT_JPEG_QUALITY);
        if !(0.0..=1.0).contains(&jpeg_quality) {
            bail!("jpeg_quality must be between 0 and 1, got {jpeg_quality}");
        }

        let countdown_secs = env_parse(env, "FACEGATE_COUNTDOWN_SECS")
            .or(file.countdown_secs)
            .unwrap_or(facegate_core::capture::DEFAULT_COUNTDOWN);
        if countdown_secs == 0 {
            bail!("countdown_secs must be at least 1");
        }

        Ok(Self {
            camera_device: env("FACEGATE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            replay_dir: env("FACEGATE_REPLAY_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or(file.replay_dir),
            store,
            registry_path,
            jpeg_quality,
            countdown_secs,
            settle_ms: env_parse(env, "FACEGATE_SETTLE_MS")
                .or(file.settle_ms)
                .unwrap_or(100),
            recognition_latency_ms: env_parse(env, "FACEGATE_RECOGNITION_LATENCY_MS")
                .or(file.recognition_latency_ms)
                .unwrap_or(2000),
            warmup_frames: env_parse(env, "FACEGATE_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            rng_seed: env_parse(env, "FACEGATE_RNG_SEED").or(file.rng_seed),
        })
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let file = toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(file)
}

fn xdg_dir(env: EnvLookup<'_>, var: &str, fallback: &str) -> PathBuf {
    env(var).map(PathBuf::from).unwrap_or_else(|| {
        let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

fn config_dir(env: EnvLookup<'_>) -> PathBuf {
    xdg_dir(env, "XDG_CONFIG_HOME", ".config").join("facegate")
}

fn data_dir(env: EnvLookup<'_>) -> PathBuf {
    xdg_dir(env, "XDG_DATA_HOME", ".local/share").join("facegate")
}

/// Unparseable values fall back to the next layer.
fn env_parse<T: FromStr>(env: EnvLookup<'_>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
