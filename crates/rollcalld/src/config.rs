use rollcall_core::SessionConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Shortest scan tick accepted from the environment.
pub const MIN_TICK_INTERVAL_MS: u64 = 50;

/// Which message bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the detector, landmark and descriptor ONNX files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum detector score for a face to count.
    pub detection_confidence: f32,
    /// EAR below this counts as a blink.
    pub blink_threshold: f32,
    /// Descriptor distance below this counts as a match.
    pub match_threshold: f32,
    /// Scan tick period, never shorter than [`MIN_TICK_INTERVAL_MS`].
    pub tick_interval: Duration,
    /// How long a result stays on screen before scanning resumes.
    pub cooldown: Duration,
    /// Blink expiry; `None` when `ROLLCALL_BLINK_TIMEOUT_SECS=0`.
    pub blink_timeout: Option<Duration>,
    /// Frames discarded after opening the camera (auto exposure settling).
    pub warmup_frames: usize,
    /// Raw captures tried when registering before giving up on dark frames.
    pub register_attempts: usize,
    /// Start a scan session as soon as the daemon is up.
    pub autostart_scan: bool,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| rollcall_vision::default_model_dir()),
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attendance.db")),
            detection_confidence: env_parse("ROLLCALL_DETECTION_CONFIDENCE", 0.5),
            blink_threshold: env_parse("ROLLCALL_BLINK_THRESHOLD", 0.30),
            match_threshold: env_parse("ROLLCALL_MATCH_THRESHOLD", 0.6),
            tick_interval: tick_interval(env_parse("ROLLCALL_TICK_INTERVAL_MS", 500)),
            cooldown: Duration::from_secs(env_parse("ROLLCALL_COOLDOWN_SECS", 3)),
            blink_timeout: blink_timeout(env_parse("ROLLCALL_BLINK_TIMEOUT_SECS", 10)),
            warmup_frames: env_parse("ROLLCALL_WARMUP_FRAMES", 4),
            register_attempts: env_parse("ROLLCALL_REGISTER_ATTEMPTS", 10),
            autostart_scan: env_flag("ROLLCALL_AUTOSTART_SCAN", false),
            bus: match std::env::var("ROLLCALL_BUS").as_deref() {
                Ok("system") => Bus::System,
                _ => Bus::Session,
            },
        }
    }

    /// Scan session parameters derived from this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            blink_threshold: self.blink_threshold,
            match_threshold: self.match_threshold,
            tick_interval: self.tick_interval,
            cooldown: self.cooldown,
            blink_timeout: self.blink_timeout,
        }
    }
}

fn blink_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn tick_interval(ms: u64) -> Duration {
    if ms < MIN_TICK_INTERVAL_MS {
        tracing::warn!(requested_ms = ms, min_ms = MIN_TICK_INTERVAL_MS, "tick interval too short; clamping");
        return Duration::from_millis(MIN_TICK_INTERVAL_MS);
    }
    Duration::from_millis(ms)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable value; using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.trim(), "" | "0" | "false" | "no"))
        .unwrap_or(default)
}
