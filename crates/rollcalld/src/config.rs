use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::liveness::LivenessConfig;
use rollcall_core::onnx::DetectorConfig;
use rollcall_core::settings::CooldownSettings;
use rollcall_core::{DedupStrategy, PoolConfig, RuntimeSettings};
use thiserror::Error;

/// Faster than any camera the daemon drives.
const MAX_CAPTURE_FPS: f32 = 120.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// JSON file of enrolled embeddings.
    pub gallery_path: PathBuf,
    /// Directory of still images replayed as the camera feed.
    pub frames_dir: Option<PathBuf>,
    /// Restart the replay from the first image when it runs out.
    pub frames_loop: bool,
    pub capture_fps: f32,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    pub detector_score_threshold: f32,
    pub pool_max_per_model: usize,
    pub pool_idle_timeout_secs: u64,
    /// Per-frame inference deadline.
    pub inference_timeout_secs: u64,
    /// Housekeeping cadence for idle flushes and cooldown pruning.
    pub tick_interval_ms: u64,
    pub visual_cooldown_secs: u64,
    pub relog_cooldown_secs: u64,
    pub spoof_detection: bool,
    /// Liveness winner probability below this is treated as borderline.
    pub borderline_confidence: f32,
    pub liveness_inflate: f32,
    pub dedup_strategy: DedupStrategy,
    /// Initial subject/group scoping cooldown keys.
    pub context: Option<String>,
    /// Serve on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let dedup_strategy = match std::env::var("ROLLCALL_DEDUP_STRATEGY") {
            Ok(v) => v.parse().map_err(|message| ConfigError::Invalid {
                key: "ROLLCALL_DEDUP_STRATEGY",
                message,
            })?,
            Err(_) => DedupStrategy::default(),
        };

        let config = Self {
            model_dir: env_path("ROLLCALL_MODEL_DIR").unwrap_or_else(|| data_dir.join("models")),
            db_path: env_path("ROLLCALL_DB_PATH").unwrap_or_else(|| data_dir.join("attendance.db")),
            gallery_path: env_path("ROLLCALL_GALLERY")
                .unwrap_or_else(|| data_dir.join("gallery.json")),
            frames_dir: env_path("ROLLCALL_FRAMES_DIR"),
            frames_loop: env_bool("ROLLCALL_FRAMES_LOOP", false),
            capture_fps: env_f32("ROLLCALL_CAPTURE_FPS", 5.0),
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", 0.40),
            detector_score_threshold: env_f32("ROLLCALL_DETECTOR_THRESHOLD", 0.5),
            pool_max_per_model: env_usize("ROLLCALL_POOL_MAX_PER_MODEL", 5),
            pool_idle_timeout_secs: env_u64("ROLLCALL_POOL_IDLE_TIMEOUT_SECS", 600),
            inference_timeout_secs: env_u64("ROLLCALL_INFERENCE_TIMEOUT_SECS", 10),
            tick_interval_ms: env_u64("ROLLCALL_TICK_INTERVAL_MS", 500),
            visual_cooldown_secs: env_u64("ROLLCALL_VISUAL_COOLDOWN_SECS", 15),
            relog_cooldown_secs: env_u64("ROLLCALL_RELOG_COOLDOWN_SECS", 1800),
            spoof_detection: env_bool("ROLLCALL_SPOOF_DETECTION", true),
            borderline_confidence: env_f32("ROLLCALL_BORDERLINE_CONFIDENCE", 0.6),
            liveness_inflate: env_f32("ROLLCALL_LIVENESS_INFLATE", 1.5),
            dedup_strategy,
            context: std::env::var("ROLLCALL_CONTEXT").ok().filter(|c| !c.is_empty()),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS").is_ok(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capture_fps > 0.0 && self.capture_fps <= MAX_CAPTURE_FPS) {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_CAPTURE_FPS",
                message: format!(
                    "must be in (0, {MAX_CAPTURE_FPS}], got {}",
                    self.capture_fps
                ),
            });
        }
        if self.relog_cooldown_secs < self.visual_cooldown_secs {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_RELOG_COOLDOWN_SECS",
                message: "must not be shorter than the visual cooldown".into(),
            });
        }
        if self.pool_max_per_model == 0 {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_POOL_MAX_PER_MODEL",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Command-line flags win over the environment.
    pub fn apply_overrides(&mut self, frames_dir: Option<PathBuf>, session_bus: bool) {
        if frames_dir.is_some() {
            self.frames_dir = frames_dir;
        }
        self.session_bus |= session_bus;
    }

    /// Never below 1 ms; a zero period makes the capture timer panic.
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.capture_fps).max(Duration::from_millis(1))
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            cooldowns: CooldownSettings {
                visual_secs: self.visual_cooldown_secs,
                relog_secs: self.relog_cooldown_secs,
            },
            spoof_detection: self.spoof_detection,
            context: self.context.clone(),
            generation: 0,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_per_model: self.pool_max_per_model,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            ..PoolConfig::default()
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            score_threshold: self.detector_score_threshold,
            ..DetectorConfig::default()
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            inflate: self.liveness_inflate,
            borderline_confidence: self.borderline_confidence,
            ..LivenessConfig::default()
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_helpers_fall_back() {
        std::env::set_var("ROLLCALL_TEST_F32", "not-a-number");
        assert_eq!(env_f32("ROLLCALL_TEST_F32", 0.4), 0.4);
        std::env::set_var("ROLLCALL_TEST_U64", "42");
        assert_eq!(env_u64("ROLLCALL_TEST_U64", 1), 42);
        assert_eq!(env_usize("ROLLCALL_TEST_UNSET_USIZE", 7), 7);
    }

    #[test]
    fn test_env_bool() {
        std::env::set_var("ROLLCALL_TEST_BOOL_OFF", "false");
        std::env::set_var("ROLLCALL_TEST_BOOL_ON", "1");
        assert!(!env_bool("ROLLCALL_TEST_BOOL_OFF", true));
        assert!(env_bool("ROLLCALL_TEST_BOOL_ON", false));
        assert!(env_bool("ROLLCALL_TEST_BOOL_UNSET", true));
    }

    fn sample() -> Config {
        Config {
            model_dir: "/models".into(),
            db_path: ":memory:".into(),
            gallery_path: "/gallery.json".into(),
            frames_dir: None,
            frames_loop: false,
            capture_fps: 4.0,
            similarity_threshold: 0.4,
            detector_score_threshold: 0.5,
            pool_max_per_model: 5,
            pool_idle_timeout_secs: 600,
            inference_timeout_secs: 10,
            tick_interval_ms: 500,
            visual_cooldown_secs: 15,
            relog_cooldown_secs: 1800,
            spoof_detection: true,
            borderline_confidence: 0.6,
            liveness_inflate: 1.5,
            dedup_strategy: DedupStrategy::SessionClustering,
            context: Some("lab".into()),
            session_bus: false,
        }
    }

    #[test]
    fn test_validate_rejects_inverted_cooldowns() {
        let mut config = sample();
        assert!(config.validate().is_ok());
        config.relog_cooldown_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_capture_fps() {
        let mut config = sample();
        for fps in [f32::INFINITY, f32::NAN, 2e9, 0.0, -1.0] {
            config.capture_fps = fps;
            assert!(config.validate().is_err(), "fps {fps}");
        }
        config.capture_fps = MAX_CAPTURE_FPS;
        assert!(config.validate().is_ok());

        config.capture_fps = f32::INFINITY;
        assert_eq!(config.capture_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_derived_settings() {
        let config = sample();
        assert_eq!(config.capture_interval(), Duration::from_millis(250));
        let settings = config.runtime_settings();
        assert_eq!(settings.cooldowns.relog_secs, 1800);
        assert_eq!(settings.context.as_deref(), Some("lab"));
        assert_eq!(config.pool_config().max_per_model, 5);
        assert_eq!(config.liveness_config().input_size, 80);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = sample();
        config.apply_overrides(Some("/frames".into()), true);
        assert_eq!(config.frames_dir.as_deref(), Some(std::path::Path::new("/frames")));
        assert!(config.session_bus);

        config.apply_overrides(None, false);
        assert!(config.frames_dir.is_some());
        assert!(config.session_bus);
    }
}
