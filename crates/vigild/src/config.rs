use serde::Deserialize;
use std::path::{Path, PathBuf};

/// What happens to an active recording when blacklist matches stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingPolicy {
    /// Once started, record for the rest of the run.
    UntilShutdown,
    /// Stop after `quiet_secs` without a blacklist match.
    QuietWindow,
}

impl RecordingPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "until-shutdown" => Some(Self::UntilShutdown),
            "quiet-window" => Some(Self::QuietWindow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub policy: RecordingPolicy,
    pub quiet_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            policy: RecordingPolicy::UntilShutdown,
            quiet_secs: 30,
        }
    }
}

/// Daemon configuration: TOML file, then `VIGIL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub denylist_csv: PathBuf,
    pub denylist_image_dir: PathBuf,
    /// Optional list of known, non-denylisted people.
    pub known_csv: Option<PathBuf>,
    pub known_image_dir: PathBuf,
    /// Maximum Euclidean embedding distance for a positive match.
    pub match_tolerance: f32,
    /// Directory receiving recorded video.
    pub output_dir: PathBuf,
    /// Directory receiving the event log.
    pub log_dir: PathBuf,
    pub recording: RecordingConfig,
    /// Run weapon inference on a second thread while faces are processed.
    pub parallel_inference: bool,
    /// Send alerts as desktop notifications over the session bus.
    pub desktop_notifications: bool,
    /// TrueType font used for overlay labels.
    pub font_path: PathBuf,
    pub ffmpeg_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: vigil_core::default_model_dir(),
            denylist_csv: PathBuf::from("data/blacklisted_faces.csv"),
            denylist_image_dir: PathBuf::from("data/face_database"),
            known_csv: None,
            known_image_dir: PathBuf::from("data/known_faces"),
            match_tolerance: vigil_core::DEFAULT_MATCH_TOLERANCE,
            output_dir: PathBuf::from("data/output"),
            log_dir: PathBuf::from("data/logs"),
            recording: RecordingConfig::default(),
            parallel_inference: false,
            desktop_notifications: true,
            font_path: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `VIGIL_*` overrides. Unparseable values are ignored with a warning.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("VIGIL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("VIGIL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_DENYLIST_CSV") {
            self.denylist_csv = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_FONT_PATH") {
            self.font_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&var, "VIGIL_MATCH_TOLERANCE", |s| s.parse::<f32>().ok()) {
            self.match_tolerance = v;
        }
        if let Some(v) = parsed(&var, "VIGIL_RECORDING_POLICY", RecordingPolicy::parse) {
            self.recording.policy = v;
        }
        if let Some(v) = parsed(&var, "VIGIL_PARALLEL_INFERENCE", |s| Some(s != "0")) {
            self.parallel_inference = v;
        }
    }

    /// Path to the YOLOv8 weapon model.
    pub fn weapon_model_path(&self) -> String {
        self.model_path("weapons.onnx")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("w600k_r50.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn parsed<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = var(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.recording.policy, RecordingPolicy::UntilShutdown);
        assert!((config.match_tolerance - 0.6).abs() < 1e-6);
        assert_eq!(config.scrfd_model_path(), "models/det_10g.onnx");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video4"
            parallel_inference = true

            [recording]
            policy = "quiet-window"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert!(config.parallel_inference);
        assert_eq!(config.recording.policy, RecordingPolicy::QuietWindow);
        assert_eq!(config.recording.quiet_secs, 30);
        assert_eq!(config.output_dir, PathBuf::from("data/output"));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(Config::from_toml("[recording]\npolicy = \"forever\"\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VIGIL_CAMERA_DEVICE", "/dev/video9"),
            ("VIGIL_MATCH_TOLERANCE", "0.45"),
            ("VIGIL_RECORDING_POLICY", "quiet-window"),
            ("VIGIL_PARALLEL_INFERENCE", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.camera_device, "/dev/video9");
        assert!((config.match_tolerance - 0.45).abs() < 1e-6);
        assert_eq!(config.recording.policy, RecordingPolicy::QuietWindow);
        assert!(config.parallel_inference);
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "VIGIL_MATCH_TOLERANCE").then(|| "close".to_string()));
        assert!((config.match_tolerance - 0.6).abs() < 1e-6);
    }
}
