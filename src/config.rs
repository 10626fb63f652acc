// Configuration module: TOML settings with per-section defaults

use crate::error::{MoodcamError, Result};
use crate::models::FacingMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "moodcam.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Facing mode a session starts with
    pub facing: FacingMode,
    pub front_index: u32,
    pub back_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Serve this image instead of a webcam
    pub still_source: Option<PathBuf>,
    /// Image served for the back camera; falls back to `still_source`
    pub still_source_back: Option<PathBuf>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: FacingMode::Front,
            front_index: 0,
            back_index: 1,
            width: 640,
            height: 480,
            fps: 30,
            still_source: None,
            still_source_back: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub sample_period_ms: u64,
    pub model_dir: PathBuf,
    pub cascade_file: String,
    pub classifier_file: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 200,
            model_dir: PathBuf::from("assets/models"),
            cascade_file: "haarcascade_frontalface_default.xml".to_string(),
            classifier_file: "emotion.onnx".to_string(),
        }
    }
}

impl DetectionConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms.max(1))
    }

    pub fn cascade_path(&self) -> PathBuf {
        self.model_dir.join(&self.cascade_file)
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.model_dir.join(&self.classifier_file)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    /// Base URL of the capture service when `backend = "remote"`
    pub remote_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("moodcam-data"),
            backend: BackendKind::Local,
            remote_url: None,
        }
    }
}

impl StorageConfig {
    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: PathBuf,
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("moodcam.log"),
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MoodcamError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path`, or `moodcam.toml` when present, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_path(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Logged once logging is up, since config is read before the subscriber exists
    pub fn log_summary(&self) {
        info!(
            "Config: {} camera, {} ms period, models in {}, {:?} storage in {}",
            self.camera.facing,
            self.detection.sample_period_ms,
            self.detection.model_dir.display(),
            self.storage.backend,
            self.storage.data_dir.display()
        );
    }

    fn validate(&self) -> Result<()> {
        if self.detection.sample_period_ms == 0 {
            return Err(MoodcamError::Config(
                "detection.sample_period_ms must be positive".to_string(),
            ));
        }
        if self.storage.backend == BackendKind::Remote && self.storage.remote_url.is_none() {
            return Err(MoodcamError::Config(
                "storage.remote_url is required for the remote backend".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.detection.sample_period(), Duration::from_millis(200));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [camera]
            facing = "back"
            still_source = "face.png"

            [detection]
            sample_period_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.camera.facing, FacingMode::Back);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.camera.still_source, Some(PathBuf::from("face.png")));
        assert_eq!(config.detection.sample_period_ms, 500);
        assert_eq!(
            config.detection.classifier_path(),
            PathBuf::from("assets/models/emotion.onnx")
        );
    }

    #[test]
    fn remote_backend_requires_url() {
        let result = AppConfig::from_toml_str("[storage]\nbackend = \"remote\"\n");
        assert!(matches!(result, Err(MoodcamError::Config(_))));
    }

    #[test]
    fn zero_period_is_rejected() {
        let result = AppConfig::from_toml_str("[detection]\nsample_period_ms = 0\n");
        assert!(matches!(result, Err(MoodcamError::Config(_))));
    }
}
