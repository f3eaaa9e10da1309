use crate::vision::{ClassifierParams, DetectParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration: TOML file (optional) overridden by `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for `dataset/`, `trainer/`, `students.csv` and `attendance.csv`.
    pub data_dir: PathBuf,
    /// Samples collected per student before enrollment is complete.
    pub capture_limit: u32,
    /// Edge length of normalized face crops.
    pub sample_size: u32,
    /// Classifier distance below which an identification is accepted.
    pub confidence_threshold: f64,
    pub enroll_detect: DetectParams,
    pub recognize_detect: DetectParams,
    /// ONNX face detector weights. Defaults to `<data_dir>/models/det_10g.onnx`.
    pub detector_model: Option<PathBuf>,
    pub classifier: ClassifierParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            capture_limit: 30,
            sample_size: 200,
            confidence_threshold: 70.0,
            enroll_detect: DetectParams::enrollment(),
            recognize_detect: DetectParams::recognition(),
            detector_model: None,
            classifier: ClassifierParams::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(model) = std::env::var("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(model));
        }
        self.capture_limit = env_or("ROLLCALL_CAPTURE_LIMIT", self.capture_limit);
        self.sample_size = env_or("ROLLCALL_SAMPLE_SIZE", self.sample_size);
        self.confidence_threshold = env_or("ROLLCALL_CONFIDENCE_THRESHOLD", self.confidence_threshold);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_limit == 0 {
            return Err(ConfigError::Invalid("capture_limit must be at least 1".into()));
        }
        if self.sample_size == 0 {
            return Err(ConfigError::Invalid("sample_size must be at least 1".into()));
        }
        if !self.confidence_threshold.is_finite() || self.confidence_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be a positive number, got {}",
                self.confidence_threshold
            )));
        }
        for (name, params) in [
            ("enroll_detect", &self.enroll_detect),
            ("recognize_detect", &self.recognize_detect),
        ] {
            if !(0.0..=1.0).contains(&params.min_score) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.min_score must be between 0.0 and 1.0, got {}",
                    params.min_score
                )));
            }
        }
        let c = &self.classifier;
        if c.radius == 0 || c.grid_x == 0 || c.grid_y == 0 || !(1..=16).contains(&c.neighbors) {
            return Err(ConfigError::Invalid(format!(
                "classifier needs radius, grid_x and grid_y >= 1 and neighbors in 1..=16, got {c:?}"
            )));
        }
        Ok(())
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }

    pub fn trainer_dir(&self) -> PathBuf {
        self.data_dir.join("trainer")
    }

    pub fn students_file(&self) -> PathBuf {
        self.data_dir.join("students.csv")
    }

    pub fn attendance_file(&self) -> PathBuf {
        self.data_dir.join("attendance.csv")
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.detector_model
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models").join("det_10g.onnx"))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
