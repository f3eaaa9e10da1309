//! Trained model + label map, kept and persisted as one unit.

use crate::types::LabelMap;
use crate::vision::{AppearanceModel, ClassifierBackend, VisionError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const MODEL_FILE: &str = "face_model.bin";
pub const LABELS_FILE: &str = "labels.json";

/// First line of a model artifact: `rollcall-model <generation>`.
const MODEL_MAGIC: &str = "rollcall-model";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("label map error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model error: {0}")]
    Vision(#[from] VisionError),
    #[error("malformed model artifact: {0}")]
    Malformed(String),
    #[error("model generation {model} does not match label map generation {labels}")]
    Mismatch { model: String, labels: String },
}

/// A trained model and the label map it was trained against.
///
/// The two are never handed out separately.
pub struct TrainedSet {
    /// Stamp shared by both artifacts of one training run.
    pub generation: String,
    pub labels: LabelMap,
    pub model: Box<dyn AppearanceModel>,
}

/// The currently served [`TrainedSet`].
///
/// Readers take a cheap `Arc` snapshot; a retrain replaces the whole set in
/// one write so no reader ever pairs a new model with an old label map.
#[derive(Default)]
pub struct ModelSlot {
    current: RwLock<Option<Arc<TrainedSet>>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<TrainedSet>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Swap in `set`, returning the one it replaced.
    pub fn install(&self, set: Arc<TrainedSet>) -> Option<Arc<TrainedSet>> {
        tracing::info!(
            generation = %set.generation,
            labels = set.labels.len(),
            "model installed"
        );
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(set)
    }
}

#[derive(Serialize, Deserialize)]
struct LabelsFile {
    generation: String,
    labels: LabelMap,
}

/// On-disk home of the model and label-map artifacts.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join(LABELS_FILE)
    }

    /// Write both artifacts next to the live ones, then rename them over.
    ///
    /// Any failure before the renames leaves the previous pair untouched.
    pub fn save(&self, set: &TrainedSet) -> Result<(), ArtifactError> {
        fs::create_dir_all(&self.dir)?;

        let mut model_blob = format!("{MODEL_MAGIC} {}\n", set.generation).into_bytes();
        model_blob.extend(set.model.to_bytes()?);

        let labels_json = serde_json::to_vec_pretty(&LabelsFile {
            generation: set.generation.clone(),
            labels: set.labels.clone(),
        })?;

        let model_tmp = staging_path(&self.model_path());
        let labels_tmp = staging_path(&self.labels_path());
        fs::write(&model_tmp, model_blob)?;
        fs::write(&labels_tmp, labels_json)?;

        fs::rename(&labels_tmp, self.labels_path())?;
        fs::rename(&model_tmp, self.model_path())?;

        tracing::info!(
            dir = %self.dir.display(),
            generation = %set.generation,
            "model artifacts written"
        );
        Ok(())
    }

    /// Load the persisted pair. `Ok(None)` if either artifact is missing.
    pub fn load(&self, backend: &dyn ClassifierBackend) -> Result<Option<TrainedSet>, ArtifactError> {
        let (model_path, labels_path) = (self.model_path(), self.labels_path());
        if !model_path.is_file() || !labels_path.is_file() {
            return Ok(None);
        }

        let labels: LabelsFile = serde_json::from_slice(&fs::read(&labels_path)?)?;
        let blob = fs::read(&model_path)?;
        let (generation, body) = split_model_blob(&blob)?;

        if generation != labels.generation {
            return Err(ArtifactError::Mismatch {
                model: generation,
                labels: labels.generation,
            });
        }

        let model = backend.load(body)?;
        Ok(Some(TrainedSet {
            generation,
            labels: labels.labels,
            model,
        }))
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn split_model_blob(blob: &[u8]) -> Result<(String, &[u8]), ArtifactError> {
    let newline = blob
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| ArtifactError::Malformed("missing header line".into()))?;
    let header = std::str::from_utf8(&blob[..newline])
        .map_err(|_| ArtifactError::Malformed("header is not UTF-8".into()))?;
    let generation = header
        .strip_prefix(MODEL_MAGIC)
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .ok_or_else(|| ArtifactError::Malformed(format!("unexpected header {header:?}")))?;
    Ok((generation.to_string(), &blob[newline + 1..]))
}
