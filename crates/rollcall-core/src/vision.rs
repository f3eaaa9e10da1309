//! Vision capability consumed by the engine.
//!
//! Detection and appearance classification are supplied by a backend crate;
//! the engine only orchestrates them.

use crate::types::{FaceRegion, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("cannot train on an empty sample set")]
    EmptyTrainingSet,
    #[error("invalid model data: {0}")]
    InvalidModel(String),
}

/// Detector sensitivity profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    /// Minimum detector score for a region to be reported, in [0, 1].
    pub min_score: f32,
    /// Regions narrower or shorter than this many pixels are dropped.
    pub min_size: u32,
}

impl DetectParams {
    /// Precision-oriented profile: only confident detections become samples.
    pub fn enrollment() -> Self {
        Self {
            min_score: 0.6,
            min_size: 0,
        }
    }

    /// Recall-oriented profile: looser score, small regions filtered out.
    pub fn recognition() -> Self {
        Self {
            min_score: 0.45,
            min_size: 60,
        }
    }
}

/// Parameters of the local-binary-pattern appearance classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

/// Locates faces in a grayscale frame. An empty result is valid.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &GrayImage, params: &DetectParams) -> Result<Vec<FaceRegion>, VisionError>;
}

/// A trained appearance model.
pub trait AppearanceModel: Send + Sync {
    /// Classify a normalized face crop.
    fn predict(&self, face: &GrayImage) -> Result<Prediction, VisionError>;

    /// Serialize the model for persistence.
    fn to_bytes(&self) -> Result<Vec<u8>, VisionError>;
}

/// Trains appearance models and restores persisted ones.
pub trait ClassifierBackend: Send + Sync {
    /// Train over normalized `(face, label)` pairs.
    fn train(&self, samples: &[(GrayImage, u32)]) -> Result<Box<dyn AppearanceModel>, VisionError>;

    /// Restore a model previously produced by [`AppearanceModel::to_bytes`].
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn AppearanceModel>, VisionError>;
}
