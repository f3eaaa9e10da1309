//! Full-rebuild training: sample folders → label map + appearance model.

use crate::config::Config;
use crate::frame;
use crate::model::{ArtifactError, ArtifactStore, TrainedSet};
use crate::store::{SampleStore, StoreError};
use crate::types::{LabelMap, Student};
use crate::vision::{ClassifierBackend, VisionError};
use chrono::Utc;
use image::GrayImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no images found in dataset, cannot train model")]
    DatasetEmpty,
    #[error("dataset error: {0}")]
    Store(#[from] StoreError),
    #[error("classifier error: {0}")]
    Vision(#[from] VisionError),
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Labelled, normalized training faces.
pub struct Dataset {
    pub labels: LabelMap,
    pub faces: Vec<(GrayImage, u32)>,
    /// Folders whose names are not `{id}_{name}`.
    pub skipped: Vec<String>,
}

/// Scan every student folder in sorted order and assign dense label ids.
///
/// Sorting is the only source of label determinism: the same folder set
/// always yields the same ids. A folder with no loadable image still takes
/// an id, and so does one that cannot be listed. Unreadable files are ignored.
pub fn build_dataset(samples: &SampleStore, size: u32) -> Result<Dataset, StoreError> {
    let mut labels = LabelMap::new();
    let mut faces = Vec::new();
    let mut skipped = Vec::new();

    for folder in samples.folders()? {
        let Some(student) = Student::from_folder_name(&folder) else {
            tracing::warn!(folder = %folder, "skipping folder not named id_name");
            skipped.push(folder);
            continue;
        };

        let label = labels.push(student);
        let files = match samples.folder_files(&folder) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(folder = %folder, error = %e, "cannot list student folder");
                Vec::new()
            }
        };
        let mut loaded = 0usize;
        for path in files {
            match image::open(&path) {
                Ok(img) => {
                    faces.push((frame::normalize_sample(&img.to_luma8(), size), label));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }

        if loaded == 0 {
            tracing::warn!(folder = %folder, label, "student folder has no usable samples");
        }
    }

    Ok(Dataset {
        labels,
        faces,
        skipped,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    /// Distinct labels trained (student folders accepted).
    pub students: usize,
    pub images: usize,
    pub skipped: Vec<String>,
    pub generation: String,
}

pub struct TrainingPipeline {
    samples: Arc<SampleStore>,
    backend: Arc<dyn ClassifierBackend>,
    artifacts: ArtifactStore,
    sample_size: u32,
    run_lock: Mutex<()>,
}

impl TrainingPipeline {
    pub fn new(
        samples: Arc<SampleStore>,
        backend: Arc<dyn ClassifierBackend>,
        artifacts: ArtifactStore,
        sample_size: u32,
    ) -> Self {
        Self {
            samples,
            backend,
            artifacts,
            sample_size,
            run_lock: Mutex::new(()),
        }
    }

    /// Pipeline over `config.dataset_dir()` writing to `config.trainer_dir()`.
    pub fn open(config: &Config, backend: Arc<dyn ClassifierBackend>) -> Result<Self, StoreError> {
        Ok(Self::new(
            Arc::new(SampleStore::open(config.dataset_dir())?),
            backend,
            ArtifactStore::new(config.trainer_dir()),
            config.sample_size,
        ))
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Rebuild the model from the current sample set and persist it.
    ///
    /// Nothing is written unless training succeeds; the previous artifacts
    /// stay authoritative on any error.
    pub fn run(&self) -> Result<(TrainedSet, TrainReport), TrainError> {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(dataset = %self.samples.root().display(), "training started");

        let dataset = build_dataset(&self.samples, self.sample_size)?;
        if dataset.faces.is_empty() {
            tracing::error!(students = dataset.labels.len(), "no images found in dataset");
            return Err(TrainError::DatasetEmpty);
        }

        let model = self.backend.train(&dataset.faces)?;
        let set = TrainedSet {
            generation: Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string(),
            labels: dataset.labels,
            model,
        };
        self.artifacts.save(&set)?;

        let report = TrainReport {
            students: set.labels.len(),
            images: dataset.faces.len(),
            skipped: dataset.skipped,
            generation: set.generation.clone(),
        };
        tracing::info!(
            students = report.students,
            images = report.images,
            generation = %report.generation,
            "training completed"
        );
        Ok((set, report))
    }

    /// Restore the persisted pair, if any.
    pub fn load_persisted(&self) -> Result<Option<TrainedSet>, ArtifactError> {
        self.artifacts.load(self.backend.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::EchoBackend;
    use image::Luma;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn put_image(dir: &Path, file: &str, w: u32, h: u32) {
        fs::create_dir_all(dir).unwrap();
        GrayImage::from_pixel(w, h, Luma([100]))
            .save(dir.join(file))
            .unwrap();
    }

    fn seed(root: &Path) {
        put_image(&root.join("101_Alice"), "1.jpg", 200, 200);
        put_image(&root.join("101_Alice"), "2.jpg", 64, 48);
        fs::create_dir_all(root.join("102_Bob")).unwrap();
        put_image(&root.join("bad"), "1.jpg", 200, 200);
        put_image(&root.join("103_Cy_Young"), "1.png", 200, 200);
        fs::write(root.join("103_Cy_Young/notes.txt"), b"not an image").unwrap();
    }

    #[test]
    fn test_build_dataset_labels_and_faces() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let samples = SampleStore::open(dir.path()).unwrap();

        let dataset = build_dataset(&samples, 200).unwrap();
        assert_eq!(dataset.labels.get(0), Some(&Student::new("101", "Alice")));
        assert_eq!(dataset.labels.get(1), Some(&Student::new("102", "Bob")));
        assert_eq!(dataset.labels.get(2), Some(&Student::new("103", "Cy_Young")));
        assert_eq!(dataset.labels.len(), 3);
        assert_eq!(dataset.skipped, vec!["bad".to_string()]);

        let labels: Vec<u32> = dataset.faces.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec![0, 0, 2]);
        assert!(dataset.faces.iter().all(|(f, _)| f.dimensions() == (200, 200)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unlistable_folder_keeps_its_label() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        put_image(&dir.path().join("101_Alice"), "1.jpg", 200, 200);
        put_image(&dir.path().join("102_Bob"), "1.jpg", 200, 200);
        put_image(&dir.path().join("103_Cy"), "1.jpg", 200, 200);
        let locked = dir.path().join("102_Bob");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users can still list the folder; nothing to check then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let samples = SampleStore::open(dir.path()).unwrap();
        let dataset = build_dataset(&samples, 200);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let dataset = dataset.unwrap();
        assert_eq!(dataset.labels.get(1), Some(&Student::new("102", "Bob")));
        assert_eq!(dataset.labels.get(2), Some(&Student::new("103", "Cy")));
        let labels: Vec<u32> = dataset.faces.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec![0, 2]);
    }

    #[test]
    fn test_label_assignment_is_deterministic() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let samples = SampleStore::open(dir.path()).unwrap();
        let first = build_dataset(&samples, 200).unwrap().labels;
        let second = build_dataset(&samples, 200).unwrap().labels;
        assert_eq!(first, second);
    }

    #[test]
    fn test_run_persists_matched_pair() {
        let dir = tempdir().unwrap();
        seed(&dir.path().join("dataset"));
        let pipeline = TrainingPipeline::new(
            Arc::new(SampleStore::open(dir.path().join("dataset")).unwrap()),
            Arc::new(EchoBackend),
            ArtifactStore::new(dir.path().join("trainer")),
            200,
        );

        let (set, report) = pipeline.run().unwrap();
        assert_eq!(report.students, 3);
        assert_eq!(report.images, 3);
        assert_eq!(report.skipped, vec!["bad".to_string()]);

        let loaded = pipeline.load_persisted().unwrap().unwrap();
        assert_eq!(loaded.generation, set.generation);
        assert_eq!(loaded.labels, set.labels);
    }

    #[test]
    fn test_empty_dataset_writes_nothing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("dataset/101_Alice")).unwrap();
        let pipeline = TrainingPipeline::new(
            Arc::new(SampleStore::open(dir.path().join("dataset")).unwrap()),
            Arc::new(EchoBackend),
            ArtifactStore::new(dir.path().join("trainer")),
            200,
        );

        assert!(matches!(pipeline.run(), Err(TrainError::DatasetEmpty)));
        assert!(!pipeline.artifacts().model_path().exists());
        assert!(!pipeline.artifacts().labels_path().exists());
    }
}
