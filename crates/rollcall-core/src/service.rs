//! The operations offered to a presentation layer, wired to one data directory.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::enrollment::{CaptureError, CaptureProgress, CaptureRequest, EnrollmentManager};
use crate::model::{ArtifactStore, ModelSlot};
use crate::recognition::{FaceResult, RecognitionEngine, RecognizeError, RecognizeRequest};
use crate::reports::{ExportError, Reports, Roster};
use crate::store::{AttendanceLedger, SampleStore, StoreError, StudentRegistry};
use crate::training::{TrainError, TrainReport, TrainingPipeline};
use crate::types::AttendanceRecord;
use crate::vision::{ClassifierBackend, FaceDetector};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub model_loaded: bool,
    pub generation: Option<String>,
    pub labels: usize,
}

pub struct AttendanceService {
    enrollment: EnrollmentManager,
    training: TrainingPipeline,
    recognition: RecognitionEngine,
    reports: Reports,
    slot: Arc<ModelSlot>,
}

impl AttendanceService {
    pub fn open(
        config: &Config,
        detector: Arc<dyn FaceDetector>,
        backend: Arc<dyn ClassifierBackend>,
    ) -> Result<Self, StoreError> {
        Self::with_clock(config, detector, backend, Arc::new(SystemClock))
    }

    /// Build every component over `config.data_dir` and load the persisted
    /// model pair if there is a consistent one.
    pub fn with_clock(
        config: &Config,
        detector: Arc<dyn FaceDetector>,
        backend: Arc<dyn ClassifierBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let samples = Arc::new(SampleStore::open(config.dataset_dir())?);
        let registry = Arc::new(StudentRegistry::new(config.students_file()));
        let ledger = Arc::new(AttendanceLedger::new(config.attendance_file()));
        let slot = Arc::new(ModelSlot::new());

        let training = TrainingPipeline::new(
            samples.clone(),
            backend,
            ArtifactStore::new(config.trainer_dir()),
            config.sample_size,
        );
        match training.load_persisted() {
            Ok(Some(set)) => {
                slot.install(Arc::new(set));
            }
            Ok(None) => tracing::info!("no trained model yet; recognition disabled until training"),
            Err(e) => tracing::warn!(error = %e, "persisted model not loaded"),
        }

        let enrollment = EnrollmentManager::new(
            samples.clone(),
            registry.clone(),
            detector.clone(),
            config.enroll_detect,
            config.capture_limit,
            config.sample_size,
        );
        let recognition = RecognitionEngine::new(
            detector,
            config.recognize_detect,
            slot.clone(),
            ledger.clone(),
            clock.clone(),
            config.confidence_threshold,
            config.sample_size,
        );
        let reports = Reports::new(samples, registry, ledger, clock);

        Ok(Self {
            enrollment,
            training,
            recognition,
            reports,
            slot,
        })
    }

    /// Start or continue enrollment with one frame.
    pub fn capture_face(&self, request: &CaptureRequest) -> Result<CaptureProgress, CaptureError> {
        self.enrollment.capture(request)
    }

    /// Full retrain; on success the new pair replaces the served one.
    pub fn train_model(&self) -> Result<TrainReport, TrainError> {
        let (set, report) = self.training.run()?;
        self.slot.install(Arc::new(set));
        Ok(report)
    }

    /// Identify faces in one frame and record attendance.
    pub fn process_attendance(&self, request: &RecognizeRequest) -> Result<Vec<FaceResult>, RecognizeError> {
        self.recognition.recognize(request)
    }

    pub fn roster(&self) -> Result<Roster, StoreError> {
        self.reports.roster()
    }

    pub fn history(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.reports.history()
    }

    pub fn export_attendance(&self, dest: &Path) -> Result<u64, ExportError> {
        self.reports.export(dest)
    }

    pub fn status(&self) -> ServiceStatus {
        let current = self.slot.current();
        ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            model_loaded: current.is_some(),
            generation: current.as_ref().map(|s| s.generation.clone()),
            labels: current.as_ref().map_or(0, |s| s.labels.len()),
        }
    }
}
