//! rollcall-core — Face-recognition attendance engine.
//!
//! Accumulates bounded per-student face samples, rebuilds a label space and
//! appearance model from them on demand, and turns recognized faces into an
//! at-most-once-per-day attendance ledger. Face detection and appearance
//! classification are consumed through the traits in [`vision`].

pub mod clock;
pub mod config;
pub mod enrollment;
pub mod frame;
pub mod model;
pub mod recognition;
pub mod reports;
pub mod service;
pub mod store;
pub mod training;
pub mod types;
pub mod vision;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use enrollment::{CaptureError, CaptureProgress, CaptureRequest, EnrollmentManager, RequestError};
pub use model::{ArtifactError, ArtifactStore, ModelSlot, TrainedSet};
pub use recognition::{FaceResult, Presence, RecognitionEngine, RecognizeError, RecognizeRequest};
pub use reports::{ExportError, Reports, Roster, RosterEntry};
pub use service::{AttendanceService, ServiceStatus};
pub use store::{AttendanceLedger, SampleStore, StoreError, StudentRegistry};
pub use training::{TrainError, TrainReport, TrainingPipeline};
pub use types::{AttendanceRecord, FaceRegion, LabelMap, Prediction, Student};
pub use vision::{AppearanceModel, ClassifierBackend, ClassifierParams, DetectParams, FaceDetector, VisionError};
