//! Enrollment sessions: bounded, per-student accumulation of face samples.

use crate::frame;
use crate::store::{SampleStore, StoreError, StudentRegistry};
use crate::types::Student;
use crate::vision::{DetectParams, FaceDetector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// One capture call from the enrollment page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Frame as a data URL.
    pub image: Option<String>,
}

impl CaptureRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            image: Some(image.into()),
        }
    }

    /// Check that every field is present and non-blank.
    pub fn validate(&self) -> Result<(Student, &str), RequestError> {
        let id = required(&self.id, "id")?;
        let name = required(&self.name, "name")?;
        let image = required(&self.image, "image")?;
        Ok((Student::new(id, name), image))
    }
}

fn required<'a>(field: &'a Option<String>, name: &'static str) -> Result<&'a str, RequestError> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RequestError::MissingField(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureProgress {
    pub count: u32,
    pub done: bool,
}

#[derive(Default)]
struct Session {
    count: u32,
    /// Set once the registry write has succeeded; retried until then.
    registered: bool,
}

/// Tracks capture counts per `(id, name)` and writes accepted samples.
///
/// Counts live in process memory only. Each student's session sits behind
/// its own mutex and is held for the whole frame, so concurrent captures for
/// the same student are serialized while different students proceed freely.
pub struct EnrollmentManager {
    samples: Arc<SampleStore>,
    registry: Arc<StudentRegistry>,
    detector: Arc<dyn FaceDetector>,
    params: DetectParams,
    capture_limit: u32,
    sample_size: u32,
    sessions: Mutex<HashMap<Student, Arc<Mutex<Session>>>>,
}

impl EnrollmentManager {
    pub fn new(
        samples: Arc<SampleStore>,
        registry: Arc<StudentRegistry>,
        detector: Arc<dyn FaceDetector>,
        params: DetectParams,
        capture_limit: u32,
        sample_size: u32,
    ) -> Self {
        Self {
            samples,
            registry,
            detector,
            params,
            capture_limit,
            sample_size,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a capture request end to end.
    ///
    /// Invalid requests are rejected before any state changes. An
    /// undecodable frame reports the current progress unchanged.
    pub fn capture(&self, request: &CaptureRequest) -> Result<CaptureProgress, CaptureError> {
        let (student, payload) = request.validate()?;
        match frame::decode_data_url(payload) {
            Ok(bytes) => Ok(self.capture_frame(&student, &bytes)?),
            Err(e) => {
                tracing::debug!(student = %student.id, error = %e, "capture: undecodable payload");
                Ok(self.progress(&student))
            }
        }
    }

    /// Detect faces in an encoded frame and store as many as the limit allows.
    pub fn capture_frame(&self, student: &Student, encoded: &[u8]) -> Result<CaptureProgress, StoreError> {
        let cell = self.session(student);
        let mut session = cell.lock().unwrap_or_else(PoisonError::into_inner);

        if session.count >= self.capture_limit {
            self.ensure_registered(student, &mut session)?;
            return Ok(self.to_progress(session.count));
        }

        let gray = match frame::decode_gray(encoded) {
            Ok(gray) => gray,
            Err(e) => {
                tracing::debug!(student = %student.id, error = %e, "capture: undecodable frame");
                return Ok(self.to_progress(session.count));
            }
        };

        let regions = match self.detector.detect(&gray, &self.params) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(student = %student.id, error = %e, "capture: detection failed");
                return Ok(self.to_progress(session.count));
            }
        };

        let before = session.count;
        for region in &regions {
            if session.count >= self.capture_limit {
                break;
            }
            let Some(face) = frame::normalize_face(&gray, region, self.sample_size) else {
                continue;
            };
            let seq = session.count + 1;
            self.samples.write_sample(student, seq, &face)?;
            session.count = seq;
            tracing::debug!(student = %student.id, seq, "sample accepted");
        }

        self.ensure_registered(student, &mut session)?;

        if session.count > before {
            tracing::info!(
                student = %student.id,
                faces = regions.len(),
                accepted = session.count - before,
                count = session.count,
                "capture"
            );
        }

        Ok(self.to_progress(session.count))
    }

    /// Current progress for `student` without touching the session.
    pub fn progress(&self, student: &Student) -> CaptureProgress {
        let cell = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(student)
            .cloned();
        let count = cell
            .map(|cell| cell.lock().unwrap_or_else(PoisonError::into_inner).count)
            .unwrap_or(0);
        self.to_progress(count)
    }

    fn session(&self, student: &Student) -> Arc<Mutex<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(student.clone())
            .or_default()
            .clone()
    }

    /// Register `student` once it has at least one stored sample.
    fn ensure_registered(&self, student: &Student, session: &mut Session) -> Result<(), StoreError> {
        if session.count > 0 && !session.registered {
            self.registry.register(student)?;
            session.registered = true;
        }
        Ok(())
    }

    fn to_progress(&self, count: u32) -> CaptureProgress {
        CaptureProgress {
            count,
            done: count >= self.capture_limit,
        }
    }
}
