//! Per-frame identification and the once-per-day attendance rule.

use crate::clock::{Clock, DATE_FORMAT, TIME_FORMAT};
use crate::frame;
use crate::model::{ModelSlot, TrainedSet};
use crate::store::{AttendanceLedger, StoreError};
use crate::types::{AttendanceRecord, FaceRegion, Prediction, Student};
use crate::vision::{DetectParams, FaceDetector};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Display name for faces that were not confidently identified.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("attendance ledger error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognizeRequest {
    /// Frame as a data URL.
    pub image: Option<String>,
}

/// What recognition did with one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Identified; a ledger row was written for today.
    Recorded,
    /// Identified; already present today, nothing written.
    AlreadyPresent,
    Unknown,
}

/// One detected face region and its resolved identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceResult {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub presence: Presence,
}

impl FaceResult {
    fn new(region: &FaceRegion, student: Option<&Student>, presence: Presence) -> Self {
        Self {
            x: region.x,
            y: region.y,
            w: region.width,
            h: region.height,
            name: student.map_or_else(|| UNKNOWN_NAME.to_string(), |s| s.name.clone()),
            id: student.map(|s| s.id.clone()),
            presence,
        }
    }
}

pub struct RecognitionEngine {
    detector: Arc<dyn FaceDetector>,
    params: DetectParams,
    slot: Arc<ModelSlot>,
    ledger: Arc<AttendanceLedger>,
    clock: Arc<dyn Clock>,
    /// Accept a prediction only when its distance is below this value.
    threshold: f64,
    sample_size: u32,
    /// Serializes the present-set read and the append that depends on it.
    attendance: Mutex<()>,
}

impl RecognitionEngine {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        params: DetectParams,
        slot: Arc<ModelSlot>,
        ledger: Arc<AttendanceLedger>,
        clock: Arc<dyn Clock>,
        threshold: f64,
        sample_size: u32,
    ) -> Self {
        Self {
            detector,
            params,
            slot,
            ledger,
            clock,
            threshold,
            sample_size,
            attendance: Mutex::new(()),
        }
    }

    /// Handle a recognition request. A missing or undecodable image yields
    /// an empty list.
    pub fn recognize(&self, request: &RecognizeRequest) -> Result<Vec<FaceResult>, RecognizeError> {
        let Some(payload) = request.image.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(Vec::new());
        };
        match frame::decode_data_url(payload) {
            Ok(bytes) => self.recognize_frame(&bytes),
            Err(e) => {
                tracing::debug!(error = %e, "recognize: undecodable payload");
                Ok(Vec::new())
            }
        }
    }

    /// Identify every face in an encoded frame and record first sightings.
    ///
    /// Returns one result per detected region, in detector order.
    pub fn recognize_frame(&self, encoded: &[u8]) -> Result<Vec<FaceResult>, RecognizeError> {
        let Some(set) = self.slot.current() else {
            tracing::debug!("recognize: no trained model loaded");
            return Ok(Vec::new());
        };

        let gray = match frame::decode_gray(encoded) {
            Ok(gray) => gray,
            Err(e) => {
                tracing::debug!(error = %e, "recognize: undecodable frame");
                return Ok(Vec::new());
            }
        };

        let regions = match self.detector.detect(&gray, &self.params) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, "recognize: detection failed");
                return Ok(Vec::new());
            }
        };

        let identified: Vec<(FaceRegion, Option<Student>)> = regions
            .into_iter()
            .map(|region| {
                let student = frame::normalize_face(&gray, &region, self.sample_size)
                    .and_then(|face| match set.model.predict(&face) {
                        Ok(prediction) => Some(prediction),
                        Err(e) => {
                            tracing::warn!(error = %e, "recognize: classification failed");
                            None
                        }
                    })
                    .and_then(|prediction| self.resolve(&set, prediction));
                (region, student)
            })
            .collect();

        if identified.iter().all(|(_, student)| student.is_none()) {
            return Ok(identified
                .iter()
                .map(|(region, _)| FaceResult::new(region, None, Presence::Unknown))
                .collect());
        }

        self.mark_attendance(&identified)
    }

    /// Apply the confidence policy and map the label through the label map
    /// the model was trained with.
    fn resolve(&self, set: &TrainedSet, prediction: Prediction) -> Option<Student> {
        if prediction.distance >= self.threshold {
            tracing::debug!(
                label = prediction.label,
                distance = prediction.distance,
                "recognize: above threshold"
            );
            return None;
        }
        match set.labels.get(prediction.label) {
            Some(student) => Some(student.clone()),
            None => {
                tracing::warn!(
                    label = prediction.label,
                    generation = %set.generation,
                    "recognize: predicted label missing from label map"
                );
                None
            }
        }
    }

    fn mark_attendance(
        &self,
        identified: &[(FaceRegion, Option<Student>)],
    ) -> Result<Vec<FaceResult>, RecognizeError> {
        let _guard = self.attendance.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.clock.now();
        let date = now.format(DATE_FORMAT).to_string();
        let time = now.format(TIME_FORMAT).to_string();
        let mut present = self.ledger.present_on(&date)?;

        let mut results = Vec::with_capacity(identified.len());
        for (region, student) in identified {
            let Some(student) = student else {
                results.push(FaceResult::new(region, None, Presence::Unknown));
                continue;
            };

            let presence = if present.insert(student.id.clone()) {
                self.ledger.append(&AttendanceRecord {
                    id: student.id.clone(),
                    name: student.name.clone(),
                    date: date.clone(),
                    time: time.clone(),
                })?;
                tracing::info!(student = %student.id, name = %student.name, %date, %time, "attendance recorded");
                Presence::Recorded
            } else {
                Presence::AlreadyPresent
            };
            results.push(FaceResult::new(region, Some(student), presence));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::types::LabelMap;
    use crate::vision::{AppearanceModel, VisionError};
    use chrono::NaiveDate;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use tempfile::{tempdir, TempDir};

    /// One region per entry; the region's x coordinate selects the prediction.
    struct ListDetector(Vec<FaceRegion>);

    impl FaceDetector for ListDetector {
        fn detect(&self, _image: &GrayImage, _params: &DetectParams) -> Result<Vec<FaceRegion>, VisionError> {
            Ok(self.0.clone())
        }
    }

    /// Predicts from the crop's brightness: label = pixel / 10, distance = pixel % 10 * 10.
    struct BrightnessModel;

    impl AppearanceModel for BrightnessModel {
        fn predict(&self, face: &GrayImage) -> Result<Prediction, VisionError> {
            let p = face.get_pixel(face.width() / 2, face.height() / 2)[0] as u32;
            Ok(Prediction {
                label: p / 10,
                distance: (p % 10 * 10) as f64,
            })
        }

        fn to_bytes(&self) -> Result<Vec<u8>, VisionError> {
            Ok(Vec::new())
        }
    }

    /// A frame made of 20px-wide vertical stripes with the given intensities.
    fn stripes(values: &[u8]) -> (Vec<u8>, Vec<FaceRegion>) {
        let width = 20 * values.len() as u32;
        let img = GrayImage::from_fn(width, 20, |x, _| Luma([values[(x / 20) as usize]]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        let regions = (0..values.len() as u32).map(|i| FaceRegion::new(i * 20, 0, 20, 20)).collect();
        (out.into_inner(), regions)
    }

    fn labels() -> LabelMap {
        let mut labels = LabelMap::new();
        labels.push(Student::new("100", "Zero"));
        labels.push(Student::new("101", "Alice"));
        labels.push(Student::new("102", "Bob"));
        labels
    }

    fn engine(regions: Vec<FaceRegion>, loaded: bool) -> (RecognitionEngine, Arc<AttendanceLedger>, Arc<FixedClock>, TempDir) {
        let dir = tempdir().unwrap();
        let slot = Arc::new(ModelSlot::new());
        if loaded {
            slot.install(Arc::new(TrainedSet {
                generation: "g1".into(),
                labels: labels(),
                model: Box::new(BrightnessModel),
            }));
        }
        let ledger = Arc::new(AttendanceLedger::new(dir.path().join("attendance.csv")));
        let clock = Arc::new(FixedClock::new(
            NaiveDate::from_ymd_opt(2024, 9, 2).unwrap().and_hms_opt(9, 15, 0).unwrap(),
        ));
        let engine = RecognitionEngine::new(
            Arc::new(ListDetector(regions)),
            DetectParams::recognition(),
            slot,
            ledger.clone(),
            clock.clone(),
            70.0,
            20,
        );
        (engine, ledger, clock, dir)
    }

    #[test]
    fn test_no_model_is_empty() {
        let (frame, regions) = stripes(&[10]);
        let (engine, ledger, _, _dir) = engine(regions, false);
        assert!(engine.recognize_frame(&frame).unwrap().is_empty());
        assert!(!ledger.exists());
    }

    #[test]
    fn test_missing_or_bad_image_is_empty() {
        let (_, regions) = stripes(&[10]);
        let (engine, _, _, _dir) = engine(regions, true);
        assert!(engine.recognize(&RecognizeRequest { image: None }).unwrap().is_empty());
        assert!(engine
            .recognize(&RecognizeRequest { image: Some("data:,%%%".into()) })
            .unwrap()
            .is_empty());
        assert!(engine.recognize_frame(b"garbage").unwrap().is_empty());
    }

    #[test]
    fn test_accepts_below_threshold_and_records_once() {
        // 10 → label 1 at distance 0; 23 → label 2 at distance 30.
        let (frame, regions) = stripes(&[10, 23]);
        let (engine, ledger, _, _dir) = engine(regions, true);

        let first = engine.recognize_frame(&frame).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "Alice");
        assert_eq!(first[0].presence, Presence::Recorded);
        assert_eq!(first[1].name, "Bob");
        assert_eq!((first[1].x, first[1].w), (20, 20));

        let second = engine.recognize_frame(&frame).unwrap();
        assert_eq!(second[0].name, "Alice");
        assert_eq!(second[0].presence, Presence::AlreadyPresent);
        assert_eq!(second[1].presence, Presence::AlreadyPresent);

        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "101");
        assert_eq!(records[0].date, "2024-09-02");
        assert_eq!(records[0].time, "09:15:00");
    }

    #[test]
    fn test_threshold_is_strict() {
        // 17 → distance 70, not below 70.
        let (frame, regions) = stripes(&[17]);
        let (engine, ledger, _, _dir) = engine(regions, true);
        let results = engine.recognize_frame(&frame).unwrap();
        assert_eq!(results[0].name, UNKNOWN_NAME);
        assert_eq!(results[0].presence, Presence::Unknown);
        assert!(results[0].id.is_none());
        assert!(!ledger.exists());
    }

    #[test]
    fn test_stale_label_is_unknown() {
        // 90 → label 9, absent from a three-entry label map.
        let (frame, regions) = stripes(&[90, 10]);
        let (engine, ledger, _, _dir) = engine(regions, true);
        let results = engine.recognize_frame(&frame).unwrap();
        assert_eq!(results[0].presence, Presence::Unknown);
        assert_eq!(results[1].presence, Presence::Recorded);
        assert_eq!(ledger.load().unwrap().len(), 1);
    }

    #[test]
    fn test_same_student_twice_in_one_frame() {
        let (frame, regions) = stripes(&[10, 11]);
        let (engine, ledger, _, _dir) = engine(regions, true);
        let results = engine.recognize_frame(&frame).unwrap();
        assert_eq!(results[0].presence, Presence::Recorded);
        assert_eq!(results[1].presence, Presence::AlreadyPresent);
        assert_eq!(results[1].name, "Alice");
        assert_eq!(ledger.load().unwrap().len(), 1);
    }

    #[test]
    fn test_new_day_records_again() {
        let (frame, regions) = stripes(&[10]);
        let (engine, ledger, clock, _dir) = engine(regions, true);
        engine.recognize_frame(&frame).unwrap();
        clock.set(NaiveDate::from_ymd_opt(2024, 9, 3).unwrap().and_hms_opt(8, 0, 0).unwrap());
        let results = engine.recognize_frame(&frame).unwrap();
        assert_eq!(results[0].presence, Presence::Recorded);
        assert_eq!(ledger.present_on("2024-09-03").unwrap().len(), 1);
        assert_eq!(ledger.load().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_requests_record_once() {
        let (frame, regions) = stripes(&[10]);
        let (engine, ledger, _, _dir) = engine(regions, true);
        let engine = Arc::new(engine);
        let frame = Arc::new(frame);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let frame = frame.clone();
                std::thread::spawn(move || engine.recognize_frame(&frame).unwrap())
            })
            .collect();
        let recorded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r[0].presence == Presence::Recorded)
            .count();

        assert_eq!(recorded, 1);
        assert_eq!(ledger.load().unwrap().len(), 1);
    }

    #[test]
    fn test_result_json_shape() {
        let region = FaceRegion::new(1, 2, 3, 4);
        let known = FaceResult::new(&region, Some(&Student::new("101", "Alice")), Presence::Recorded);
        assert_eq!(
            serde_json::to_value(&known).unwrap(),
            serde_json::json!({"x": 1, "y": 2, "w": 3, "h": 4, "name": "Alice", "id": "101", "presence": "recorded"})
        );
        let unknown = FaceResult::new(&region, None, Presence::Unknown);
        assert_eq!(
            serde_json::to_value(&unknown).unwrap(),
            serde_json::json!({"x": 1, "y": 2, "w": 3, "h": 4, "name": "Unknown", "presence": "unknown"})
        );
    }
}
