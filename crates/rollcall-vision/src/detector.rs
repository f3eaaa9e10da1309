//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD model with 3-stride anchor decoding and NMS post-processing,
//! reporting axis-aligned regions in frame coordinates.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{DetectParams, FaceDetector, FaceRegion, VisionError};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// score + bbox per stride; keypoint outputs, when exported, are ignored.
const SCRFD_MIN_OUTPUTS: usize = 6;

/// Coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// A decoded detection in frame coordinates, before clipping.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

pub struct ScrfdDetector {
    session: Mutex<Session>,
    stride_indices: [StrideOutputIndices; 3],
}

fn ort_failure(context: &str, e: impl std::fmt::Display) -> VisionError {
    VisionError::InferenceFailed(format!("{context}: {e}"))
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()
            .map_err(|e| ort_failure("session builder", e))?
            .with_intra_threads(2)
            .map_err(|e| ort_failure("session threads", e))?
            .commit_from_file(model_path)
            .map_err(|e| ort_failure("load model", e))?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_MIN_OUTPUTS {
            return Err(VisionError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs (3 strides x score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
        })
    }

    fn run(&self, input: &Array4<f32>, letterbox: &LetterboxInfo, min_score: f32) -> Result<Vec<Candidate>, VisionError> {
        let tensor = TensorRef::from_array_view(input.view()).map_err(|e| ort_failure("input tensor", e))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| ort_failure("run", e))?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ort_failure(&format!("scores stride {stride}"), e))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ort_failure(&format!("bboxes stride {stride}"), e))?;

            candidates.extend(decode_stride(scores, bboxes, stride, letterbox, min_score));
        }
        Ok(candidates)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, image: &GrayImage, params: &DetectParams) -> Result<Vec<FaceRegion>, VisionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let candidates = self.run(&input, &letterbox, params.min_score)?;
        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);

        let regions: Vec<FaceRegion> = kept
            .iter()
            .filter_map(|c| to_region(c, image.width(), image.height()))
            .filter(|r| r.width >= params.min_size && r.height >= params.min_size)
            .collect();

        tracing::debug!(
            faces = regions.len(),
            min_score = params.min_score,
            min_size = params.min_size,
            "SCRFD detection"
        );
        Ok(regions)
    }
}

fn letterbox_for(width: u32, height: u32) -> (LetterboxInfo, u32, u32) {
    let target = SCRFD_INPUT_SIZE as f32;
    let scale = (target / width as f32).min(target / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let info = LetterboxInfo {
        scale,
        pad_x: ((SCRFD_INPUT_SIZE - new_w) / 2) as f32,
        pad_y: ((SCRFD_INPUT_SIZE - new_h) / 2) as f32,
    };
    (info, new_w, new_h)
}

/// Letterbox a grayscale frame into a normalized 3-channel NCHW tensor.
fn preprocess(image: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
    let (letterbox, new_w, new_h) = letterbox_for(image.width(), image.height());
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (off_x + x as usize, off_y + y as usize);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = normalized;
        }
    }

    (tensor, letterbox)
}

/// Map SCRFD outputs to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to positional order: [0-2] scores, [3-5] bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let off = idx * 4;
        let Some(deltas) = bboxes.get(off..off + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        detections.push(Candidate {
            x1: unmap_x(anchor_x - deltas[0] * step),
            y1: unmap_y(anchor_y - deltas[1] * step),
            x2: unmap_x(anchor_x + deltas[2] * step),
            y2: unmap_y(anchor_y + deltas[3] * step),
            score,
        });
    }
    detections
}

/// Greedy non-maximum suppression; output is ordered by descending score.
fn nms(mut detections: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Candidate> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Clip a candidate to the frame and round to whole pixels.
fn to_region(c: &Candidate, width: u32, height: u32) -> Option<FaceRegion> {
    let x1 = c.x1.round().clamp(0.0, width as f32) as u32;
    let y1 = c.y1.round().clamp(0.0, height as f32) as u32;
    let x2 = c.x2.round().clamp(0.0, width as f32) as u32;
    let y2 = c.y2.round().clamp(0.0, height as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(FaceRegion::new(x1, y1, x2 - x1, y2 - y1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            score,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = cand(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 10.0, 10.0, 1.0);
        // 50 / (100 + 100 - 50)
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            cand(5.0, 5.0, 100.0, 100.0, 0.8),
            cand(0.0, 0.0, 100.0, 100.0, 0.9),
            cand(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, SCRFD_NMS_THRESHOLD);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let (info, new_w, new_h) = letterbox_for(320, 240);
        assert_eq!((new_w, new_h), (640, 480));
        assert!((info.scale - 2.0).abs() < 1e-6);
        assert_eq!((info.pad_x, info.pad_y), (0.0, 80.0));

        // A point mapped into the letterbox recovers its frame coordinates.
        let (x, y) = (100.0f32, 50.0f32);
        let lx = x * info.scale + info.pad_x;
        let ly = y * info.scale + info.pad_y;
        assert!(((lx - info.pad_x) / info.scale - x).abs() < 0.1);
        assert!(((ly - info.pad_y) / info.scale - y).abs() < 0.1);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = GrayImage::from_pixel(320, 240, Luma([255]));
        let (tensor, info) = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        let y = info.pad_y as usize + 10;
        assert!((tensor[[0, 2, y, 320]] - inside).abs() < 0.01);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        let stride = 32;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];

        // Cell (x=5, y=6), first anchor; box of 2 strides each side.
        let idx = (6 * grid + 5) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[2.0, 2.0, 2.0, 2.0]);

        let letterbox = LetterboxInfo {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 80.0,
        };
        let dets = decode_stride(&scores, &bboxes, stride, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x1 - 48.0).abs() < 1e-4);
        assert!((d.x2 - 112.0).abs() < 1e-4);
        assert!((d.y1 - 24.0).abs() < 1e-4);
        assert!((d.y2 - 88.0).abs() < 1e-4);

        assert!(decode_stride(&scores, &bboxes, stride, &letterbox, 0.95).is_empty());
    }

    #[test]
    fn test_to_region_clips() {
        let region = to_region(&cand(-10.0, 20.0, 50.0, 500.0, 0.9), 320, 240).unwrap();
        assert_eq!(region, FaceRegion::new(0, 20, 40, 220));
        assert!(to_region(&cand(400.0, 0.0, 10.0, 10.0, 0.9), 320, 240).is_none());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8", "bbox_16", "bbox_32",
            "kps_8", "kps_16", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx")).err().unwrap();
        assert!(matches!(err, VisionError::ModelNotFound(_)));
    }
}
