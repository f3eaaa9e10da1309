//! Local binary pattern histogram (LBPH) face classifier.
//!
//! Each face is summarized as a grid of circular-LBP histograms; prediction is
//! nearest neighbour over all training histograms by chi-square distance.

use image::GrayImage;
use rollcall_core::{AppearanceModel, ClassifierBackend, ClassifierParams, Prediction, VisionError};
use serde::{Deserialize, Serialize};

/// Interpolated neighbours within this tolerance of the centre count as equal.
const LBP_EPSILON: f32 = 1e-3;

pub struct LbphBackend {
    params: ClassifierParams,
}

impl LbphBackend {
    pub fn new(params: ClassifierParams) -> Self {
        Self { params }
    }
}

impl Default for LbphBackend {
    fn default() -> Self {
        Self::new(ClassifierParams::default())
    }
}

impl ClassifierBackend for LbphBackend {
    fn train(&self, samples: &[(GrayImage, u32)]) -> Result<Box<dyn AppearanceModel>, VisionError> {
        if samples.is_empty() {
            return Err(VisionError::EmptyTrainingSet);
        }
        check_params(&self.params)?;

        let mut histograms = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for (face, label) in samples {
            histograms.push(spatial_histogram(face, &self.params));
            labels.push(*label);
        }

        tracing::info!(
            samples = samples.len(),
            radius = self.params.radius,
            neighbors = self.params.neighbors,
            grid = format!("{}x{}", self.params.grid_x, self.params.grid_y),
            "LBPH model trained"
        );

        Ok(Box::new(LbphModel {
            params: self.params,
            histograms,
            labels,
        }))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn AppearanceModel>, VisionError> {
        Ok(Box::new(LbphModel::from_bytes(bytes)?))
    }
}

/// A trained LBPH model. Parameters travel with the model so a persisted
/// model keeps predicting the way it was trained.
#[derive(Debug, Clone)]
pub struct LbphModel {
    params: ClassifierParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

/// First line of the persisted form; the body follows as little-endian
/// `u32` labels, then `samples * bins` little-endian `f32` histogram values.
#[derive(Debug, Serialize, Deserialize)]
struct ModelHeader {
    params: ClassifierParams,
    samples: usize,
    bins: usize,
}

fn invalid(msg: impl Into<String>) -> VisionError {
    VisionError::InvalidModel(msg.into())
}

impl LbphModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VisionError> {
        let newline = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| invalid("missing header line"))?;
        let header: ModelHeader =
            serde_json::from_slice(&bytes[..newline]).map_err(|e| invalid(e.to_string()))?;
        check_params(&header.params)?;

        let expected_bins = histogram_len(&header.params);
        if header.bins != expected_bins || header.samples == 0 {
            return Err(invalid(format!(
                "{} samples of {} bins, expected {expected_bins} bins",
                header.samples, header.bins
            )));
        }

        let body = &bytes[newline + 1..];
        let labels_len = header.samples * 4;
        if body.len() != labels_len + header.samples * header.bins * 4 {
            return Err(invalid(format!("body is {} bytes for {} samples", body.len(), header.samples)));
        }
        let (label_bytes, hist_bytes) = body.split_at(labels_len);

        let labels = label_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let histograms = hist_bytes
            .chunks_exact(header.bins * 4)
            .map(|h| {
                h.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            })
            .collect();

        Ok(Self {
            params: header.params,
            histograms,
            labels,
        })
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl AppearanceModel for LbphModel {
    fn predict(&self, face: &GrayImage) -> Result<Prediction, VisionError> {
        let query = spatial_histogram(face, &self.params);

        self.histograms
            .iter()
            .zip(&self.labels)
            .map(|(h, &label)| Prediction {
                label,
                distance: chi_square(h, &query),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .ok_or(VisionError::EmptyTrainingSet)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, VisionError> {
        let bins = histogram_len(&self.params);
        let header = ModelHeader {
            params: self.params,
            samples: self.labels.len(),
            bins,
        };
        let mut out = serde_json::to_vec(&header).map_err(|e| invalid(e.to_string()))?;
        out.push(b'\n');
        out.reserve(self.labels.len() * (1 + bins) * 4);

        for label in &self.labels {
            out.extend_from_slice(&label.to_le_bytes());
        }
        for hist in &self.histograms {
            if hist.len() != bins {
                return Err(invalid(format!("histogram of {} bins, expected {bins}", hist.len())));
            }
            for value in hist {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }
}

fn check_params(params: &ClassifierParams) -> Result<(), VisionError> {
    if params.radius == 0 || params.grid_x == 0 || params.grid_y == 0 || !(1..=16).contains(&params.neighbors) {
        return Err(VisionError::InvalidModel(format!("unusable LBPH parameters {params:?}")));
    }
    Ok(())
}

/// Values per face: `2^neighbors` bins for each grid cell.
fn histogram_len(params: &ClassifierParams) -> usize {
    (1usize << params.neighbors) * (params.grid_x * params.grid_y) as usize
}

/// Bilinear sample at a fractional position inside the image.
fn sample(image: &GrayImage, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |x: u32, y: u32| image.get_pixel(x, y)[0] as f32;
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x1, y0) * fx * (1.0 - fy)
        + px(x0, y1) * (1.0 - fx) * fy
        + px(x1, y1) * fx * fy
}

/// Circular LBP codes for every pixel at least `radius` from the border.
///
/// Returns the code image as a row-major buffer with its dimensions.
fn lbp_codes(image: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, u32, u32) {
    if image.width() <= 2 * radius || image.height() <= 2 * radius {
        return (Vec::new(), 0, 0);
    }
    let out_w = image.width() - 2 * radius;
    let out_h = image.height() - 2 * radius;
    let r = radius as f32;

    let offsets: Vec<(f32, f32)> = (0..neighbors)
        .map(|n| {
            let angle = 2.0 * std::f32::consts::PI * n as f32 / neighbors as f32;
            (r * angle.cos(), -r * angle.sin())
        })
        .collect();

    let mut codes = Vec::with_capacity((out_w * out_h) as usize);
    for y in radius..radius + out_h {
        for x in radius..radius + out_w {
            let centre = image.get_pixel(x, y)[0] as f32;
            let mut code = 0u32;
            for (bit, &(dx, dy)) in offsets.iter().enumerate() {
                let sx = (x as f32 + dx).clamp(0.0, (image.width() - 1) as f32);
                let sy = (y as f32 + dy).clamp(0.0, (image.height() - 1) as f32);
                let value = sample(image, sx, sy);
                if value > centre || (value - centre).abs() < LBP_EPSILON {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }
    (codes, out_w, out_h)
}

/// Concatenated per-cell histograms of LBP codes, each normalized by the
/// cell's pixel count.
fn spatial_histogram(face: &GrayImage, params: &ClassifierParams) -> Vec<f32> {
    let bins = 1usize << params.neighbors;
    let mut histogram = vec![0.0f32; histogram_len(params)];

    let (codes, width, height) = lbp_codes(face, params.radius, params.neighbors);
    let cell_w = width / params.grid_x;
    let cell_h = height / params.grid_y;
    if cell_w == 0 || cell_h == 0 {
        return histogram;
    }

    for gy in 0..params.grid_y {
        for gx in 0..params.grid_x {
            let cell = (gy * params.grid_x + gx) as usize;
            let hist = &mut histogram[cell * bins..(cell + 1) * bins];
            for y in gy * cell_h..(gy + 1) * cell_h {
                let row = (y * width) as usize;
                for x in gx * cell_w..(gx + 1) * cell_w {
                    hist[codes[row + x as usize] as usize] += 1.0;
                }
            }
            let total = (cell_w * cell_h) as f32;
            hist.iter_mut().for_each(|v| *v /= total);
        }
    }
    histogram
}

/// Alternative chi-square distance: sum of 2(a-b)^2 / (a+b).
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .filter(|(x, y)| **x + **y > 0.0)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            2.0 * (x - y).powi(2) / (x + y)
        })
        .sum()
}
