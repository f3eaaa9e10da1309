//! Frame payload decoding and face-crop normalization.

use crate::types::FaceRegion;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::{self, FilterType};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("undecodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a browser data URL (`data:image/jpeg;base64,...`) into encoded
/// image bytes. A payload without a `data:` prefix is decoded whole.
pub fn decode_data_url(payload: &str) -> Result<Vec<u8>, FrameError> {
    let encoded = match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    };
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(STANDARD.decode(encoded)?)
}

/// Encode image bytes as a JPEG data URL.
pub fn encode_data_url(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
}

/// Decode encoded image bytes (JPEG, PNG, ...) to 8-bit grayscale.
pub fn decode_gray(bytes: &[u8]) -> Result<GrayImage, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

/// Crop `region` out of `frame` and resize it to `size × size`.
///
/// The region is clipped to the frame first; `None` if nothing remains.
pub fn normalize_face(frame: &GrayImage, region: &FaceRegion, size: u32) -> Option<GrayImage> {
    let r = region.clamp_to(frame.width(), frame.height())?;
    let crop = imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image();
    Some(normalize_sample(&crop, size))
}

/// Resize a whole grayscale image to `size × size`.
pub fn normalize_sample(image: &GrayImage, size: u32) -> GrayImage {
    if image.width() == size && image.height() == size {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}
