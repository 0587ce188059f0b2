//! Face crop normalisation: clamp a detection to the image and stretch it to
//! the embedding model's fixed input size.

use crate::frame::RgbFrame;
use crate::types::DetectedFace;
use image::imageops::{self, FilterType};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CropError {
    #[error("degenerate crop {width}x{height} at ({left}, {top})")]
    Degenerate {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    },
    #[error("pixel buffer does not match {width}x{height}")]
    BufferMismatch { width: u32, height: u32 },
}

/// Integer crop rectangle, guaranteed to lie inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp a detection to the image bounds.
///
/// Negative origins snap to 0, and the size is cut so the rectangle ends at
/// the image edge at the latest.
pub fn crop_rect(
    face: &DetectedFace,
    image_width: u32,
    image_height: u32,
) -> Result<CropRect, CropError> {
    let left = clamp_origin(face.left, image_width);
    let top = clamp_origin(face.top, image_height);
    let width = clamp_extent(face.width, image_width - left);
    let height = clamp_extent(face.height, image_height - top);

    if width == 0 || height == 0 {
        return Err(CropError::Degenerate {
            left,
            top,
            width,
            height,
        });
    }

    Ok(CropRect {
        left,
        top,
        width,
        height,
    })
}

fn clamp_origin(v: f32, limit: u32) -> u32 {
    let v = v.round();
    if v.is_nan() || v <= 0.0 {
        0
    } else {
        (v as u64).min(limit as u64) as u32
    }
}

fn clamp_extent(v: f32, room: u32) -> u32 {
    let v = v.round();
    if v.is_nan() || v <= 0.0 {
        0
    } else {
        (v as u64).min(room as u64) as u32
    }
}

/// Crop `face` out of `frame` and resize it (stretch-to-fill) to `size`×`size`.
pub fn normalize_face(
    frame: &RgbFrame,
    face: &DetectedFace,
    size: u32,
) -> Result<RgbFrame, CropError> {
    let rect = crop_rect(face, frame.width, frame.height)?;

    let src = frame
        .clone()
        .into_image()
        .ok_or(CropError::BufferMismatch {
            width: frame.width,
            height: frame.height,
        })?;

    let view = imageops::crop_imm(&src, rect.left, rect.top, rect.width, rect.height);
    let cropped = view.to_image();
    let resized = imageops::resize(&cropped, size, size, FilterType::Lanczos3);

    tracing::debug!(?rect, size, "face crop normalised");

    Ok(RgbFrame::from_image(resized))
}
