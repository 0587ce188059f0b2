//! Frame type and image decoding: raw upload bytes to a packed RGB buffer.

use image::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image buffer")]
    Empty,
    #[error("unrecognised image format")]
    UnknownFormat,
    #[error("failed to decode image: {0}")]
    Malformed(#[from] image::ImageError),
}

/// An uploaded photo before decoding, with its container format already sniffed.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    bytes: Vec<u8>,
    format: ImageFormat,
    declared_type: Option<String>,
}

impl UploadedImage {
    /// Accept `bytes` only if they start like a known image container.
    ///
    /// The client's declared content type is kept for diagnostics; the
    /// sniffed format is what decoding uses.
    pub fn new(bytes: Vec<u8>, declared_type: Option<String>) -> Result<Self, DecodeError> {
        let format = sniff_format(&bytes)?;
        if let Some(declared) = declared_type.as_deref() {
            if !declared.eq_ignore_ascii_case(format.to_mime_type()) {
                tracing::debug!(
                    declared,
                    sniffed = format.to_mime_type(),
                    "declared content type does not match the image"
                );
            }
        }
        Ok(Self {
            bytes,
            format,
            declared_type,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn declared_type(&self) -> Option<&str> {
        self.declared_type.as_deref()
    }

    /// Usual file extension for the sniffed format, without the dot.
    pub fn extension(&self) -> Option<&'static str> {
        self.format.extensions_str().first().copied()
    }
}

/// Identify the image container from its magic bytes.
fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    image::guess_format(bytes).map_err(|_| DecodeError::UnknownFormat)
}

/// A decoded image as interleaved 8-bit RGB, alpha stripped.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    /// `width * height * 3` bytes, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub(crate) fn into_image(self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data)
    }

    pub(crate) fn from_image(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
        }
    }
}

/// Decode an uploaded image into 3-channel RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbFrame, DecodeError> {
    let format = sniff_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    let frame = RgbFrame::from_image(img.into_rgb8());

    tracing::debug!(
        format = ?format,
        width = frame.width,
        height = frame.height,
        "decoded upload"
    );

    Ok(frame)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    /// PNG with an alpha channel, filled with one colour.
    pub fn png_rgba(width: u32, height: u32, colour: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(colour));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_strips_alpha() {
        let bytes = fixtures::png_rgba(4, 3, [10, 20, 30, 128]);
        let frame = decode_image(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.data.len(), 4 * 3 * 3);
        assert_eq!(frame.pixel(2, 1), [10, 20, 30]);
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(decode_image(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bytes = b"definitely not an image".to_vec();
        assert!(matches!(
            decode_image(&bytes),
            Err(DecodeError::UnknownFormat)
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_png() {
        let mut bytes = fixtures::png_rgba(16, 16, [0, 0, 0, 255]);
        bytes.truncate(40);
        assert!(matches!(
            decode_image(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_upload_sniffs_format_over_declared_type() {
        let bytes = fixtures::png_rgba(1, 1, [0; 4]);
        let upload = UploadedImage::new(bytes, Some("image/jpeg".into())).unwrap();
        assert_eq!(upload.format(), ImageFormat::Png);
        assert_eq!(upload.extension(), Some("png"));
        assert_eq!(upload.declared_type(), Some("image/jpeg"));
    }

    #[test]
    fn test_upload_rejects_non_image() {
        let err = UploadedImage::new(b"plain text".to_vec(), Some("image/png".into()));
        assert!(matches!(err, Err(DecodeError::UnknownFormat)));
        let empty = UploadedImage::new(Vec::new(), None);
        assert!(matches!(empty, Err(DecodeError::Empty)));
    }
}
