//! Photo to signature: decode, locate, crop, embed.
//!
//! Every intermediate buffer is owned by the stage that produced it and is
//! dropped as soon as the next stage no longer needs it, on both the success
//! and the error path.

use crate::cancel::{CancelToken, Interrupt, Stage};
use crate::crop::{self, CropError};
use crate::detector::DetectorError;
use crate::embedder::EmbedderError;
use crate::frame::{self, DecodeError};
use crate::models::ModelRegistry;
use crate::types::{DetectedFace, Signature};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("face location: {0}")]
    Locate(#[from] DetectorError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("crop: {0}")]
    Crop(#[from] CropError),
    #[error("embedding: {0}")]
    Embedding(#[from] EmbedderError),
    #[error("cancelled before {0}")]
    Cancelled(Stage),
    #[error("deadline exceeded before {0}")]
    DeadlineExceeded(Stage),
}

impl From<Interrupt> for PipelineError {
    fn from(i: Interrupt) -> Self {
        match i {
            Interrupt::Cancelled(stage) => PipelineError::Cancelled(stage),
            Interrupt::DeadlineExceeded(stage) => PipelineError::DeadlineExceeded(stage),
        }
    }
}

impl PipelineError {
    /// Short message that is safe to show to a client.
    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => {
                "Failed to decode the uploaded image. Please ensure it's a valid format."
            }
            PipelineError::Locate(_) => "Failed to run the face detection model.",
            PipelineError::NoFaceDetected => "No face detected in the image.",
            PipelineError::Crop(_) => "Failed to crop the face from the image.",
            PipelineError::Embedding(_) => "Failed to run the embedding model.",
            PipelineError::Cancelled(_) => "Processing was cancelled.",
            PipelineError::DeadlineExceeded(_) => "Processing timed out.",
        }
    }
}

/// A signature together with the face it was computed from.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub signature: Signature,
    pub face: DetectedFace,
}

/// Run the full signature pipeline over raw image bytes.
///
/// Only the top-ranked face is used; other candidates are discarded.
pub fn extract_signature(
    models: &mut ModelRegistry,
    bytes: &[u8],
    cancel: &CancelToken,
) -> Result<Extraction, PipelineError> {
    cancel.checkpoint(Stage::Decode)?;
    let image = frame::decode_image(bytes)?;

    cancel.checkpoint(Stage::Locate)?;
    let face = models
        .locator()
        .locate(&image)?
        .into_iter()
        .next()
        .ok_or(PipelineError::NoFaceDetected)?;
    tracing::debug!(?face, "top-ranked face");

    cancel.checkpoint(Stage::Crop)?;
    let size = models.embedder().input_size();
    let crop = crop::normalize_face(&image, &face, size)?;
    drop(image);

    cancel.checkpoint(Stage::Embed)?;
    let signature = models.embedder().embed(&crop)?;

    tracing::debug!(
        dims = signature.len(),
        confidence = face.confidence,
        "signature extracted"
    );

    Ok(Extraction { signature, face })
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::frame::fixtures::png_rgba;

    #[test]
    fn test_extract_uses_first_face_and_model_input_size() {
        let embedder = ScriptedEmbedder::with(vec![vec![0.1, 0.2, 0.3]]);
        let calls = embedder.calls.clone();
        let mut models = registry(
            vec![face_at(4.0, 4.0, 20.0), face_at(30.0, 30.0, 10.0)],
            embedder,
        );

        let bytes = png_rgba(64, 48, [1, 2, 3, 255]);
        let out = run(&mut models, &bytes).unwrap();

        assert_eq!(out.signature.values, vec![0.1, 0.2, 0.3]);
        assert_eq!(out.face.left, 4.0);
        assert_eq!(*calls.lock().unwrap(), vec![(32, 32)]);
    }

    #[test]
    fn test_extract_no_face() {
        let embedder = ScriptedEmbedder::with(vec![vec![1.0]]);
        let calls = embedder.calls.clone();
        let mut models = registry(vec![], embedder);

        let bytes = png_rgba(16, 16, [0, 0, 0, 255]);
        let err = run(&mut models, &bytes).unwrap_err();

        assert!(matches!(err, PipelineError::NoFaceDetected));
        assert!(
            calls.lock().unwrap().is_empty(),
            "embedder must not run without a face"
        );
    }

    #[test]
    fn test_extract_decode_error() {
        let mut models = registry(vec![face_at(0.0, 0.0, 8.0)], ScriptedEmbedder::default());
        let err = run(&mut models, b"GIF89a-garbage").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_extract_crop_error_for_face_outside_image() {
        let faces = vec![face_at(100.0, 100.0, 10.0)];
        let mut models = registry(faces, ScriptedEmbedder::default());
        let bytes = png_rgba(16, 16, [0, 0, 0, 255]);
        let err = run(&mut models, &bytes).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Crop(CropError::Degenerate { .. })
        ));
    }

    #[test]
    fn test_extract_honours_cancellation() {
        let mut models = registry(vec![face_at(0.0, 0.0, 8.0)], ScriptedEmbedder::default());
        let token = CancelToken::new();
        token.cancel();
        let bytes = png_rgba(16, 16, [0, 0, 0, 255]);
        let err = extract_signature(&mut models, &bytes, &token).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(Stage::Decode)));
    }

    #[test]
    fn test_public_messages_hide_details() {
        let cause = EmbedderError::InferenceFailed("secret /opt/models".into());
        let err = PipelineError::Embedding(cause);
        assert!(!err.public_message().contains("/opt"));
    }
}
