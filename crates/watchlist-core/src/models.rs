//! Capability boundaries for face location and embedding, and the registry
//! that owns the loaded handles.

use crate::detector::{DetectorError, ScrfdLocator};
use crate::embedder::{EmbedderError, OnnxEmbedder};
use crate::frame::RgbFrame;
use crate::types::{DetectedFace, Signature};
use std::path::Path;
use thiserror::Error;

/// Finds candidate faces in a decoded image.
///
/// Returns boxes ranked best first. An empty list means "no face", not an error.
pub trait FaceLocator: Send {
    fn locate(&mut self, frame: &RgbFrame) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Turns a normalised face crop into a signature.
pub trait EmbeddingGenerator: Send {
    /// Square side length, in pixels, of the crop `embed` expects.
    fn input_size(&self) -> u32;

    fn embed(&mut self, face: &RgbFrame) -> Result<Signature, EmbedderError>;
}

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("face locator: {0}")]
    Locator(#[from] DetectorError),
    #[error("embedding generator: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Loaded inference handles.
///
/// Built once at startup and then owned by a single worker; the handles
/// take `&mut self` and are not meant to be driven concurrently.
pub struct ModelRegistry {
    locator: Box<dyn FaceLocator>,
    embedder: Box<dyn EmbeddingGenerator>,
}

impl ModelRegistry {
    pub fn new(locator: Box<dyn FaceLocator>, embedder: Box<dyn EmbeddingGenerator>) -> Self {
        Self { locator, embedder }
    }

    /// Load the SCRFD locator and the ONNX embedder. Any failure is fatal.
    pub fn load_onnx(
        detector_path: &Path,
        embedder_path: &Path,
        embedder_input_size: u32,
    ) -> Result<Self, InitializationError> {
        let locator = ScrfdLocator::load(detector_path)?;
        tracing::info!(path = %detector_path.display(), "face locator loaded");

        let embedder = OnnxEmbedder::load(embedder_path, embedder_input_size)?;
        tracing::info!(path = %embedder_path.display(), "embedding generator loaded");

        Ok(Self::new(Box::new(locator), Box::new(embedder)))
    }

    pub fn locator(&mut self) -> &mut dyn FaceLocator {
        self.locator.as_mut()
    }

    pub fn embedder(&mut self) -> &mut dyn EmbeddingGenerator {
        self.embedder.as_mut()
    }
}
