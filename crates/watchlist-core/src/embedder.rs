//! Face signature extraction via ONNX Runtime.
//!
//! Runs a square-input image embedding network (MobileNet-style, 224×224 by
//! default) over a normalised face crop and returns its feature vector.

use crate::frame::RgbFrame;
use crate::models::EmbeddingGenerator;
use crate::types::Signature;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
pub const DEFAULT_EMBEDDER_INPUT_SIZE: u32 = 224;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}x{expected} input, got {width}x{height}")]
    WrongInputSize {
        expected: u32,
        width: u32,
        height: u32,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed embedding generator.
pub struct OnnxEmbedder {
    session: Session,
    input_size: u32,
}

impl OnnxEmbedder {
    /// Load the embedding model; `input_size` is the square side it expects.
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            let path = model_path.display().to_string();
            return Err(EmbedderError::ModelNotFound(path));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let inputs: Vec<&str> = session.inputs().iter().map(|i| i.name()).collect();
        let outputs: Vec<&str> = session.outputs().iter().map(|o| o.name()).collect();
        tracing::info!(
            path = %model_path.display(),
            input_size,
            ?inputs,
            ?outputs,
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size,
        })
    }

    /// Preprocess an RGB crop into a NCHW float tensor in [-1, 1].
    fn preprocess(face: &RgbFrame) -> Array4<f32> {
        let w = face.width as usize;
        let h = face.height as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

        for (i, px) in face.data.chunks_exact(3).take(w * h).enumerate() {
            let (y, x) = (i / w, i % w);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (px[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }

        tensor
    }
}

impl EmbeddingGenerator for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn embed(&mut self, face: &RgbFrame) -> Result<Signature, EmbedderError> {
        if face.width != self.input_size || face.height != self.input_size {
            return Err(EmbedderError::WrongInputSize {
                expected: self.input_size,
                width: face.width,
                height: face.height,
            });
        }

        let input = Self::preprocess(face);
        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self.session.run(ort::inputs![tensor])?;

        let (_, raw) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            EmbedderError::InferenceFailed(format!("embedding extraction: {e}"))
        })?;

        if raw.is_empty() {
            return Err(EmbedderError::InferenceFailed(
                "model produced an empty embedding".into(),
            ));
        }

        Ok(Signature::new(raw.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(size: u32, rgb: [u8; 3]) -> RgbFrame {
        RgbFrame {
            data: rgb.repeat((size * size) as usize),
            width: size,
            height: size,
        }
    }

    #[test]
    fn test_preprocess_output_shape() {
        let s = DEFAULT_EMBEDDER_INPUT_SIZE;
        let tensor = OnnxEmbedder::preprocess(&crop(s, [128, 128, 128]));
        let s = s as usize;
        assert_eq!(tensor.shape(), &[1, 3, s, s]);
    }

    #[test]
    fn test_preprocess_normalization_range() {
        let tensor = OnnxEmbedder::preprocess(&crop(8, [0, 255, 128]));
        assert!((tensor[[0, 0, 3, 3]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 3, 3]] - 1.0).abs() < 1e-6);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        assert!((tensor[[0, 2, 3, 3]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut face = crop(4, [0, 0, 0]);
        // pixel (x=2, y=1) -> pure red
        let i = (4 + 2) * 3;
        face.data[i] = 255;
        let tensor = OnnxEmbedder::preprocess(&face);
        assert!((tensor[[0, 0, 1, 2]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 2]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 2, 1]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/embedder.onnx"), 224).err();
        assert!(matches!(err, Some(EmbedderError::ModelNotFound(_))));
    }
}
