//! ArcFace embeddings via ONNX Runtime.
//!
//! Faces are aligned to the canonical 112x112 template from their SCRFD
//! landmarks, then embedded with the w600k_r50 model. Embeddings are unit
//! length, so Euclidean distance between them lies in [0, 2].

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// ArcFace normalises symmetrically: (v - 127.5) / 127.5.
const PIXEL_SCALE: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("face recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks to align on")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;
        Ok(Self { session })
    }

    /// Embed the face described by `face`, which must carry landmarks.
    pub fn extract(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let input = input_tensor(&align_face(frame, landmarks));

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "embedding has {} values, expected {EMBEDDING_DIM}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: unit_length(raw),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

/// NCHW tensor of the aligned crop, RGB channel order.
fn input_tensor(aligned: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let v = aligned
            .get_pixel_checked(x as u32, y as u32)
            .map_or(PIXEL_SCALE, |p| p[c] as f32);
        (v - PIXEL_SCALE) / PIXEL_SCALE
    })
}

fn unit_length(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|v| v / norm).collect()
}
