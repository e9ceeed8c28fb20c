//! SCRFD face detector via ONNX Runtime.
//!
//! SCRFD predicts, for every anchor on three feature strides, a face score,
//! distances from the anchor centre to the four box edges and five landmark
//! offsets. All are in stride units on the 640x640 letterboxed input.

use crate::postprocess::{letterbox_tensor, nms, LetterboxInfo};
use crate::types::BoundingBox;
use image::RgbImage;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const LANDMARKS: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("face detection model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Positions of one stride's score, box and landmark heads in the output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadIndices {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD face detector. Boxes come back in frame pixels with landmarks.
pub struct FaceDetector {
    session: Session,
    heads: [HeadIndices; 3],
}

impl FaceDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 SCRFD outputs, model has {}",
                names.len()
            )));
        }

        let heads = resolve_heads(&names);
        tracing::debug!(path = model_path, outputs = ?names, ?heads, "SCRFD heads resolved");
        Ok(Self { session, heads })
    }

    /// Faces in `frame`, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) =
            letterbox_tensor(frame, INPUT_SIZE, PIXEL_MEAN, |v| (v - PIXEL_MEAN) / PIXEL_STD);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (heads, stride) in self.heads.iter().zip(STRIDES) {
            let level = StrideLevel {
                stride,
                scores: head_data(&outputs[heads.score], "score", stride)?,
                boxes: head_data(&outputs[heads.bbox], "bbox", stride)?,
                kps: head_data(&outputs[heads.kps], "kps", stride)?,
            };
            candidates.extend(level.decode(&letterbox, SCORE_THRESHOLD));
        }

        Ok(nms(candidates, NMS_IOU, |b| b))
    }
}

fn head_data<'o>(value: &'o DynValue, head: &str, stride: usize) -> Result<&'o [f32], DetectorError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| DetectorError::InferenceFailed(format!("{head} head, stride {stride}: {e}")))
}

/// Match heads by their `score_8` / `bbox_16` / `kps_32` names when the
/// export carries them. Otherwise assume the insightface order: all
/// scores, then all boxes, then all landmarks, each by ascending stride.
fn resolve_heads(names: &[String]) -> [HeadIndices; 3] {
    let position = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let by_name = |stride: usize| {
        Some(HeadIndices {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    if let [Some(a), Some(b), Some(c)] = STRIDES.map(by_name) {
        return [a, b, c];
    }
    std::array::from_fn(|i| HeadIndices {
        score: i,
        bbox: i + 3,
        kps: i + 6,
    })
}

/// Raw head outputs for one stride.
struct StrideLevel<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideLevel<'_> {
    fn anchors(&self) -> usize {
        let cells = INPUT_SIZE / self.stride;
        cells * cells * ANCHORS_PER_CELL
    }

    /// Centre of `anchor` in letterboxed input pixels. Anchors are laid out
    /// row-major with `ANCHORS_PER_CELL` consecutive anchors per cell.
    fn centre(&self, anchor: usize) -> (f32, f32) {
        let cells = INPUT_SIZE / self.stride;
        let cell = anchor / ANCHORS_PER_CELL;
        let s = self.stride as f32;
        ((cell % cells) as f32 * s, (cell / cells) as f32 * s)
    }

    fn decode(&self, letterbox: &LetterboxInfo, threshold: f32) -> Vec<BoundingBox> {
        let s = self.stride as f32;
        let limit = self.anchors().min(self.scores.len());
        let mut out = Vec::new();

        for anchor in 0..limit {
            let score = self.scores[anchor];
            if score <= threshold {
                continue;
            }
            let Some(d) = self.boxes.get(anchor * 4..anchor * 4 + 4) else {
                continue;
            };

            let (cx, cy) = self.centre(anchor);
            let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

            let landmarks = self
                .kps
                .get(anchor * LANDMARKS * 2..(anchor + 1) * LANDMARKS * 2)
                .map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * s, cy + k[i * 2 + 1] * s))
                });

            out.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const IDENTITY: LetterboxInfo = LetterboxInfo {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
    };

    #[test]
    fn test_resolve_heads_by_name() {
        let heads = resolve_heads(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]));
        assert_eq!(heads[0], HeadIndices { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], HeadIndices { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_resolve_heads_positional_when_unnamed() {
        let unnamed: Vec<String> = (400..409).map(|i: usize| i.to_string()).collect();
        let heads = resolve_heads(&unnamed);
        assert_eq!(heads[1], HeadIndices { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_single_anchor() {
        // Stride 32: 20x20 cells. Anchor 2 is the first anchor of cell (1, 0).
        let level_anchors = 20 * 20 * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; level_anchors];
        scores[2] = 0.9;
        let mut boxes = vec![0.0f32; level_anchors * 4];
        boxes[8..12].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0f32; level_anchors * 10];

        let level = StrideLevel {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            kps: &kps,
        };
        let faces = level.decode(&IDENTITY, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 16.0).abs() < 1e-4);
        assert!((f.y + 16.0).abs() < 1e-4);
        assert!((f.width - 32.0).abs() < 1e-4);
        assert_eq!(f.landmarks.map(|l| l[0]), Some((32.0, 0.0)));
    }

    #[test]
    fn test_decode_threshold_is_exclusive() {
        let level_anchors = 20 * 20 * ANCHORS_PER_CELL;
        let scores = vec![SCORE_THRESHOLD; level_anchors];
        let boxes = vec![1.0f32; level_anchors * 4];
        let level = StrideLevel {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            kps: &[],
        };
        assert!(level.decode(&IDENTITY, SCORE_THRESHOLD).is_empty());
    }

    #[test]
    fn test_decode_without_landmarks() {
        let scores = [0.8f32, 0.0];
        let boxes = [1.0f32; 8];
        let level = StrideLevel {
            stride: 8,
            scores: &scores,
            boxes: &boxes,
            kps: &[],
        };
        let faces = level.decode(&IDENTITY, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        assert!(faces[0].landmarks.is_none());
    }

    #[test]
    fn test_missing_model_reported() {
        assert!(matches!(
            FaceDetector::load("/nonexistent/det.onnx"),
            Err(DetectorError::ModelNotFound(_))
        ));
    }
}
