//! YOLOv8 weapon detector via ONNX Runtime.
//!
//! Consumes an Ultralytics ONNX export with output `[1, 4 + classes, anchors]`
//! (or its transpose) where class 0 is a gun and class 1 a knife.

use crate::postprocess::{letterbox_tensor, nms, LetterboxInfo};
use crate::types::{BoundingBox, WeaponClass, WeaponDetection};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: f32 = 114.0;
const YOLO_NMS_THRESHOLD: f32 = 0.7;

/// Detections at or below this confidence are discarded. Fixed policy, not configuration.
pub const WEAPON_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum WeaponError {
    #[error("weapon model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Frame → ordered weapon detections.
pub trait WeaponDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<WeaponDetection>, WeaponError>;
}

#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoundingBox,
    class: WeaponClass,
}

/// YOLOv8-based weapon detector.
pub struct YoloWeaponDetector {
    session: Session,
}

impl YoloWeaponDetector {
    /// Load the YOLOv8 ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, WeaponError> {
        if !Path::new(model_path).exists() {
            return Err(WeaponError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YOLOv8 weapon model"
        );

        Ok(Self { session })
    }
}

impl WeaponDetector for YoloWeaponDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<WeaponDetection>, WeaponError> {
        let (input, letterbox) = letterbox_tensor(frame, YOLO_INPUT_SIZE, YOLO_PAD_VALUE, |v| v / 255.0);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| WeaponError::InferenceFailed(format!("predictions: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        let layout = PredictionLayout::from_dims(&dims)
            .ok_or_else(|| WeaponError::InferenceFailed(format!("unexpected output shape {dims:?}")))?;

        let candidates = decode_predictions(data, layout, &letterbox, WEAPON_CONFIDENCE_THRESHOLD);
        let (width, height) = frame.dimensions();

        Ok(suppress_per_class(candidates)
            .into_iter()
            .filter_map(|c| {
                let (x1, y1, x2, y2) = c.bbox.to_corners(width, height)?;
                Some(WeaponDetection {
                    x1,
                    y1,
                    x2,
                    y2,
                    class: c.class,
                    confidence: c.bbox.confidence,
                })
            })
            .collect())
    }
}

/// Memory layout of the prediction tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PredictionLayout {
    channels: usize,
    anchors: usize,
    /// `[1, channels, anchors]` (Ultralytics default) vs `[1, anchors, channels]`.
    channel_major: bool,
}

impl PredictionLayout {
    fn from_dims(dims: &[usize]) -> Option<Self> {
        let [_, a, b] = dims else {
            return None;
        };
        let (channels, anchors, channel_major) = if a <= b { (*a, *b, true) } else { (*b, *a, false) };
        (channels > 4).then_some(Self {
            channels,
            anchors,
            channel_major,
        })
    }

    fn value(&self, data: &[f32], channel: usize, anchor: usize) -> f32 {
        let idx = if self.channel_major {
            channel * self.anchors + anchor
        } else {
            anchor * self.channels + channel
        };
        data.get(idx).copied().unwrap_or(0.0)
    }
}

/// Decode raw predictions into weapon candidates in frame coordinates.
///
/// Each anchor takes its best-scoring class; anchors whose best class is not a
/// weapon class, or whose score is not above `threshold`, are dropped.
fn decode_predictions(
    data: &[f32],
    layout: PredictionLayout,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let num_classes = layout.channels - 4;
    let mut candidates = Vec::new();

    for anchor in 0..layout.anchors {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, layout.value(data, 4 + c, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        if score <= threshold {
            continue;
        }
        let Some(class) = WeaponClass::from_class_id(class_id) else {
            continue;
        };

        let cx = layout.value(data, 0, anchor);
        let cy = layout.value(data, 1, anchor);
        let w = layout.value(data, 2, anchor);
        let h = layout.value(data, 3, anchor);

        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

        candidates.push(Candidate {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks: None,
            },
            class,
        });
    }

    candidates
}

/// Class-aware NMS; output is sorted by descending confidence.
fn suppress_per_class(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let (guns, knives): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.class == WeaponClass::Gun);

    let mut kept = nms(guns, YOLO_NMS_THRESHOLD, |c: &Candidate| &c.bbox);
    kept.extend(nms(knives, YOLO_NMS_THRESHOLD, |c: &Candidate| &c.bbox));
    kept.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: LetterboxInfo = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

    /// Build a channel-major `[1, 4 + classes, anchors]` buffer.
    fn predictions(rows: &[[f32; 7]]) -> (Vec<f32>, PredictionLayout) {
        let layout = PredictionLayout { channels: 7, anchors: rows.len(), channel_major: true };
        let mut data = vec![0.0; 7 * rows.len()];
        for (anchor, row) in rows.iter().enumerate() {
            for (channel, v) in row.iter().enumerate() {
                data[channel * rows.len() + anchor] = *v;
            }
        }
        (data, layout)
    }

    #[test]
    fn test_layout_from_dims() {
        assert_eq!(
            PredictionLayout::from_dims(&[1, 6, 8400]),
            Some(PredictionLayout { channels: 6, anchors: 8400, channel_major: true })
        );
        assert_eq!(
            PredictionLayout::from_dims(&[1, 8400, 6]),
            Some(PredictionLayout { channels: 6, anchors: 8400, channel_major: false })
        );
        assert_eq!(PredictionLayout::from_dims(&[1, 4, 8400]), None);
        assert_eq!(PredictionLayout::from_dims(&[8400, 6]), None);
    }

    #[test]
    fn test_decode_threshold_is_strict() {
        let (data, layout) = predictions(&[
            [50.0, 50.0, 20.0, 20.0, 0.5, 0.0, 0.0],
            [150.0, 50.0, 20.0, 20.0, 0.51, 0.0, 0.0],
        ]);
        let dets = decode_predictions(&data, layout, &IDENTITY, WEAPON_CONFIDENCE_THRESHOLD);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].bbox.x - 140.0).abs() < 1e-4);
        assert_eq!(dets[0].class, WeaponClass::Gun);
    }

    #[test]
    fn test_decode_ignores_non_weapon_classes() {
        // Best class is class 2, which is not a weapon.
        let (data, layout) = predictions(&[[50.0, 50.0, 20.0, 20.0, 0.6, 0.7, 0.9]]);
        assert!(decode_predictions(&data, layout, &IDENTITY, 0.5).is_empty());

        let (data, layout) = predictions(&[[50.0, 50.0, 20.0, 20.0, 0.6, 0.8, 0.1]]);
        let dets = decode_predictions(&data, layout, &IDENTITY, 0.5);
        assert_eq!(dets[0].class, WeaponClass::Knife);
    }

    #[test]
    fn test_decode_unmaps_letterbox() {
        let letterbox = LetterboxInfo { scale: 0.5, pad_x: 0.0, pad_y: 80.0 };
        let (data, layout) = predictions(&[[100.0, 180.0, 40.0, 40.0, 0.9, 0.0, 0.0]]);
        let dets = decode_predictions(&data, layout, &letterbox, 0.5);
        let b = &dets[0].bbox;
        // x: (80 / 0.5, 120 / 0.5), y: ((160 - 80) / 0.5, (200 - 80) / 0.5)
        assert!((b.x - 160.0).abs() < 1e-4);
        assert!((b.y - 160.0).abs() < 1e-4);
        assert!((b.width - 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_nms_is_class_aware() {
        let (data, layout) = predictions(&[
            [50.0, 50.0, 40.0, 40.0, 0.9, 0.0, 0.0],
            [52.0, 50.0, 40.0, 40.0, 0.8, 0.0, 0.0],
            [50.0, 50.0, 40.0, 40.0, 0.0, 0.7, 0.0],
        ]);
        let kept = suppress_per_class(decode_predictions(&data, layout, &IDENTITY, 0.5));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].class, WeaponClass::Gun);
        assert_eq!(kept[1].class, WeaponClass::Knife);
    }
}
