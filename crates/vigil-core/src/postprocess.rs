//! Tensor preparation and box post-processing shared by the detectors.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// How a frame was placed inside the square model input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxInfo {
    /// Model-input coordinates to frame coordinates.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Scale `image` to fit a `size`x`size` square without distortion, centre it
/// on a `pad_value` border and emit a 1x3xSxS tensor with `normalize`
/// applied to every channel value, border included.
pub(crate) fn letterbox_tensor(
    image: &RgbImage,
    size: usize,
    pad_value: f32,
    normalize: impl Fn(f32) -> f32,
) -> (Array4<f32>, LetterboxInfo) {
    let (w, h) = (image.width().max(1) as f32, image.height().max(1) as f32);
    let side = size as f32;
    let scale = (side / w).min(side / h);

    let fit_w = ((w * scale).round() as u32).clamp(1, size as u32);
    let fit_h = ((h * scale).round() as u32).clamp(1, size as u32);
    let pad_x = (side - fit_w as f32) / 2.0;
    let pad_y = (side - fit_h as f32) / 2.0;
    let (left, top) = (pad_x.floor() as u32, pad_y.floor() as u32);

    let resized = imageops::resize(image, fit_w, fit_h, FilterType::Triangle);
    let border = normalize(pad_value);

    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        let (x, y) = (x as u32, y as u32);
        if x < left || y < top {
            return border;
        }
        match resized.get_pixel_checked(x - left, y - top) {
            Some(p) => normalize(p[c] as f32),
            None => border,
        }
    });

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Greedy non-maximum suppression.
///
/// Candidates are visited in descending confidence; each survivor removes
/// every remaining candidate overlapping it by more than `iou_threshold`.
pub(crate) fn nms<T>(mut candidates: Vec<T>, iou_threshold: f32, bbox: impl Fn(&T) -> &BoundingBox) -> Vec<T> {
    candidates.sort_by(|a, b| bbox(b).confidence.total_cmp(&bbox(a).confidence));

    let mut kept: Vec<T> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|k| iou(bbox(k), bbox(&candidate)) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union of two boxes; 0 when the union is empty.
pub(crate) fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap = |a0: f32, a1: f32, b0: f32, b1: f32| (a1.min(b1) - a0.max(b0)).max(0.0);
    let inter = overlap(a.x, a.x + a.width, b.x, b.x + b.width)
        * overlap(a.y, a.y + a.height, b.y, b.y + b.height);
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &bbox(20.0, 20.0, 10.0, 10.0, 1.0)), 0.0);
        // 50 shared of 150 total
        let half = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let empty = bbox(0.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(iou(&empty, &empty), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
            |b| b,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::<BoundingBox>::new(), 0.4, |b| b).is_empty());
    }

    #[test]
    fn test_letterbox_wide_frame_gets_bands_above_and_below() {
        let image = RgbImage::from_pixel(64, 32, Rgb([255, 255, 255]));
        let (tensor, info) = letterbox_tensor(&image, 64, 0.0, |v| v / 255.0);

        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert!((info.scale - 1.0).abs() < 1e-6);
        assert!((info.pad_y - 16.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 2, 63, 10]], 0.0);
        assert!((tensor[[0, 1, 32, 32]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unmap_inverts_placement() {
        let image = RgbImage::new(320, 240);
        let (_, info) = letterbox_tensor(&image, 640, 114.0, |v| v);
        let (x, y) = info.unmap(100.0 * info.scale + info.pad_x, 50.0 * info.scale + info.pad_y);
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1, "{x}, {y}");
    }
}
