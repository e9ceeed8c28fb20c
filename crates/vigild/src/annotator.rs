//! Detection overlays drawn onto a copy of the frame.

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use vigil_core::{FaceObservation, Identity, WeaponDetection};

const RED: Rgb<u8> = Rgb([255, 0, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

const BOX_THICKNESS: i32 = 2;
/// Label baseline sits this far from the box edge.
const LABEL_OFFSET: i32 = 10;
const WEAPON_LABEL_SCALE: f32 = 16.0;
const FACE_LABEL_SCALE: f32 = 22.0;

/// Text anchored by its baseline-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub x: i32,
    pub baseline: i32,
    pub scale: f32,
}

/// One drawing instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub color: Rgb<u8>,
    /// `(x1, y1, x2, y2)`, exclusive on the far edges.
    pub rect: Option<(i32, i32, i32, i32)>,
    pub label: Option<Label>,
}

/// Draws weapon and face overlays.
pub struct FrameAnnotator {
    font: Option<FontArc>,
}

impl FrameAnnotator {
    /// Load the label font. A missing or invalid font disables labels.
    pub fn load(font_path: &Path) -> Self {
        let font = match std::fs::read(font_path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(path = %font_path.display(), error = %e, "invalid font; overlay labels disabled");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(path = %font_path.display(), error = %e, "font not readable; overlay labels disabled");
                None
            }
        };
        Self { font }
    }

    /// Boxes only.
    pub fn without_labels() -> Self {
        Self { font: None }
    }

    /// Annotated copy of `frame`. The input is never modified.
    pub fn annotate(
        &self,
        frame: &RgbImage,
        weapons: &[WeaponDetection],
        faces: &[FaceObservation],
    ) -> RgbImage {
        let mut out = frame.clone();
        for overlay in overlays(frame.width(), frame.height(), weapons, faces) {
            if let Some(rect) = overlay.rect {
                draw_box(&mut out, rect, overlay.color);
            }
            if let (Some(label), Some(font)) = (&overlay.label, &self.font) {
                let top = (label.baseline - label.scale.round() as i32).max(0);
                draw_text_mut(
                    &mut out,
                    overlay.color,
                    label.x,
                    top,
                    PxScale::from(label.scale),
                    font,
                    &label.text,
                );
            }
        }
        out
    }
}

/// Drawing instructions for one frame, weapons first, in input order.
pub fn overlays(
    width: u32,
    height: u32,
    weapons: &[WeaponDetection],
    faces: &[FaceObservation],
) -> Vec<Overlay> {
    let mut out = Vec::with_capacity(weapons.len() + faces.len());

    for w in weapons {
        out.push(Overlay {
            color: RED,
            rect: Some((w.x1, w.y1, w.x2, w.y2)),
            label: Some(Label {
                text: format!("Weapon ({:.2})", w.confidence),
                x: w.x1,
                baseline: w.y1 - LABEL_OFFSET,
                scale: WEAPON_LABEL_SCALE,
            }),
        });
    }

    for face in faces {
        let Some((x1, y1, x2, y2)) = face.bbox.to_corners(width, height) else {
            continue;
        };
        let above = |text: String| Label {
            text,
            x: x1,
            baseline: y1 - LABEL_OFFSET,
            scale: FACE_LABEL_SCALE,
        };
        out.push(match &face.identity {
            Identity::Blacklisted(name) => Overlay {
                color: RED,
                rect: Some((x1, y1, x2, y2)),
                label: Some(above(format!("Blacklisted: {name}"))),
            },
            Identity::Unknown => Overlay {
                color: YELLOW,
                rect: Some((x1, y1, x2, y2)),
                label: Some(above("Unknown Person".to_string())),
            },
            Identity::Known(name) => Overlay {
                color: GREEN,
                rect: None,
                label: Some(Label {
                    text: name.clone(),
                    x: x1,
                    baseline: y2 - LABEL_OFFSET,
                    scale: FACE_LABEL_SCALE,
                }),
            },
        });
    }

    out
}

fn draw_box(image: &mut RgbImage, (x1, y1, x2, y2): (i32, i32, i32, i32), color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let w = x2 - x1 - 2 * inset;
        let h = y2 - y1 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{BoundingBox, WeaponClass};

    fn frame() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    fn face(identity: Identity) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 20.0,
                height: 20.0,
                confidence: 0.9,
                landmarks: None,
            },
            identity,
        }
    }

    fn weapon() -> WeaponDetection {
        WeaponDetection {
            x1: 2,
            y1: 3,
            x2: 30,
            y2: 25,
            class: WeaponClass::Gun,
            confidence: 0.874,
        }
    }

    #[test]
    fn test_no_detections_is_bit_identical() {
        let input = frame();
        let out = FrameAnnotator::without_labels().annotate(&input, &[], &[]);
        assert_eq!(out.as_raw(), input.as_raw());
    }

    #[test]
    fn test_input_not_mutated() {
        let input = frame();
        let before = input.clone();
        let _ = FrameAnnotator::without_labels().annotate(&input, &[weapon()], &[]);
        assert_eq!(input, before);
    }

    #[test]
    fn test_weapon_overlay() {
        let ov = overlays(64, 48, &[weapon()], &[]);
        assert_eq!(ov.len(), 1);
        assert_eq!(ov[0].color, RED);
        assert_eq!(ov[0].rect, Some((2, 3, 30, 25)));
        assert_eq!(ov[0].label.as_ref().unwrap().text, "Weapon (0.87)");
    }

    #[test]
    fn test_face_overlays_by_identity() {
        let faces = [
            face(Identity::Blacklisted("Alice".into())),
            face(Identity::Unknown),
            face(Identity::Known("Bob".into())),
        ];
        let ov = overlays(64, 48, &[], &faces);

        assert_eq!(ov[0].color, RED);
        assert_eq!(ov[0].label.as_ref().unwrap().text, "Blacklisted: Alice");
        assert_eq!(ov[1].color, YELLOW);
        assert_eq!(ov[1].label.as_ref().unwrap().text, "Unknown Person");

        assert_eq!(ov[2].color, GREEN);
        assert!(ov[2].rect.is_none());
        let label = ov[2].label.as_ref().unwrap();
        assert_eq!(label.text, "Bob");
        assert_eq!(label.baseline, 40 - LABEL_OFFSET);
    }

    #[test]
    fn test_box_is_two_pixels_thick() {
        let input = RgbImage::new(64, 48);
        let out = FrameAnnotator::without_labels().annotate(&input, &[weapon()], &[]);
        assert_eq!(out.get_pixel(2, 10), &RED);
        assert_eq!(out.get_pixel(3, 10), &RED);
        assert_eq!(out.get_pixel(4, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_known_face_draws_no_box_without_font() {
        let input = frame();
        let out = FrameAnnotator::without_labels().annotate(&input, &[], &[face(Identity::Known("Bob".into()))]);
        assert_eq!(out.as_raw(), input.as_raw());
    }

    #[test]
    fn test_face_outside_frame_skipped() {
        let mut outside = face(Identity::Unknown);
        outside.bbox.x = 100.0;
        assert!(overlays(64, 48, &[], &[outside]).is_empty());
    }

    #[test]
    fn test_missing_font_disables_labels() {
        let annotator = FrameAnnotator::load(Path::new("/nonexistent/font.ttf"));
        assert!(annotator.font.is_none());
    }
}
