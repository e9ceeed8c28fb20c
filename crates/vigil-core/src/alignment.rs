//! Face alignment onto the ArcFace reference template.
//!
//! A four degree-of-freedom similarity (uniform scale, rotation and
//! translation) is fitted to the five landmarks in closed form and the
//! frame is warped through it with bilinear sampling.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Landmark positions expected by ArcFace in a 112x112 crop:
/// eyes, nose tip, mouth corners.
const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `p' = [a -b; b a] p + t`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `from` onto `to`.
    fn fit(from: &[(f32, f32); 5], to: &[(f32, f32); 5]) -> Self {
        let centroid = |pts: &[(f32, f32); 5]| {
            let (x, y) = pts.iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p.0, ay + p.1));
            (x / 5.0, y / 5.0)
        };
        let (fx, fy) = centroid(from);
        let (tx, ty) = centroid(to);

        let (mut var, mut dot, mut cross) = (0.0f32, 0.0f32, 0.0f32);
        for (p, q) in from.iter().zip(to) {
            let (px, py) = (p.0 - fx, p.1 - fy);
            let (qx, qy) = (q.0 - tx, q.1 - ty);
            var += px * px + py * py;
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
        }

        if var < 1e-12 {
            // All landmarks coincide; only the offset is recoverable.
            return Self {
                a: 1.0,
                b: 0.0,
                tx: tx - fx,
                ty: ty - fy,
            };
        }

        let a = dot / var;
        let b = cross / var;
        Self {
            a,
            b,
            tx: tx - (a * fx - b * fy),
            ty: ty - (b * fx + a * fy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }
}

/// Warp `frame` so that `landmarks` land on the ArcFace template.
/// Pixels sampled from outside the frame are black.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    // A singular fit (zero scale) leaves the crop black.
    if let Some(projection) = Similarity::fit(landmarks, &TEMPLATE).projection() {
        warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut aligned);
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_fit_identity() {
        let s = Similarity::fit(&TEMPLATE, &TEMPLATE);
        assert!((s.a - 1.0).abs() < 1e-4, "{s:?}");
        assert!(s.b.abs() < 1e-4, "{s:?}");
        assert!(s.tx.abs() < 1e-3 && s.ty.abs() < 1e-3, "{s:?}");
    }

    #[test]
    fn test_fit_recovers_scale_and_rotation() {
        // Doubled, then rotated 90 degrees: (x, y) -> (-2y, 2x).
        let src = TEMPLATE.map(|(x, y)| (-2.0 * y, 2.0 * x));
        let s = Similarity::fit(&src, &TEMPLATE);
        for (p, q) in src.iter().zip(TEMPLATE) {
            assert!(close(s.apply(*p), q, 1e-2), "{:?} -> {:?}", p, s.apply(*p));
        }
        assert!((s.a.hypot(s.b) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_fit_degenerate_is_translation() {
        let src = [(10.0, 10.0); 5];
        let s = Similarity::fit(&src, &TEMPLATE);
        assert_eq!((s.a, s.b), (1.0, 0.0));
    }

    #[test]
    fn test_align_output_size_and_fill() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&frame, &TEMPLATE);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        let centre = aligned.get_pixel(56, 56);
        assert!(centre.0.iter().all(|&c| c.abs_diff(128) <= 1), "{centre:?}");
    }

    #[test]
    fn test_patch_lands_on_template_eye() {
        let mut frame = RgbImage::new(200, 200);
        let landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&frame, &landmarks);
        let (ex, ey) = (TEMPLATE[0].0.round() as u32, TEMPLATE[0].1.round() as u32);
        let red = (ey - 1..=ey + 1)
            .flat_map(|y| (ex - 1..=ex + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(red > 100, "no red near ({ex}, {ey}): {red}");
    }
}
