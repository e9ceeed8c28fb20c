//! Face encoding and per-frame identity resolution.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{EncodedFace, FaceObservation, FirstMatch, Gallery};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns an image into one embedding per detected face, in detector order.
pub trait FaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFace>, FaceError>;
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, FaceError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");
        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFace>, FaceError> {
        let faces = self.detector.detect(image)?;
        let mut encoded = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self.recognizer.extract(image, &bbox)?;
            encoded.push(EncodedFace { bbox, embedding });
        }
        Ok(encoded)
    }
}

/// Resolves every face in a frame against the gallery.
pub struct FaceMatcher {
    encoder: Box<dyn FaceEncoder + Send>,
    gallery: Gallery,
    matcher: FirstMatch,
}

impl FaceMatcher {
    pub fn new(encoder: Box<dyn FaceEncoder + Send>, gallery: Gallery, matcher: FirstMatch) -> Self {
        Self {
            encoder,
            gallery,
            matcher,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// One observation per detected face, in detector order. Each face is
    /// resolved independently.
    pub fn observe(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>, FaceError> {
        let faces = self.encoder.encode(frame)?;
        Ok(faces
            .into_iter()
            .map(|face| FaceObservation {
                identity: self.gallery.identify(&face.embedding, &self.matcher),
                bbox: face.bbox,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding, Identity, Listing};

    struct FixedEncoder(Vec<EncodedFace>);

    impl FaceEncoder for FixedEncoder {
        fn encode(&mut self, _image: &RgbImage) -> Result<Vec<EncodedFace>, FaceError> {
            Ok(self.0.clone())
        }
    }

    fn face(x: f32, values: &[f32]) -> EncodedFace {
        EncodedFace {
            bbox: BoundingBox {
                x, y: 0.0, width: 10.0, height: 10.0,
                confidence: 0.9, landmarks: None,
            },
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_observe_resolves_each_face_in_order() {
        let mut gallery = Gallery::new();
        gallery.push("alice", Listing::Denied, Embedding::new(vec![1.0, 0.0]));
        gallery.push("bob", Listing::Known, Embedding::new(vec![0.0, 1.0]));

        let encoder = FixedEncoder(vec![
            face(0.0, &[0.0, 1.0]),
            face(20.0, &[1.0, 0.0]),
            face(40.0, &[-1.0, 0.0]),
        ]);
        let mut matcher = FaceMatcher::new(Box::new(encoder), gallery, FirstMatch::default());

        let obs = matcher.observe(&RgbImage::new(64, 64)).unwrap();
        let identities: Vec<_> = obs.iter().map(|o| o.identity.clone()).collect();
        assert_eq!(
            identities,
            vec![
                Identity::Known("bob".into()),
                Identity::Blacklisted("alice".into()),
                Identity::Unknown,
            ]
        );
        assert_eq!(obs[1].bbox.x, 20.0);
    }

    #[test]
    fn test_observe_no_faces() {
        let mut matcher = FaceMatcher::new(
            Box::new(FixedEncoder(Vec::new())),
            Gallery::new(),
            FirstMatch::default(),
        );
        assert!(matcher.observe(&RgbImage::new(8, 8)).unwrap().is_empty());
    }
}
