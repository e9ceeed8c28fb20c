//! vigil-core: weapon detection, face recognition and the denylist.
//!
//! Uses YOLOv8 for weapon detection, SCRFD for face detection and ArcFace for
//! face recognition, all running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod denylist;
pub mod detector;
pub mod face;
mod postprocess;
pub mod recognizer;
pub mod types;
pub mod weapon;

pub use denylist::{DenylistEntry, DenylistRecord, DenylistStore, EncodeReport};
pub use detector::FaceDetector;
pub use face::{FaceEncoder, FaceError, FaceMatcher, OnnxFaceEncoder};
pub use recognizer::FaceRecognizer;
pub use types::{
    BoundingBox, Embedding, EncodedFace, FaceObservation, FirstMatch, Gallery, Identity, Listing,
    Matcher, WeaponClass, WeaponDetection, DEFAULT_MATCH_TOLERANCE,
};
pub use weapon::{WeaponDetector, WeaponError, YoloWeaponDetector, WEAPON_CONFIDENCE_THRESHOLD};

use std::path::PathBuf;

/// Directory searched for ONNX models when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
