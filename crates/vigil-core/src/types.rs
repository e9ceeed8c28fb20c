use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected object, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer corner coordinates `(x1, y1, x2, y2)`, clamped to a `width × height` frame.
    ///
    /// Returns `None` when the clamped box has no area.
    pub fn to_corners(&self, width: u32, height: u32) -> Option<(i32, i32, i32, i32)> {
        let max_x = width as f32;
        let max_y = height as f32;
        let x1 = self.x.clamp(0.0, max_x).round() as i32;
        let y1 = self.y.clamp(0.0, max_y).round() as i32;
        let x2 = (self.x + self.width).clamp(0.0, max_x).round() as i32;
        let y2 = (self.y + self.height).clamp(0.0, max_y).round() as i32;
        (x1 < x2 && y1 < y2).then_some((x1, y1, x2, y2))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings. Smaller = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Weapon classes emitted by the detector. Model class 0 is a gun, 1 a knife.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeaponClass {
    Gun,
    Knife,
}

impl WeaponClass {
    pub fn from_class_id(id: usize) -> Option<Self> {
        match id {
            0 => Some(Self::Gun),
            1 => Some(Self::Knife),
            _ => None,
        }
    }
}

impl fmt::Display for WeaponClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gun => f.write_str("gun"),
            Self::Knife => f.write_str("knife"),
        }
    }
}

/// A weapon detection in frame pixel coordinates. Invariant: `x1 < x2`, `y1 < y2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponDetection {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub class: WeaponClass,
    pub confidence: f32,
}

impl fmt::Display for WeaponDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, {}, {}) {:.2}",
            self.class, self.x1, self.y1, self.x2, self.y2, self.confidence
        )
    }
}

/// Resolved identity of one detected face.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    Blacklisted(String),
    Unknown,
}

/// One detected face in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub identity: Identity,
}

/// A detected face together with its embedding, before identity resolution.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Which list a gallery entry was enrolled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Denied,
    Known,
}

/// A named reference embedding.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub name: String,
    pub listing: Listing,
    pub embedding: Embedding,
}

/// Ordered collection of reference embeddings.
///
/// Iteration order is enrolment order: denylist entries first, then known
/// persons. Identity resolution depends on this order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. A name already present for the same listing is ignored.
    pub fn push(&mut self, name: impl Into<String>, listing: Listing, embedding: Embedding) -> bool {
        let name = name.into();
        if self
            .entries
            .iter()
            .any(|e| e.listing == listing && e.name == name)
        {
            tracing::warn!(name = %name, ?listing, "duplicate gallery name ignored");
            return false;
        }
        self.entries.push(GalleryEntry {
            name,
            listing,
            embedding,
        });
        true
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `name` was enrolled from the denylist.
    pub fn is_denied(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.listing == Listing::Denied && e.name == name)
    }

    /// Resolve a probe embedding to an identity using `matcher`.
    pub fn identify(&self, probe: &Embedding, matcher: &dyn Matcher) -> Identity {
        match matcher.find(probe, &self.entries) {
            Some(entry) if self.is_denied(&entry.name) => Identity::Blacklisted(entry.name.clone()),
            Some(entry) => Identity::Known(entry.name.clone()),
            None => Identity::Unknown,
        }
    }
}

/// Strategy for finding the gallery entry that matches a probe embedding.
pub trait Matcher {
    fn find<'g>(&self, probe: &Embedding, gallery: &'g [GalleryEntry]) -> Option<&'g GalleryEntry>;
}

/// Default tolerance on Euclidean embedding distance for a positive match.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;

/// First-match-wins matcher.
///
/// Walks the gallery in order and returns the first entry whose distance is
/// within tolerance. This is not nearest-neighbour matching: when two entries
/// are both within tolerance the earlier one is reported even if the later
/// one is closer.
#[derive(Debug, Clone, Copy)]
pub struct FirstMatch {
    pub tolerance: f32,
}

impl Default for FirstMatch {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl Matcher for FirstMatch {
    fn find<'g>(&self, probe: &Embedding, gallery: &'g [GalleryEntry]) -> Option<&'g GalleryEntry> {
        gallery
            .iter()
            .find(|entry| probe.euclidean_distance(&entry.embedding) <= self.tolerance)
    }
}
