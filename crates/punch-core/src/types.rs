use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dimensionality of every face embedding the engine accepts.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding region of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// True when the vector has exactly [`EMBEDDING_DIM`] finite components.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == EMBEDDING_DIM && self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Named facial landmark sets, e.g. `left_eye` → six ordered points.
///
/// Serialized as a plain JSON object of `name: [[x, y], ...]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Landmarks(BTreeMap<String, Vec<(f32, f32)>>);

impl Landmarks {
    pub const LEFT_EYE: &'static str = "left_eye";
    pub const RIGHT_EYE: &'static str = "right_eye";
    pub const CHIN: &'static str = "chin";
    pub const NOSE_TIP: &'static str = "nose_tip";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, points: Vec<(f32, f32)>) {
        self.0.insert(name.into(), points);
    }

    pub fn with(mut self, name: impl Into<String>, points: Vec<(f32, f32)>) -> Self {
        self.insert(name, points);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[(f32, f32)]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn left_eye(&self) -> Option<&[(f32, f32)]> {
        self.get(Self::LEFT_EYE)
    }

    pub fn right_eye(&self) -> Option<&[(f32, f32)]> {
        self.get(Self::RIGHT_EYE)
    }

    pub fn chin(&self) -> Option<&[(f32, f32)]> {
        self.get(Self::CHIN)
    }

    pub fn nose_tip(&self) -> Option<&[(f32, f32)]> {
        self.get(Self::NOSE_TIP)
    }
}

/// One detected face: where it is, what it looks like, and its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub region: BoundingBox,
    pub embedding: Embedding,
    pub landmarks: Landmarks,
}

/// A raw grayscale frame handed to the engine by the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Pixel data, one byte per pixel (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }
}
