//! Voice embedding tensor and the vector math shared by every stage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DistillError, DistillResult};
use crate::style::Style;

/// Fixed-shape f32 tensor that conditions the student engine.
///
/// Embeddings are immutable: interpolation and mutation return new
/// values. Every binary operation requires both operands to share a
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEmbedding")]
pub struct VoiceEmbedding {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawEmbedding {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawEmbedding> for VoiceEmbedding {
    type Error = DistillError;

    fn try_from(raw: RawEmbedding) -> Result<Self, Self::Error> {
        Self::new(raw.shape, raw.data)
    }
}

/// Identifies an embedding produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTag {
    pub style: Style,
    pub step: u64,
    pub score: f64,
}

impl VoiceEmbedding {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> DistillResult<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected == 0 {
            return Err(DistillError::InvalidEmbedding(format!("empty shape {shape:?}")));
        }
        if expected != data.len() {
            return Err(DistillError::InvalidEmbedding(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(DistillError::InvalidEmbedding("non-finite value".into()));
        }
        Ok(Self { shape, data })
    }

    /// Creates a rank-1 embedding.
    pub fn from_vec(data: Vec<f32>) -> DistillResult<Self> {
        Self::new(vec![data.len()], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ensure_same_shape(&self, other: &VoiceEmbedding) -> DistillResult<()> {
        if self.shape != other.shape {
            return Err(DistillError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Linear interpolation `(1 - t) * self + t * other`.
    pub fn lerp(&self, other: &VoiceEmbedding, t: f32) -> DistillResult<Self> {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| (1.0 - t) * a + t * b)
            .collect();
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Elementwise mean of all embeddings.
    pub fn centroid(items: &[VoiceEmbedding]) -> DistillResult<Self> {
        let first = items.first().ok_or(DistillError::NoBaseEmbeddings)?;
        let mut acc = vec![0.0f64; first.len()];
        for item in items {
            first.ensure_same_shape(item)?;
            for (a, &v) in acc.iter_mut().zip(&item.data) {
                *a += v as f64;
            }
        }
        let n = items.len() as f64;
        Ok(Self {
            shape: first.shape.clone(),
            data: acc.into_iter().map(|a| (a / n) as f32).collect(),
        })
    }

    /// Population standard deviation over all elements.
    pub fn std_dev(&self) -> f32 {
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        var.sqrt() as f32
    }

    /// Returns `self + noise * std(self) * diversity`.
    ///
    /// `noise` holds one standard-normal draw per element.
    pub fn perturb(&self, noise: &[f32], diversity: f32) -> DistillResult<Self> {
        if noise.len() != self.data.len() {
            return Err(DistillError::ShapeMismatch {
                expected: self.shape.clone(),
                got: vec![noise.len()],
            });
        }
        let scale = self.std_dev() * diversity;
        let data = self
            .data
            .iter()
            .zip(noise)
            .map(|(&v, &n)| v + n * scale)
            .collect();
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Lowercase hex SHA-256 of the little-endian f32 data.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for v in &self.data {
            hasher.update(v.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Cosine similarity in `[-1, 1]`.
///
/// Uses f64 accumulation. Zero vectors and dimension mismatches
/// report 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Elementwise mean of equally sized vectors. Empty input yields an
/// empty vector.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut acc = vec![0.0f64; first.len()];
    for v in vectors {
        for (a, &x) in acc.iter_mut().zip(v) {
            *a += x as f64;
        }
    }
    let n = vectors.len() as f64;
    acc.into_iter().map(|a| (a / n) as f32).collect()
}

/// Normalizes a vector to unit length in place.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}
