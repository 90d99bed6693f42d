use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding vector produced by an external detection/embedding model.
///
/// The crate never looks inside the model; an embedding is just a fixed-length
/// list of floats. Dimensionality is checked wherever two embeddings meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Returns 0.0 when either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean (L2) distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Distance between two embeddings of equal dimensionality. Lower = closer.
///
/// Callers guarantee equal lengths; implementations may assume it.
pub trait Distance {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;
}

/// Straight-line distance; the conventional metric for dlib-style 128-d encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Distance for Euclidean {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }
}

/// Cosine distance, `1 - similarity`, in [0, 2].
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Distance for Cosine {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        1.0 - a.similarity(b)
    }
}

/// Named distance metric, selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    #[default]
    Euclidean,
    Cosine,
}

impl Distance for DistanceKind {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceKind::Euclidean => Euclidean.distance(a, b),
            DistanceKind::Cosine => Cosine.distance(a, b),
        }
    }
}

impl fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceKind::Euclidean => f.write_str("euclidean"),
            DistanceKind::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceKind::Euclidean),
            "cosine" => Ok(DistanceKind::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((Euclidean.distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical_is_zero() {
        let a = emb(&[0.25, -1.5, 3.0]);
        assert_eq!(Euclidean.distance(&a, &a), 0.0);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((Cosine.distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_distance_kind_parse() {
        assert_eq!("euclidean".parse::<DistanceKind>(), Ok(DistanceKind::Euclidean));
        assert_eq!(" Cosine ".parse::<DistanceKind>(), Ok(DistanceKind::Cosine));
        assert_eq!("l2".parse::<DistanceKind>(), Ok(DistanceKind::Euclidean));
        assert!("manhattan".parse::<DistanceKind>().is_err());
    }

    #[test]
    fn test_distance_kind_dispatch() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((DistanceKind::Euclidean.distance(&a, &b) - 2f32.sqrt()).abs() < 1e-6);
        assert!((DistanceKind::Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
    }
}
