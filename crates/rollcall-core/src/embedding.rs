use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of a face encoding produced by the vision backend.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidEmbedding {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongLength(usize),
    #[error("embedding component {index} is not finite ({value})")]
    NonFinite { index: usize, value: f64 },
}

/// A validated 128-dimensional face embedding.
///
/// Construction always goes through [`Embedding::new`], so every value of
/// this type has exactly 128 finite components. Serialises as a bare JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Result<Self, InvalidEmbedding> {
        if values.len() != EMBEDDING_DIM {
            return Err(InvalidEmbedding::WrongLength(values.len()));
        }
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(InvalidEmbedding::NonFinite { index, value });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Matches the vision library's `face_distance` contract, so stored
    /// tolerances keep their meaning.
    pub fn distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl TryFrom<Vec<f64>> for Embedding {
    type Error = InvalidEmbedding;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f64> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}
