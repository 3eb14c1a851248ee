//! Embedding helpers: BLOB encoding, cosine scoring and the per-store
//! dimension guard.

use std::sync::RwLock;

use crate::error::{GraphRagError, Result};

/// Encode an embedding as little-endian f32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes. `None` if the length is not a multiple of 4.
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Score `items` against `query`, keep scores >= `threshold`, and return the
/// best `top_k` by descending score. Ties keep input order.
pub fn rank_by_similarity<'a, T, I>(query: &[f32], items: I, top_k: usize, threshold: f32) -> Vec<(T, f32)>
where
    I: IntoIterator<Item = (T, &'a [f32])>,
{
    let mut scored: Vec<(T, f32)> = items
        .into_iter()
        .filter_map(|(item, embedding)| {
            let score = cosine_similarity(query, embedding);
            (score >= threshold).then_some((item, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

/// Tracks the embedding length a store has committed to.
#[derive(Debug, Default)]
pub struct DimensionGuard {
    dimension: RwLock<Option<usize>>,
}

impl DimensionGuard {
    pub fn new(dimension: Option<usize>) -> Self {
        Self {
            dimension: RwLock::new(dimension),
        }
    }

    pub fn get(&self) -> Option<usize> {
        *self.dimension.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject `len` unless it matches the established dimension. The first
    /// accepted length becomes the dimension; returns `true` in that case.
    pub fn check_or_establish(&self, len: usize) -> Result<bool> {
        if len == 0 {
            return Err(GraphRagError::InvalidInput("embedding must not be empty".to_string()));
        }
        let mut guard = self.dimension.write().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(expected) if expected != len => Err(GraphRagError::DimensionMismatch { expected, actual: len }),
            Some(_) => Ok(false),
            None => {
                *guard = Some(len);
                Ok(true)
            }
        }
    }

    /// Check a query vector without establishing anything.
    pub fn check_query(&self, len: usize) -> Result<()> {
        match self.get() {
            Some(expected) if expected != len => Err(GraphRagError::DimensionMismatch { expected, actual: len }),
            _ => Ok(()),
        }
    }

    pub fn reset(&self) {
        *self.dimension.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
