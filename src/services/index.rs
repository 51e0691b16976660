// src/services/index.rs
//! Vector index seam. The engine only assumes the `VectorIndex` contract;
//! `ExactIndex` is the bundled brute-force backend, and an approximate index
//! can be swapped in behind the same trait.

use crate::error::Result;
use crate::services::store::Store;

pub trait VectorIndex: Send {
    /// Nearest neighbors by cosine similarity, descending. Results below
    /// `min_similarity` are excluded rather than padded.
    fn top_k(
        &self,
        store: &Store,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>>;
}

/// Exact scan over every stored embedding. Fine at the scale this engine
/// targets; the trait is the escape hatch when it is not.
pub struct ExactIndex;

impl VectorIndex for ExactIndex {
    fn top_k(
        &self,
        store: &Store,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>> {
        let mut scored: Vec<(String, f32)> = Vec::new();
        for (item_id, embedding) in store.all_embeddings()? {
            if embedding.len() != query.len() {
                tracing::warn!(
                    item_id = %item_id,
                    "embedding dimension mismatch, skipping item"
                );
                continue;
            }
            let sim = cosine(query, &embedding);
            if sim >= min_similarity {
                scored.push((item_id, sim));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
