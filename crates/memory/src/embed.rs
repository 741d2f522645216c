//! Embedding index — cosine search over per-document vectors.

use std::collections::HashMap;

/// In-memory vector index. Empty when the embedding service was
/// unavailable at build time (BM25-only degradation).
#[derive(Default)]
pub struct EmbeddingIndex {
    vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, vector: Vec<f32>) {
        self.vectors.insert(key.to_string(), vector);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Rank all documents by cosine against the query vector, rejecting
    /// hits below `min_cosine`. Ties break on the key for determinism.
    pub fn search(&self, query: &[f32], min_cosine: f32) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .filter_map(|(key, vector)| {
                let cos = cosine(query, vector);
                (cos >= min_cosine).then(|| (key.clone(), cos))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

/// Cosine similarity; zero when lengths differ or a norm vanishes.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn search_applies_floor_and_sorts() {
        let mut index = EmbeddingIndex::new();
        index.insert("close", vec![1.0, 0.1]);
        index.insert("closer", vec![1.0, 0.0]);
        index.insert("far", vec![0.0, 1.0]);

        let hits = index.search(&[1.0, 0.0], 0.40);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "closer");
        assert_eq!(hits[1].0, "close");
    }

    #[test]
    fn empty_index_is_degraded_but_valid() {
        let index = EmbeddingIndex::new();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0], 0.4).is_empty());
    }
}
