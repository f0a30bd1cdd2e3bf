//! Embedding functions used by the vector store.
//!
//! The store only needs "batch of strings in, batch of vectors out"; the
//! backends here are the OpenAI embeddings API and a deterministic local
//! hashing embedder for offline use.

mod local;
mod openai;

pub use local::HashEmbedding;
pub use openai::OpenAiEmbedding;

use async_trait::async_trait;

use crate::error::Result;

/// Async batch embedding function.
///
/// Implementations must return exactly one vector per input text, in input
/// order.
#[async_trait]
pub trait EmbeddingFunc: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Length of every vector this function produces.
    fn dimension(&self) -> usize;
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub(crate) fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two vectors; 0.0 for empty, mismatched or zero input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_handles_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);

        let aligned = cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]);
        assert!((aligned - 1.0).abs() < 1e-6);

        let orthogonal = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(orthogonal.abs() < 1e-6);
    }

    #[test]
    fn normalize_scales_vector_to_unit_length() {
        let mut vec = vec![3.0, 4.0];
        normalize(&mut vec);
        let norm = (vec[0].powi(2) + vec[1].powi(2)).sqrt();

        assert!((norm - 1.0).abs() < 1e-6);
        assert!(vec[1] > vec[0]); // preserves proportions
    }

    #[test]
    fn normalize_zero_vector() {
        let mut vec = vec![0.0, 0.0, 0.0];
        normalize(&mut vec);
        assert!(vec.iter().all(|&v| v == 0.0));
    }
}
