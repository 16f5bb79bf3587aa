//! Model provider capability and vector utilities.
//!
//! Defines the [`ModelProvider`] trait that chat, embedding and scoring
//! backends implement. Models are addressed by numeric id; resolving an id
//! to a concrete endpoint is the provider's concern.
//!
//! Concrete providers (OpenAI-compatible HTTP, local hashing) live in the
//! `ragline` application crate.

use async_trait::async_trait;

use crate::error::Result;

/// Supplies chat, embedding and scoring model handles by id.
///
/// Implementations fail with [`Error::InvalidModelId`](crate::Error::InvalidModelId)
/// for unknown ids and [`Error::ModelUnavailable`](crate::Error::ModelUnavailable)
/// for runtime failures.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send a single-turn prompt and return the reply text.
    async fn chat(&self, model_id: i64, prompt: &str) -> Result<String>;

    /// Embed a text into a dense vector.
    async fn embed(&self, model_id: i64, text: &str) -> Result<Vec<f32>>;

    /// Relevance of `passage` to `query`; higher is more relevant.
    async fn score(&self, model_id: i64, query: &str, passage: &str) -> Result<f32>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
