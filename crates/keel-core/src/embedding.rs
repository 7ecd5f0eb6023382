//! Embedding gateway contract.
//!
//! The text-to-vector model is opaque to the kernel: providers implement
//! [`Embedder`] and the kernel only assumes fixed-width vectors and cosine
//! geometry. Providers with a native dimension below [`EMBEDDING_DIM`] must
//! zero-pad (see [`pad_to_dim`]).

use async_trait::async_trait;

use crate::error::KernelResult;

/// Fixed embedding width persisted by the storage layer.
pub const EMBEDDING_DIM: usize = 1536;

/// Text-to-vector provider contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. Must return a vector of [`EMBEDDING_DIM`].
    async fn embed(&self, text: &str) -> KernelResult<Vec<f32>>;

    /// Embed a batch of texts. The default implementation loops; providers
    /// with a native batch endpoint should override.
    async fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Zero-pad a vector to `dim` entries. Vectors already at or above `dim`
/// are returned unchanged.
pub fn pad_to_dim(mut vector: Vec<f32>, dim: usize) -> Vec<f32> {
    if vector.len() < dim {
        vector.resize(dim, 0.0);
    }
    vector
}

/// Cosine similarity between two vectors, in [-1, 1].
///
/// Mismatched lengths and zero vectors yield 0.0 rather than an error;
/// similarity search treats both as "no signal".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}
