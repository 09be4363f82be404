//! Deterministic bag-of-words embeddings via feature hashing.
//!
//! Each lowercase word is hashed with FNV-1a into one of `dimension` buckets with a
//! hash-derived sign, and the resulting term-frequency vector is normalized. Texts
//! that share vocabulary land close together; texts with disjoint vocabulary are
//! nearly orthogonal. No model files or network access are needed, which makes this
//! provider suitable for offline use and for tests that need stable vectors.

use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, normalize};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embeds synchronously. The async trait methods delegate here.
    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut features = 0usize;

        for word in words(text) {
            let (idx, sign) = self.bucket(&word);
            vector[idx] += sign;
            features += 1;
        }

        // Punctuation-only text still gets a stable vector.
        if features == 0 {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(EmbedError::invalid_embedding("cannot embed empty text"));
            }
            let (idx, sign) = self.bucket(trimmed);
            vector[idx] += sign;
        }

        normalize(&mut vector)?;
        Ok(vector)
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature.as_bytes());
        let hash = hasher.finish();
        let idx = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_sync(text)
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_id(&self) -> String {
        format!("hashing-{}", self.dimension)
    }
}
