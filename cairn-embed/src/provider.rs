//! Embedding provider implementations

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::hashing::HashingProvider;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result. The dimension is taken from the first vector.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// Every vector a provider returns has length [`embedding_dimension`] and unit L2
/// norm, so squared Euclidean distance and cosine similarity are interchangeable
/// downstream. Providers are loaded once and shared behind an `Arc`.
///
/// [`embedding_dimension`]: EmbeddingProvider::embedding_dimension
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_text(text).await?);
        }
        Ok(EmbeddingResult::new(embeddings))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Identifier of the model, recorded alongside persisted indexes so a model
    /// change can be detected.
    fn model_id(&self) -> String;
}

/// Scales `vector` to unit length in place and checks it is usable.
pub fn normalize(vector: &mut [f32]) -> Result<()> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbedError::invalid_embedding("non-finite values in embedding"));
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(EmbedError::invalid_embedding("zero-length embedding"));
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    Ok(())
}

/// Loads the provider selected by `config`.
///
/// Model loading can be slow (fastembed may download weights on first use), so this
/// is meant to be awaited once at startup and the result shared.
pub async fn load_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    match config.provider {
        ProviderKind::Hashing => Ok(Arc::new(HashingProvider::new(config.dimension))),
        #[cfg(feature = "fastembed")]
        ProviderKind::FastEmbed => Ok(Arc::new(FastEmbedProvider::create(config.clone()).await?)),
        #[cfg(not(feature = "fastembed"))]
        ProviderKind::FastEmbed => Err(EmbedError::invalid_config(
            "fastembed provider requires the `fastembed` feature",
        )),
    }
}

#[cfg(feature = "fastembed")]
pub use local::FastEmbedProvider;

#[cfg(feature = "fastembed")]
mod local {
    use super::{EmbeddingProvider, EmbeddingResult, normalize};
    use crate::config::EmbedConfig;
    use crate::error::{EmbedError, Result};
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::{Arc, Mutex};

    fn resolve_model(name: &str) -> Result<EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
            other => Err(EmbedError::UnknownModel {
                name: other.to_string(),
            }),
        }
    }

    /// FastEmbed-based embedding provider using local ONNX models
    #[derive(Clone)]
    pub struct FastEmbedProvider {
        config: EmbedConfig,
        model: Arc<Mutex<TextEmbedding>>,
        dimension: usize,
    }

    impl std::fmt::Debug for FastEmbedProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FastEmbedProvider")
                .field("config", &self.config)
                .field("dimension", &self.dimension)
                .finish()
        }
    }

    impl FastEmbedProvider {
        /// Loads the model on a blocking thread and probes its output dimension.
        pub async fn create(config: EmbedConfig) -> Result<Self> {
            let model_kind = resolve_model(config.model_name())?;
            tracing::info!("Loading embedding model: {}", config.model_name());

            let init_config = config.clone();
            let (model, dimension) =
                tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                    let mut options = InitOptions::new(model_kind)
                        .with_show_download_progress(init_config.show_download_progress);
                    if let Some(dir) = &init_config.cache_dir {
                        options = options.with_cache_dir(dir.clone());
                    }

                    let mut model = TextEmbedding::try_new(options).map_err(|e| {
                        EmbedError::ModelInitialization { source: e.into() }
                    })?;

                    let probe = model
                        .embed(vec!["dimension probe".to_string()], None)
                        .map_err(|e| EmbedError::ModelInitialization { source: e.into() })?;
                    let dimension = probe.first().map(|emb| emb.len()).unwrap_or(0);
                    if dimension == 0 {
                        return Err(EmbedError::invalid_config(
                            "model produced an empty probe embedding",
                        ));
                    }
                    Ok((model, dimension))
                })
                .await??;

            tracing::info!(
                "Model {} loaded successfully. Dimension: {}",
                config.model_name(),
                dimension
            );

            Ok(Self {
                config,
                model: Arc::new(Mutex::new(model)),
                dimension,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastEmbedProvider {
        async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            let texts = vec![text.to_string()];
            let result = self.embed_texts(&texts).await?;
            result
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| EmbedError::invalid_embedding("no embedding generated for text"))
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
            if texts.is_empty() {
                return Ok(EmbeddingResult::new(vec![]));
            }

            tracing::debug!("Generating embeddings for {} texts", texts.len());
            let mut all_embeddings = Vec::with_capacity(texts.len());

            for chunk in texts.chunks(self.config.batch_size.max(1)) {
                let chunk = chunk.to_vec();
                let model = Arc::clone(&self.model);

                let batch = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                    let mut guard = model.lock().map_err(|_| {
                        EmbedError::External {
                            source: anyhow::anyhow!("embedding model lock poisoned"),
                        }
                    })?;
                    guard
                        .embed(chunk, None)
                        .map_err(|e| EmbedError::EmbeddingGeneration { source: e.into() })
                })
                .await??;

                for mut embedding in batch {
                    if embedding.len() != self.dimension {
                        return Err(EmbedError::invalid_embedding(format!(
                            "expected dimension {}, got {}",
                            self.dimension,
                            embedding.len()
                        )));
                    }
                    normalize(&mut embedding)?;
                    all_embeddings.push(embedding);
                }
            }

            Ok(EmbeddingResult::new(all_embeddings))
        }

        fn embedding_dimension(&self) -> usize {
            self.dimension
        }

        fn provider_name(&self) -> &str {
            "fastembed"
        }

        fn model_id(&self) -> String {
            format!("fastembed:{}", self.config.model_name())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_resolve_known_models() {
            assert!(resolve_model("all-minilm-l6-v2").is_ok());
            assert!(resolve_model("bge-small-en-v1.5").is_ok());
        }

        #[test]
        fn test_unknown_model_is_fatal() {
            let err = resolve_model("not-a-model").unwrap_err();
            assert!(err.is_fatal());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert_eq!(EmbeddingResult::new(vec![]).dimension, 0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        assert!(normalize(&mut [0.0, 0.0]).is_err());
        assert!(normalize(&mut [f32::NAN, 1.0]).is_err());
    }

    #[tokio::test]
    async fn test_load_hashing_provider() {
        let provider = load_provider(&EmbedConfig::hashing(48)).await.unwrap();
        assert_eq!(provider.embedding_dimension(), 48);
        assert_eq!(provider.provider_name(), "hashing");

        let result = provider
            .embed_texts(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 48);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let err = load_provider(&EmbedConfig::hashing(0)).await.err().unwrap();
        assert!(err.is_fatal());
    }
}
