//! Error types for the embedding system

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Callers distinguish two broad classes. Failures while *loading* a provider
/// ([`EmbedError::UnknownModel`], [`EmbedError::InvalidConfig`],
/// [`EmbedError::ModelInitialization`]) mean no embeddings can be produced at all.
/// Failures while *embedding* ([`EmbedError::EmbeddingGeneration`],
/// [`EmbedError::InvalidEmbedding`]) are scoped to the texts in that call.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// The configured model name is not one this provider can load
    #[error("Unknown embedding model: {name}")]
    UnknownModel { name: String },

    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The model returned something that is not a usable unit vector
    #[error("Invalid embedding: {message}")]
    InvalidEmbedding { message: String },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Wraps an error raised while loading a model.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Wraps an error raised while embedding a batch.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::EmbeddingGeneration {
            source: Box::new(source),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_embedding<S: Into<String>>(message: S) -> Self {
        Self::InvalidEmbedding {
            message: message.into(),
        }
    }

    /// Whether this error means the provider cannot produce embeddings at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownModel { .. } | Self::InvalidConfig { .. } | Self::ModelInitialization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EmbedError::invalid_config("bad").is_fatal());
        assert!(
            EmbedError::UnknownModel {
                name: "nope".to_string()
            }
            .is_fatal()
        );
        assert!(!EmbedError::invalid_embedding("nan").is_fatal());
        let io = std::io::Error::other("disk");
        assert!(!EmbedError::embedding_gen(io).is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = EmbedError::invalid_config("dimension must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid model configuration: dimension must be positive"
        );
    }
}
