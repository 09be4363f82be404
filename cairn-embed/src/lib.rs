//! # cairn-embed
//!
//! Text embedding providers behind one async trait, [`EmbeddingProvider`].
//!
//! ## Providers
//!
//! - [`FastEmbedProvider`]: local ONNX models via fastembed (default `fastembed`
//!   feature). Model weights are downloaded on first use and cached.
//! - [`HashingProvider`]: deterministic feature hashing. No model files, useful
//!   offline and in tests.
//!
//! All providers return unit-length `f32` vectors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cairn_embed::{EmbedConfig, load_provider};
//!
//! # async fn example() -> cairn_embed::Result<()> {
//! let provider = load_provider(&EmbedConfig::fastembed("all-minilm-l6-v2")).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}",
//!          result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sharing
//!
//! [`load_provider`] returns an `Arc<dyn EmbeddingProvider>`. Load it once and hand
//! clones of the `Arc` to every component that needs embeddings; there is no global
//! model cache.

pub mod config;
pub mod error;
pub mod hashing;
pub mod provider;

pub use config::{EmbedConfig, ProviderKind};
pub use error::{EmbedError, Result};
pub use hashing::HashingProvider;
#[cfg(feature = "fastembed")]
pub use provider::FastEmbedProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, load_provider, normalize};
