//! cairn-retriever: semantic workspace indexing and retrieval-augmented context
//!
//! This crate keeps an approximate-nearest-neighbor index over chunked workspace
//! files, keeps it consistent while files change, and assembles ranked,
//! token-budgeted context for a language model.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: vector index, document catalog, scanner, watcher and the
//!   [`IndexManager`](retrieval::index_manager::IndexManager) that owns them
//! - **[`rag`]**: context assembly with a TTL cache
//! - **[`storage`]**: persistence of the index and its metadata
//! - **[`config`]**: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cairn_embed::{EmbedConfig, EmbeddingProvider, load_provider};
//! use cairn_retriever::config::RetrieverConfig;
//! use cairn_retriever::rag::{ContextAssembler, ContextOptions};
//! use cairn_retriever::retrieval::index_manager::IndexManager;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RetrieverConfig::default().with_embedding(EmbedConfig::hashing(256));
//! let manager = IndexManager::new(config.indexing.clone());
//! let embed = config.embedding.clone();
//! manager
//!     .initialize("my-project", "my-project/.cairn", async move {
//!         let provider: Arc<dyn EmbeddingProvider> = load_provider(&embed).await?;
//!         Ok(provider)
//!     })
//!     .await?;
//!
//! let assembler = ContextAssembler::new(manager.clone(), &config.retrieval);
//! if let Some(context) = assembler.get_context("how are files chunked?", &ContextOptions::default()).await {
//!     println!("{}", context.context_text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Scanner → Chunker → Embedding Provider → Vector Index + Catalog → index.bin / metadata.json
//!    ↑                                              ↓
//! Watcher → PendingUpdates (debounce)     search → ContextAssembler → context text
//! ```

pub mod config;
pub mod rag;
pub mod retrieval;
pub mod storage;
