//! Configuration loaded from `cairn.toml`.
//!
//! Every field has a default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [indexing]
//! extensions = ["md", "rs"]
//! chunk_size = 512
//! chunk_overlap = 50
//!
//! [embedding]
//! provider = "hashing"
//! dimension = 256
//!
//! [retrieval]
//! k = 8
//! min_score = 0.65
//! max_tokens = 4000
//! ```

use anyhow::{Context, Result};
use cairn_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::rag::format::ContextFormat;

/// Name of the storage directory created inside a workspace.
pub const DEFAULT_STORAGE_DIR: &str = ".cairn";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub indexing: IndexingConfig,
    pub embedding: EmbedConfig,
    pub retrieval: RetrievalConfig,
}

impl RetrieverConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_embedding(mut self, embedding: EmbedConfig) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_indexing(mut self, indexing: IndexingConfig) -> Self {
        self.indexing = indexing;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.indexing.validate()?;
        self.retrieval.validate()?;
        self.embedding.validate()?;
        Ok(())
    }
}

/// Settings for scanning, chunking and keeping the index fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// File extensions (without the dot) eligible for indexing
    pub extensions: Vec<String>,
    /// Directory names never descended into
    pub ignored_dirs: Vec<String>,
    /// Honour `.gitignore` files while scanning
    pub respect_gitignore: bool,
    /// Storage directory name inside the workspace
    pub storage_dir: String,
    /// Maximum chunk size in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks
    pub chunk_overlap: usize,
    /// Quiet period after the last file event before a batch is applied
    pub debounce_ms: u64,
    /// Vector slots reserved up front
    pub initial_capacity: usize,
    /// Fraction of tombstoned vectors that triggers compaction
    pub compaction_threshold: f32,
    /// Watch the workspace for changes after the initial build
    pub watch: bool,
    /// Files prepared concurrently during a full build
    pub build_concurrency: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: ["md", "txt", "rs", "py", "js", "ts", "tsx", "jsx", "json", "toml"]
                .into_iter()
                .map(String::from)
                .collect(),
            ignored_dirs: [".git", "node_modules", "target", "dist", "build"]
                .into_iter()
                .map(String::from)
                .collect(),
            respect_gitignore: true,
            storage_dir: DEFAULT_STORAGE_DIR.to_string(),
            chunk_size: 512,
            chunk_overlap: 50,
            debounce_ms: 2000,
            initial_capacity: 10_000,
            compaction_threshold: 0.5,
            watch: true,
            build_concurrency: 4,
        }
    }
}

impl IndexingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("indexing.chunk_size must be positive");
        }
        if self.chunk_overlap >= self.chunk_size {
            anyhow::bail!(
                "indexing.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            anyhow::bail!("indexing.compaction_threshold must be within 0.0..=1.0");
        }
        if self.storage_dir.is_empty() {
            anyhow::bail!("indexing.storage_dir must not be empty");
        }
        Ok(())
    }
}

/// Settings for assembling context from search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched from the index
    pub k: usize,
    /// Minimum similarity for a candidate to be used
    pub min_score: f32,
    /// Token budget for the assembled context
    pub max_tokens: usize,
    pub format: ContextFormat,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 8,
            min_score: 0.65,
            max_tokens: 4000,
            format: ContextFormat::Compact,
            cache_ttl_secs: 60,
            cache_capacity: 100,
        }
    }
}

impl RetrievalConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_score) {
            anyhow::bail!("retrieval.min_score must be within 0.0..=1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_embed::ProviderKind;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RetrieverConfig::default();
        assert_eq!(config.indexing.chunk_size, 512);
        assert_eq!(config.indexing.chunk_overlap, 50);
        assert_eq!(config.indexing.debounce(), Duration::from_secs(2));
        assert_eq!(config.indexing.initial_capacity, 10_000);
        assert_eq!(config.retrieval.k, 8);
        assert_eq!(config.retrieval.min_score, 0.65);
        assert_eq!(config.retrieval.max_tokens, 4000);
        assert_eq!(config.retrieval.cache_ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = RetrieverConfig::from_toml(
            r#"
            [indexing]
            extensions = ["md"]
            chunk_size = 256

            [embedding]
            provider = "hashing"
            dimension = 64

            [retrieval]
            format = "detailed"
            "#,
        )
        .unwrap();

        assert_eq!(config.indexing.extensions, vec!["md".to_string()]);
        assert_eq!(config.indexing.chunk_size, 256);
        assert_eq!(config.indexing.chunk_overlap, 50);
        assert_eq!(config.embedding.provider, ProviderKind::Hashing);
        assert_eq!(config.embedding.dimension, 64);
        assert_eq!(config.retrieval.format, ContextFormat::Detailed);
        assert_eq!(config.retrieval.k, 8);
    }

    #[test]
    fn test_rejects_overlap_larger_than_chunk() {
        let err = RetrieverConfig::from_toml("[indexing]\nchunk_size = 10\nchunk_overlap = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_load_or_default() -> Result<()> {
        let dir = tempdir()?;
        let missing = dir.path().join("cairn.toml");
        assert_eq!(
            RetrieverConfig::load_or_default(&missing)?,
            RetrieverConfig::default()
        );

        std::fs::write(&missing, "[retrieval]\nk = 3\n")?;
        assert_eq!(RetrieverConfig::load_or_default(&missing)?.retrieval.k, 3);

        std::fs::write(&missing, "[retrieval]\nk = \"three\"\n")?;
        assert!(RetrieverConfig::load(&missing).is_err());
        Ok(())
    }
}
