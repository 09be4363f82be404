//! Configuration for embedding providers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default local model.
pub const DEFAULT_MODEL: &str = "all-minilm-l6-v2";

/// Default dimension for the hashing provider.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

/// Which provider implementation to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local ONNX model through fastembed
    FastEmbed,
    /// Deterministic feature hashing, no model files
    Hashing,
}

impl Default for ProviderKind {
    fn default() -> Self {
        if cfg!(feature = "fastembed") {
            Self::FastEmbed
        } else {
            Self::Hashing
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::FastEmbed => write!(f, "fastembed"),
            ProviderKind::Hashing => write!(f, "hashing"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fastembed" | "local" => Ok(ProviderKind::FastEmbed),
            "hashing" | "hash" => Ok(ProviderKind::Hashing),
            _ => Err(format!(
                "Invalid embedding provider: '{s}'. Valid values are: fastembed, hashing"
            )),
        }
    }
}

/// Configuration for embedding providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Provider implementation
    pub provider: ProviderKind,
    /// Model name, e.g. "all-minilm-l6-v2"
    pub model_name: String,
    /// Where downloaded model files are cached. Uses fastembed's default when unset.
    pub cache_dir: Option<PathBuf>,
    /// Output dimension for the hashing provider. Ignored by fastembed.
    pub dimension: usize,
    /// Maximum batch size for embedding generation
    pub batch_size: usize,
    /// Show a progress bar while downloading model files
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model_name: DEFAULT_MODEL.to_string(),
            cache_dir: None,
            dimension: DEFAULT_HASHING_DIMENSION,
            batch_size: 16,
            show_download_progress: false,
        }
    }
}

impl EmbedConfig {
    /// Configuration for a local fastembed model.
    pub fn fastembed(model_name: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Configuration for the hashing provider with the given output dimension.
    pub fn hashing(dimension: usize) -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: format!("hashing-{dimension}"),
            dimension,
            ..Self::default()
        }
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, cache_dir: P) -> Self {
        self.cache_dir = Some(cache_dir.as_ref().to_path_buf());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_show_download_progress(mut self, show: bool) -> Self {
        self.show_download_progress = show;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Checks the settings that can be checked without loading anything.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be positive"));
        }
        if self.provider == ProviderKind::Hashing && self.dimension == 0 {
            return Err(EmbedError::invalid_config(
                "hashing provider needs a positive dimension",
            ));
        }
        Ok(())
    }
}
