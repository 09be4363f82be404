//! Metadata persisted next to the vector index.
//!
//! The [`ConfigSnapshot`] records everything that shapes the index contents. A
//! persisted index is only reused when its snapshot equals the one computed from the
//! running configuration; any difference means the stored vectors or chunk
//! boundaries would not match what a fresh build produces.

use cairn_embed::EmbeddingProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::catalog::{DocumentCatalog, DocumentEntry};
use crate::config::IndexingConfig;

/// Version of the `metadata.json` layout.
pub const METADATA_VERSION: u32 = 1;

/// Settings that determine index contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub extensions: Vec<String>,
    pub ignored_dirs: Vec<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_dimension: usize,
    pub embedding_model: String,
}

impl ConfigSnapshot {
    pub fn new(config: &IndexingConfig, provider: &dyn EmbeddingProvider) -> Self {
        let mut extensions: Vec<String> = config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        extensions.sort();
        extensions.dedup();
        let mut ignored_dirs = config.ignored_dirs.clone();
        ignored_dirs.sort();
        ignored_dirs.dedup();

        Self {
            extensions,
            ignored_dirs,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            embedding_dimension: provider.embedding_dimension(),
            embedding_model: provider.model_id(),
        }
    }

    /// Describes the first setting that differs from `running`, if any.
    pub fn mismatch(&self, running: &ConfigSnapshot) -> Option<String> {
        if self.embedding_dimension != running.embedding_dimension {
            return Some(format!(
                "embedding dimension {} != {}",
                self.embedding_dimension, running.embedding_dimension
            ));
        }
        if self.embedding_model != running.embedding_model {
            return Some(format!(
                "embedding model {} != {}",
                self.embedding_model, running.embedding_model
            ));
        }
        if self.chunk_size != running.chunk_size || self.chunk_overlap != running.chunk_overlap {
            return Some(format!(
                "chunking {}/{} != {}/{}",
                self.chunk_size, self.chunk_overlap, running.chunk_size, running.chunk_overlap
            ));
        }
        if self.extensions != running.extensions {
            return Some("indexed extensions changed".to_string());
        }
        if self.ignored_dirs != running.ignored_dirs {
            return Some("ignored directories changed".to_string());
        }
        None
    }
}

/// Header fields of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub version: u32,
    pub config: ConfigSnapshot,
    pub last_updated: DateTime<Utc>,
    /// Next unused label in the persisted index generation
    pub next_label: u64,
    /// blake3 hex digest of `index.bin`
    pub index_checksum: String,
    /// Version of cairn-retriever that wrote the file
    #[serde(default)]
    pub retriever_version: String,
}

impl IndexMetadata {
    pub fn new(config: ConfigSnapshot, next_label: u64, index_checksum: String) -> Self {
        Self {
            version: METADATA_VERSION,
            config,
            last_updated: Utc::now(),
            next_label,
            index_checksum,
            retriever_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Borrowed view used when writing `metadata.json`.
#[derive(Serialize)]
pub(crate) struct MetadataFileRef<'a> {
    #[serde(flatten)]
    pub header: &'a IndexMetadata,
    pub documents: &'a DocumentCatalog,
}

/// Owned form read back from `metadata.json`.
#[derive(Deserialize)]
pub(crate) struct MetadataFile {
    #[serde(flatten)]
    pub header: IndexMetadata,
    pub documents: BTreeMap<String, DocumentEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_embed::HashingProvider;

    fn snapshot(dimension: usize) -> ConfigSnapshot {
        ConfigSnapshot::new(&IndexingConfig::default(), &HashingProvider::new(dimension))
    }

    #[test]
    fn test_snapshot_normalizes_extensions() {
        let config = IndexingConfig::default().with_extensions([".MD", "rs", "md"]);
        let snap = ConfigSnapshot::new(&config, &HashingProvider::new(8));
        assert_eq!(snap.extensions, vec!["md".to_string(), "rs".to_string()]);
        assert_eq!(snap.embedding_model, "hashing-8");
    }

    #[test]
    fn test_mismatch_detection() {
        let base = snapshot(32);
        assert_eq!(base.mismatch(&snapshot(32)), None);
        assert!(base.mismatch(&snapshot(64)).unwrap().contains("dimension"));

        let mut rechunked = base.clone();
        rechunked.chunk_size = 1024;
        assert!(base.mismatch(&rechunked).unwrap().contains("chunking"));
    }

    #[test]
    fn test_metadata_json_keys() {
        let header = IndexMetadata::new(snapshot(16), 5, "abc".to_string());
        let catalog = DocumentCatalog::new();
        let json = serde_json::to_value(MetadataFileRef {
            header: &header,
            documents: &catalog,
        })
        .unwrap();

        for key in [
            "version",
            "documents",
            "config",
            "lastUpdated",
            "nextLabel",
            "indexChecksum",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }

        let parsed: MetadataFile = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.header, header);
        assert!(parsed.documents.is_empty());
    }
}
