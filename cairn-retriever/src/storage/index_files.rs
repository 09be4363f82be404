use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{LoadOutcome, PersistedIndex};
use crate::retrieval::catalog::DocumentCatalog;
use crate::retrieval::metadata::{
    ConfigSnapshot, IndexMetadata, METADATA_VERSION, MetadataFile, MetadataFileRef,
};
use crate::retrieval::vector_index::VectorIndex;

pub const INDEX_FILE: &str = "index.bin";
pub const METADATA_FILE: &str = "metadata.json";

/// Both files of an index generation, serialized and ready to write.
#[derive(Debug, Clone)]
pub struct EncodedIndex {
    index_bytes: Vec<u8>,
    metadata_bytes: Vec<u8>,
    metadata: IndexMetadata,
    documents: usize,
    vectors: usize,
}

impl EncodedIndex {
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }
}

/// The pair of files that make up a persisted index.
#[derive(Debug, Clone)]
pub struct IndexStorage {
    root: PathBuf,
}

impl IndexStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Both files are present.
    pub fn exists(&self) -> bool {
        self.index_path().is_file() && self.metadata_path().is_file()
    }

    /// Writes the index and then the metadata, each through a temp file renamed into
    /// place. The metadata records the index checksum, so a crash between the two
    /// renames leaves a pair that [`load`](Self::load) rejects instead of trusting.
    pub fn save(
        &self,
        index: &VectorIndex,
        catalog: &DocumentCatalog,
        config: &ConfigSnapshot,
        next_label: u64,
    ) -> Result<IndexMetadata> {
        let encoded = Self::encode(index, catalog, config, next_label)?;
        self.write(&encoded)?;
        Ok(encoded.metadata)
    }

    /// Serializes both files in memory. Pairs with [`write`](Self::write) so the
    /// in-memory state only has to be borrowed while encoding.
    pub fn encode(
        index: &VectorIndex,
        catalog: &DocumentCatalog,
        config: &ConfigSnapshot,
        next_label: u64,
    ) -> Result<EncodedIndex> {
        let index_bytes = index.to_bytes();
        let checksum = blake3::hash(&index_bytes).to_hex().to_string();
        let metadata = IndexMetadata::new(config.clone(), next_label, checksum);
        let metadata_bytes = serde_json::to_vec_pretty(&MetadataFileRef {
            header: &metadata,
            documents: catalog,
        })?;
        Ok(EncodedIndex {
            index_bytes,
            metadata_bytes,
            metadata,
            documents: catalog.len(),
            vectors: index.len(),
        })
    }

    /// Atomically replaces both files with an encoded image.
    pub fn write(&self, encoded: &EncodedIndex) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create storage dir {}", self.root.display()))?;
        self.write_atomic(&self.index_path(), &encoded.index_bytes)?;
        self.write_atomic(&self.metadata_path(), &encoded.metadata_bytes)?;

        debug!(
            "Persisted {} vectors and {} documents to {}",
            encoded.vectors,
            encoded.documents,
            self.root.display()
        );
        Ok(())
    }

    /// Loads the persisted index if it exists and matches `expected`.
    ///
    /// Never fails: anything unusable is reported through [`LoadOutcome`] so the
    /// caller can fall back to a rebuild.
    pub fn load(&self, expected: &ConfigSnapshot, capacity: usize) -> LoadOutcome {
        if !self.exists() {
            return LoadOutcome::Missing;
        }
        match self.try_load(expected, capacity) {
            Ok(outcome) => outcome,
            Err(e) => LoadOutcome::Corrupt(format!("{e:#}")),
        }
    }

    fn try_load(&self, expected: &ConfigSnapshot, capacity: usize) -> Result<LoadOutcome> {
        let metadata_bytes = std::fs::read(self.metadata_path())
            .with_context(|| format!("Failed to read {}", self.metadata_path().display()))?;
        let metadata: MetadataFile =
            serde_json::from_slice(&metadata_bytes).context("Failed to parse metadata.json")?;

        if metadata.header.version != METADATA_VERSION {
            return Ok(LoadOutcome::Incompatible(format!(
                "metadata version {} != {}",
                metadata.header.version, METADATA_VERSION
            )));
        }
        if let Some(reason) = metadata.header.config.mismatch(expected) {
            return Ok(LoadOutcome::Incompatible(reason));
        }

        let index_bytes = std::fs::read(self.index_path())
            .with_context(|| format!("Failed to read {}", self.index_path().display()))?;
        let checksum = blake3::hash(&index_bytes).to_hex().to_string();
        if checksum != metadata.header.index_checksum {
            anyhow::bail!("index.bin does not match the checksum recorded in metadata.json");
        }

        let index =
            VectorIndex::from_bytes(&index_bytes, expected.embedding_dimension, capacity)?;
        let catalog = DocumentCatalog::from_documents(metadata.documents)?;

        let mut next_label = metadata.header.next_label;
        if let Some(max) = catalog.max_label() {
            if max >= next_label {
                warn!("Recorded next label {next_label} is stale, advancing past {max}");
                next_label = max + 1;
            }
        }

        let orphaned = catalog
            .iter()
            .flat_map(|e| e.labels())
            .filter(|&l| !index.contains(l))
            .count();
        if orphaned > 0 {
            anyhow::bail!("{orphaned} catalog chunks have no vector in index.bin");
        }
        let unreferenced = index.live_count().saturating_sub(catalog.chunk_count());
        if unreferenced > 0 {
            warn!("{unreferenced} vectors in index.bin are not referenced by the catalog");
        }

        Ok(LoadOutcome::Loaded(PersistedIndex {
            index,
            catalog,
            metadata: metadata.header,
            next_label,
        }))
    }

    /// Deletes both files. Missing files are not an error.
    pub fn clear(&self) -> Result<()> {
        for path in [self.index_path(), self.metadata_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .with_context(|| format!("Failed to create temp file in {}", self.root.display()))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::retrieval::catalog::{Chunk, DocumentEntry};
    use cairn_embed::HashingProvider;
    use tempfile::tempdir;

    fn snapshot(dimension: usize) -> ConfigSnapshot {
        ConfigSnapshot::new(&IndexingConfig::default(), &HashingProvider::new(dimension))
    }

    fn sample(dimension: usize) -> (VectorIndex, DocumentCatalog) {
        let provider = HashingProvider::new(dimension);
        let mut index = VectorIndex::create(dimension, 16);
        let mut catalog = DocumentCatalog::new();
        let texts = ["alpha beta", "gamma delta"];
        let mut chunks = Vec::new();
        for (label, text) in texts.iter().enumerate() {
            index
                .add(&provider.embed_sync(text).unwrap(), label as u64)
                .unwrap();
            chunks.push(Chunk::new(*text, label, label as u64).unwrap());
        }
        catalog
            .upsert(DocumentEntry::new("a.md", "/ws/a.md", chunks, "h").unwrap())
            .unwrap();
        (index, catalog)
    }

    #[test]
    fn test_missing_files() {
        let dir = tempdir().unwrap();
        let storage = IndexStorage::new(dir.path().join(".cairn"));
        assert!(matches!(storage.load(&snapshot(8), 10), LoadOutcome::Missing));
        assert!(storage.clear().is_ok());
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let storage = IndexStorage::new(dir.path().join(".cairn"));
        let (index, catalog) = sample(8);
        storage.save(&index, &catalog, &snapshot(8), 2)?;
        assert!(storage.exists());

        let LoadOutcome::Loaded(loaded) = storage.load(&snapshot(8), 10) else {
            panic!("expected a loadable index");
        };
        assert_eq!(loaded.index.len(), 2);
        assert_eq!(loaded.catalog.chunk_count(), 2);
        assert_eq!(loaded.next_label, 2);
        assert_eq!(loaded.index.capacity(), 16);
        Ok(())
    }

    #[test]
    fn test_dimension_change_is_incompatible() -> Result<()> {
        let dir = tempdir()?;
        let storage = IndexStorage::new(dir.path());
        let (index, catalog) = sample(8);
        storage.save(&index, &catalog, &snapshot(8), 2)?;

        assert!(matches!(
            storage.load(&snapshot(16), 10),
            LoadOutcome::Incompatible(reason) if reason.contains("dimension")
        ));
        Ok(())
    }

    #[test]
    fn test_corrupt_index_detected() -> Result<()> {
        let dir = tempdir()?;
        let storage = IndexStorage::new(dir.path());
        let (index, catalog) = sample(8);
        storage.save(&index, &catalog, &snapshot(8), 2)?;

        std::fs::write(storage.index_path(), b"garbage")?;
        assert!(matches!(
            storage.load(&snapshot(8), 10),
            LoadOutcome::Corrupt(_)
        ));

        std::fs::write(storage.metadata_path(), b"{ not json")?;
        assert!(matches!(
            storage.load(&snapshot(8), 10),
            LoadOutcome::Corrupt(_)
        ));

        storage.clear()?;
        assert!(!storage.exists());
        Ok(())
    }

    #[test]
    fn test_encode_then_write() -> Result<()> {
        let dir = tempdir()?;
        let storage = IndexStorage::new(dir.path().join("nested").join(".cairn"));
        let (index, catalog) = sample(8);
        let encoded = IndexStorage::encode(&index, &catalog, &snapshot(8), 7)?;
        assert_eq!(encoded.metadata().next_label, 7);
        assert!(!storage.exists());

        storage.write(&encoded)?;
        let LoadOutcome::Loaded(loaded) = storage.load(&snapshot(8), 10) else {
            panic!("expected a loadable index");
        };
        assert_eq!(loaded.metadata.index_checksum, encoded.metadata().index_checksum);
        assert_eq!(loaded.next_label, 7);
        Ok(())
    }

    #[test]
    fn test_stale_next_label_is_advanced() -> Result<()> {
        let dir = tempdir()?;
        let storage = IndexStorage::new(dir.path());
        let (index, catalog) = sample(8);
        storage.save(&index, &catalog, &snapshot(8), 0)?;

        let LoadOutcome::Loaded(loaded) = storage.load(&snapshot(8), 10) else {
            panic!("expected a loadable index");
        };
        assert_eq!(loaded.next_label, 2);
        Ok(())
    }
}
