//! Catalog of indexed documents and the chunks that came from them.
//!
//! The catalog maps a workspace-relative file id to the [`DocumentEntry`] describing
//! its current chunk set, and maps every chunk label back to its document so search
//! hits can be resolved to text. A file's chunks are always replaced as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Chunk {ordinal} has no text")]
    EmptyChunk { ordinal: usize },

    #[error("Label {0} appears more than once in one document")]
    DuplicateLabel(u64),

    #[error("Label {label} already belongs to {file_id}")]
    LabelInUse { label: u64, file_id: String },
}

/// A piece of a document that has its own vector in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    text: String,
    ordinal: usize,
    label: u64,
}

impl Chunk {
    /// Rejects chunks whose text is empty after trimming.
    pub fn new(text: impl Into<String>, ordinal: usize, label: u64) -> Result<Self, CatalogError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(CatalogError::EmptyChunk { ordinal });
        }
        Ok(Self {
            text,
            ordinal,
            label,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Position of the chunk within its document.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Handle of the chunk's vector in the index.
    pub fn label(&self) -> u64 {
        self.label
    }
}

/// Everything the catalog knows about one indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntry {
    file_id: String,
    absolute_path: PathBuf,
    chunks: Vec<Chunk>,
    indexed_at: DateTime<Utc>,
    content_hash: String,
}

impl DocumentEntry {
    /// Rejects entries in which two chunks share a label.
    pub fn new(
        file_id: impl Into<String>,
        absolute_path: impl Into<PathBuf>,
        chunks: Vec<Chunk>,
        content_hash: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let entry = Self {
            file_id: file_id.into(),
            absolute_path: absolute_path.into(),
            chunks,
            indexed_at: Utc::now(),
            content_hash: content_hash.into(),
        };
        entry.validate()?;
        Ok(entry)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = std::collections::HashSet::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            if chunk.text.trim().is_empty() {
                return Err(CatalogError::EmptyChunk {
                    ordinal: chunk.ordinal,
                });
            }
            if !seen.insert(chunk.label) {
                return Err(CatalogError::DuplicateLabel(chunk.label));
            }
        }
        Ok(())
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn indexed_at(&self) -> DateTime<Utc> {
        self.indexed_at
    }

    /// blake3 hex digest of the file content that produced these chunks.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn labels(&self) -> impl Iterator<Item = u64> + '_ {
        self.chunks.iter().map(Chunk::label)
    }
}

/// In-memory catalog, serialized as the `documents` map of `metadata.json`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DocumentCatalog {
    documents: BTreeMap<String, DocumentEntry>,
    #[serde(skip)]
    labels: HashMap<u64, String>,
}

impl DocumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a catalog from deserialized entries, re-checking every invariant.
    pub fn from_documents(
        documents: BTreeMap<String, DocumentEntry>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for entry in documents.into_values() {
            entry.validate()?;
            catalog.upsert(entry)?;
        }
        Ok(catalog)
    }

    /// Inserts or replaces the entry for `entry.file_id()`, returning the entry it
    /// replaced. Fails without modifying the catalog if one of the new labels is
    /// owned by a different document.
    pub fn upsert(&mut self, entry: DocumentEntry) -> Result<Option<DocumentEntry>, CatalogError> {
        for label in entry.labels() {
            if let Some(owner) = self.labels.get(&label) {
                if owner != &entry.file_id {
                    return Err(CatalogError::LabelInUse {
                        label,
                        file_id: owner.clone(),
                    });
                }
            }
        }

        let previous = self.remove(&entry.file_id);
        for label in entry.labels() {
            self.labels.insert(label, entry.file_id.clone());
        }
        self.documents.insert(entry.file_id.clone(), entry);
        Ok(previous)
    }

    /// Removes the entry for `file_id`.
    pub fn remove(&mut self, file_id: &str) -> Option<DocumentEntry> {
        let entry = self.documents.remove(file_id)?;
        for label in entry.labels() {
            self.labels.remove(&label);
        }
        Some(entry)
    }

    /// Removes every entry located under the directory `dir_id`.
    pub fn remove_under(&mut self, dir_id: &str) -> Vec<DocumentEntry> {
        let prefix = format!("{}/", dir_id.trim_end_matches('/'));
        let doomed: Vec<String> = self
            .documents
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .map(|(id, _)| id.clone())
            .collect();
        doomed.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn get(&self, file_id: &str) -> Option<&DocumentEntry> {
        self.documents.get(file_id)
    }

    /// Resolves a search label to its document and chunk.
    pub fn resolve(&self, label: u64) -> Option<(&DocumentEntry, &Chunk)> {
        let file_id = self.labels.get(&label)?;
        let entry = self.documents.get(file_id)?;
        let chunk = entry.chunks.iter().find(|c| c.label == label)?;
        Some((entry, chunk))
    }

    /// Entries ordered by file id.
    pub fn iter(&self) -> impl Iterator<Item = &DocumentEntry> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.labels.len()
    }

    pub fn contains_label(&self, label: u64) -> bool {
        self.labels.contains_key(&label)
    }

    /// Largest label in use, if any.
    pub fn max_label(&self) -> Option<u64> {
        self.labels.keys().copied().max()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.labels.clear();
    }
}

/// Workspace-relative, `/`-separated id for `path`, or `None` if `path` is not
/// inside `workspace`.
pub fn file_id_for(workspace: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(workspace).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
