//! On-disk persistence for the vector index and document catalog.
//!
//! A storage root holds two files:
//!
//! - `index.bin`: the binary vector index image
//! - `metadata.json`: format version, the configuration snapshot the index was built
//!   with, the document catalog, the label counter and the checksum of `index.bin`
//!
//! Both files are replaced atomically. A persisted index is reused only if both
//! files exist, parse, agree with each other and were built with the running
//! configuration. Anything else is reported as a [`LoadOutcome`] and handled by
//! rebuilding, never by failing startup.

pub mod index_files;

pub use index_files::{EncodedIndex, INDEX_FILE, IndexStorage, METADATA_FILE};

use crate::retrieval::catalog::DocumentCatalog;
use crate::retrieval::metadata::IndexMetadata;
use crate::retrieval::vector_index::VectorIndex;

/// A persisted index generation read back from disk.
#[derive(Debug)]
pub struct PersistedIndex {
    pub index: VectorIndex,
    pub catalog: DocumentCatalog,
    pub metadata: IndexMetadata,
    /// Label counter to continue from, never below any label in the catalog.
    pub next_label: u64,
}

/// Result of trying to load a persisted index.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(PersistedIndex),
    /// No index has been written yet
    Missing,
    /// Files are intact but were built with different settings
    Incompatible(String),
    /// Files are unreadable, truncated or inconsistent
    Corrupt(String),
}
