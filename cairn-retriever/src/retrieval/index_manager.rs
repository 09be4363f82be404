//! The indexing manager: single owner of the vector index and document catalog.
//!
//! All writes (full builds, incremental batches, clears) are serialized by one async
//! write lock. The index generation itself sits behind an `RwLock` that writers take
//! only to apply already-embedded results or to swap in a new generation, so searches
//! run concurrently with indexing and at worst see a slightly stale index.
//!
//! File changes arrive as [`WatchEvent`]s on a channel, either from the
//! [`WorkspaceWatcher`] or from [`IndexManager::event_sender`]. A worker task folds
//! them into [`PendingUpdates`] and applies them once no new event has arrived for
//! the configured debounce interval, persisting once per batch.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cairn_context::chunk_text;
use cairn_embed::EmbeddingProvider;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::catalog::{Chunk, DocumentCatalog, DocumentEntry, file_id_for};
use super::directory_watcher::WorkspaceWatcher;
use super::indexer_state::IndexerState;
use super::metadata::ConfigSnapshot;
use super::scanner::{FsReader, ScanRules, WorkspaceReader, WorkspaceScanner};
use super::update_queue::{PendingUpdates, UpdateAction, UpdateBatch, WatchEvent};
use super::vector_index::VectorIndex;
use crate::config::IndexingConfig;
use crate::storage::{EncodedIndex, IndexStorage, LoadOutcome};

/// How [`IndexManager::initialize`] left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    /// A compatible persisted index was loaded, no rebuild needed
    LoadedFromDisk,
    /// No usable persisted index, a full build is running in the background
    BuildScheduled,
    /// The embedding provider failed to load, indexing is disabled
    ModelUnavailable,
}

/// Summary of one full build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
    pub duration_ms: u64,
}

/// A search hit resolved to its source text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    /// Workspace-relative path of the source file
    pub path: String,
    pub text: String,
    pub chunk_ordinal: usize,
    /// Cosine similarity clamped into `[0, 1]`
    pub score: f32,
}

/// Point-in-time view of the manager, free of side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub enabled: bool,
    pub is_indexing: bool,
    pub is_initialized: bool,
    pub documents_count: usize,
    pub chunks_count: usize,
    pub index_path: Option<PathBuf>,
    pub state: IndexerState,
    /// Incremental batches applied since startup
    pub batches_applied: u64,
}

/// Converts a squared L2 distance between unit vectors into a similarity score.
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// One index generation: the vectors, the catalog describing them and the label
/// counter. Labels are never reused within a generation.
#[derive(Debug)]
struct IndexState {
    index: VectorIndex,
    catalog: DocumentCatalog,
    next_label: u64,
}

impl IndexState {
    fn empty(dimension: usize, capacity: usize) -> Self {
        Self {
            index: VectorIndex::create(dimension, capacity),
            catalog: DocumentCatalog::new(),
            next_label: 0,
        }
    }

    fn tombstone(&mut self, entry: &DocumentEntry) {
        for label in entry.labels() {
            self.index.mark_deleted(label);
        }
    }

    /// Removes `file_id`, or everything beneath it if it names a directory.
    /// Returns the number of documents dropped.
    fn remove_path(&mut self, file_id: &str) -> usize {
        if let Some(entry) = self.catalog.remove(file_id) {
            self.tombstone(&entry);
            return 1;
        }
        let removed = self.catalog.remove_under(file_id);
        for entry in &removed {
            self.tombstone(entry);
        }
        removed.len()
    }

    /// Replaces the file's chunk set with the prepared one. Returns the number of
    /// chunks now indexed for the file.
    fn apply(&mut self, file: PreparedFile) -> Result<usize> {
        self.remove_path_exact(&file.file_id);
        if file.chunks.is_empty() {
            return Ok(0);
        }

        let needed = file.chunks.len();
        if self.index.remaining_capacity() < needed {
            let grow = needed.max(self.index.capacity());
            debug!(
                "Growing vector index capacity from {} by {}",
                self.index.capacity(),
                grow
            );
            self.index.reserve(grow);
        }

        let mut chunks = Vec::with_capacity(needed);
        for piece in file.chunks {
            let label = self.next_label;
            self.next_label += 1;
            if let Err(e) = self.index.add(&piece.vector, label) {
                warn!(
                    "Failed to add chunk {} of {}: {}",
                    piece.ordinal, file.file_id, e
                );
                continue;
            }
            match Chunk::new(piece.text, piece.ordinal, label) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => {
                    self.index.mark_deleted(label);
                    warn!("Skipping chunk of {}: {}", file.file_id, e);
                }
            }
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let labels: Vec<u64> = chunks.iter().map(Chunk::label).collect();
        let count = chunks.len();
        let inserted = DocumentEntry::new(file.file_id, file.path, chunks, file.content_hash)
            .map_err(anyhow::Error::from)
            .and_then(|entry| self.catalog.upsert(entry).map_err(anyhow::Error::from));
        if let Err(e) = inserted {
            for label in labels {
                self.index.mark_deleted(label);
            }
            return Err(e);
        }
        Ok(count)
    }

    fn remove_path_exact(&mut self, file_id: &str) {
        if let Some(entry) = self.catalog.remove(file_id) {
            self.tombstone(&entry);
        }
    }

    /// Rebuilds the graph without tombstones once they exceed `threshold`.
    fn compact_if_needed(&mut self, threshold: f32) -> Result<bool> {
        if self.index.tombstone_count() == 0 || self.index.tombstone_ratio() <= threshold {
            return Ok(false);
        }
        let before = self.index.len();
        self.index = self.index.compacted()?;
        info!(
            "Compacted vector index from {} to {} vectors",
            before,
            self.index.len()
        );
        Ok(true)
    }
}

#[derive(Debug)]
struct PreparedChunk {
    ordinal: usize,
    text: String,
    vector: Vec<f32>,
}

/// A file chunked and embedded outside the state lock, ready to apply.
#[derive(Debug)]
struct PreparedFile {
    file_id: String,
    path: PathBuf,
    content_hash: String,
    chunks: Vec<PreparedChunk>,
    failed_chunks: usize,
}

struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    snapshot: ConfigSnapshot,
}

impl Embedder {
    fn dimension(&self) -> usize {
        self.snapshot.embedding_dimension
    }
}

/// Everything fixed by [`IndexManager::initialize`].
struct Workspace {
    root: PathBuf,
    storage: IndexStorage,
    scanner: WorkspaceScanner,
    embedder: Option<Embedder>,
}

#[derive(Default)]
struct Tasks {
    watcher: Option<WorkspaceWatcher>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    config: IndexingConfig,
    reader: Arc<dyn WorkspaceReader>,
    workspace: OnceLock<Workspace>,
    index: RwLock<Option<IndexState>>,
    write_lock: Mutex<()>,
    state_tx: watch::Sender<IndexerState>,
    enabled: AtomicBool,
    /// State to report while a build or batch is running
    busy: StdMutex<Option<IndexerState>>,
    batches_applied: AtomicU64,
    events_tx: flume::Sender<WatchEvent>,
    events_rx: StdMutex<Option<flume::Receiver<WatchEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Tasks>,
}

/// Handle to the indexing subsystem. Cloning is cheap, all clones share one index.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

impl IndexManager {
    pub fn new(config: IndexingConfig) -> Self {
        Self::with_reader(config, Arc::new(FsReader))
    }

    /// Uses `reader` instead of the local file system for file contents.
    pub fn with_reader(config: IndexingConfig, reader: Arc<dyn WorkspaceReader>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (state_tx, _) = watch::channel(IndexerState::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                reader,
                workspace: OnceLock::new(),
                index: RwLock::new(None),
                write_lock: Mutex::new(()),
                state_tx,
                enabled: AtomicBool::new(true),
                busy: StdMutex::new(None),
                batches_applied: AtomicU64::new(0),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                shutdown_tx,
                tasks: StdMutex::new(Tasks::default()),
            }),
        }
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.inner.config
    }

    /// Loads the embedding provider, then the persisted index if it is usable.
    ///
    /// Returns without waiting for a build: when no usable index exists an empty,
    /// queryable one is installed and a full build is spawned. A provider that fails
    /// to load disables indexing instead of failing.
    pub async fn initialize<F>(
        &self,
        workspace: impl AsRef<Path>,
        storage: impl AsRef<Path>,
        load_provider: F,
    ) -> Result<InitOutcome>
    where
        F: Future<Output = Result<Arc<dyn EmbeddingProvider>>>,
    {
        let _write = self.inner.write_lock.lock().await;
        if self.inner.workspace.get().is_some() {
            anyhow::bail!("Index manager is already initialized");
        }
        let root = tokio::fs::canonicalize(workspace.as_ref())
            .await
            .with_context(|| format!("Workspace {} not found", workspace.as_ref().display()))?;
        let storage = IndexStorage::new(storage.as_ref());
        let mut rules = ScanRules::from_config(&self.inner.config);
        if let Some(relative) = storage_within(&root, storage.root()).await {
            debug!("Excluding index storage {} from scans", relative.display());
            rules = rules.with_ignored_path(relative);
        }
        let scanner = WorkspaceScanner::new(&root, rules);

        self.set_state(IndexerState::LoadingModel);
        let embedder = match load_provider.await {
            Ok(provider) if provider.embedding_dimension() > 0 => {
                info!(
                    "Loaded embedding provider {} ({} dimensions)",
                    provider.model_id(),
                    provider.embedding_dimension()
                );
                Some(Embedder {
                    snapshot: ConfigSnapshot::new(&self.inner.config, provider.as_ref()),
                    provider,
                })
            }
            Ok(provider) => {
                error!(
                    "Embedding provider {} reports zero dimensions, indexing disabled",
                    provider.model_id()
                );
                None
            }
            Err(e) => {
                error!("Failed to load embedding model, indexing disabled: {:#}", e);
                None
            }
        };

        let ws = self.inner.workspace.get_or_init(|| Workspace {
            root,
            storage,
            scanner,
            embedder,
        });
        let Some(embedder) = ws.embedder.as_ref() else {
            self.settle_state();
            return Ok(InitOutcome::ModelUnavailable);
        };
        self.start_worker();

        let storage = ws.storage.clone();
        let expected = embedder.snapshot.clone();
        let capacity = self.inner.config.initial_capacity;
        let outcome =
            tokio::task::spawn_blocking(move || storage.load(&expected, capacity)).await?;

        let persisted = match outcome {
            LoadOutcome::Loaded(persisted) => persisted,
            LoadOutcome::Missing => {
                info!(
                    "No persisted index in {}, building one",
                    ws.storage.root().display()
                );
                return Ok(self.schedule_initial_build(embedder).await);
            }
            LoadOutcome::Incompatible(reason) => {
                warn!("Persisted index is incompatible ({}), rebuilding", reason);
                return Ok(self.schedule_initial_build(embedder).await);
            }
            LoadOutcome::Corrupt(reason) => {
                warn!("Persisted index is unusable ({}), rebuilding", reason);
                return Ok(self.schedule_initial_build(embedder).await);
            }
        };

        self.set_state(IndexerState::IndexLoaded);
        info!(
            "Loaded persisted index: {} documents, {} chunks",
            persisted.catalog.len(),
            persisted.catalog.chunk_count()
        );
        let indexed_at: HashMap<String, DateTime<Utc>> = persisted
            .catalog
            .iter()
            .map(|e| (e.file_id().to_string(), e.indexed_at()))
            .collect();
        *self.inner.index.write().await = Some(IndexState {
            index: persisted.index,
            catalog: persisted.catalog,
            next_label: persisted.next_label,
        });
        self.settle_state();
        self.start_watching();
        self.schedule_catch_up(ws, indexed_at);
        Ok(InitOutcome::LoadedFromDisk)
    }

    async fn schedule_initial_build(&self, embedder: &Embedder) -> InitOutcome {
        *self.inner.index.write().await = Some(IndexState::empty(
            embedder.dimension(),
            self.inner.config.initial_capacity,
        ));
        self.set_busy(Some(IndexerState::BuildingIndex));
        self.settle_state();

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run_build(IndexerState::BuildingIndex).await {
                warn!("Initial index build failed: {:#}", e);
            }
            manager.start_watching();
        });
        InitOutcome::BuildScheduled
    }

    /// Queues updates for files that changed while nothing was watching.
    fn schedule_catch_up(&self, ws: &Workspace, mut indexed_at: HashMap<String, DateTime<Utc>>) {
        let root = ws.root.clone();
        let scanner = ws.scanner.clone();
        let events = self.inner.events_tx.clone();
        tokio::spawn(async move {
            let files = match scanner.scan_async().await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Failed to scan workspace for offline changes: {:#}", e);
                    return;
                }
            };
            let mut queued = 0usize;
            for path in files {
                let Some(file_id) = file_id_for(&root, &path) else {
                    continue;
                };
                let stale = match indexed_at.remove(&file_id) {
                    None => true,
                    Some(at) => tokio::fs::metadata(&path)
                        .await
                        .and_then(|m| m.modified())
                        .map(|modified| DateTime::<Utc>::from(modified) > at)
                        .unwrap_or(true),
                };
                if stale {
                    queued += 1;
                    if events.send_async(WatchEvent::change(path)).await.is_err() {
                        return;
                    }
                }
            }
            for file_id in indexed_at.into_keys() {
                queued += 1;
                if events
                    .send_async(WatchEvent::unlink(root.join(&file_id)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if queued > 0 {
                info!("Queued {} files changed since the index was saved", queued);
            }
        });
    }

    /// Scans, chunks and embeds the whole workspace into a new generation, swaps it
    /// in and persists it. Per-file failures are logged and counted, not returned.
    pub async fn build_index(&self) -> Result<BuildReport> {
        let during = if self.state() == IndexerState::BuildingIndex {
            IndexerState::BuildingIndex
        } else {
            IndexerState::Reindexing
        };
        self.run_build(during).await
    }

    /// Spawns a full rebuild. The current index keeps serving searches until the
    /// new generation is swapped in.
    pub fn reindex(&self) -> JoinHandle<Result<BuildReport>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_build(IndexerState::Reindexing).await })
    }

    async fn run_build(&self, during: IndexerState) -> Result<BuildReport> {
        let (ws, embedder) = self.require_embedder()?;
        let _write = self.inner.write_lock.lock().await;
        self.set_busy(Some(during));
        self.settle_state();
        let result = self.build_locked(ws, embedder).await;
        self.set_busy(None);
        self.settle_state();
        result
    }

    async fn build_locked(&self, ws: &Workspace, embedder: &Embedder) -> Result<BuildReport> {
        let started = Instant::now();
        let files = ws.scanner.scan_async().await?;
        info!("Indexing {} files in {}", files.len(), ws.root.display());

        let mut report = BuildReport {
            files_scanned: files.len(),
            ..BuildReport::default()
        };
        let mut next = IndexState::empty(embedder.dimension(), self.inner.config.initial_capacity);

        let concurrency = self.inner.config.build_concurrency.max(1);
        let mut prepared = stream::iter(files)
            .map(|path| self.prepare_file(ws, embedder, path))
            .buffered(concurrency);
        while let Some(result) = prepared.next().await {
            let file = match result {
                Ok(file) => file,
                Err(e) => {
                    warn!("Failed to index file: {:#}", e);
                    report.files_failed += 1;
                    continue;
                }
            };
            report.chunks_failed += file.failed_chunks;
            let file_id = file.file_id.clone();
            match next.apply(file) {
                Ok(0) => debug!("No chunks indexed for {}", file_id),
                Ok(count) => {
                    report.files_indexed += 1;
                    report.chunks_indexed += count;
                }
                Err(e) => {
                    warn!("Failed to index {}: {:#}", file_id, e);
                    report.files_failed += 1;
                }
            }
        }
        drop(prepared);

        let encoded = IndexStorage::encode(
            &next.index,
            &next.catalog,
            &embedder.snapshot,
            next.next_label,
        )?;
        *self.inner.index.write().await = Some(next);
        if let Err(e) = self.persist(ws, encoded).await {
            warn!("Failed to persist index: {:#}", e);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Indexed {} of {} files ({} chunks, {} files failed) in {}ms",
            report.files_indexed,
            report.files_scanned,
            report.chunks_indexed,
            report.files_failed,
            report.duration_ms
        );
        Ok(report)
    }

    async fn prepare_file(
        &self,
        ws: &Workspace,
        embedder: &Embedder,
        path: PathBuf,
    ) -> Result<PreparedFile> {
        let file_id = file_id_for(&ws.root, &path)
            .with_context(|| format!("{} is outside the workspace", path.display()))?;
        let content = self
            .inner
            .reader
            .read_file(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let hash = content_hash(&content);
        Ok(self
            .prepare_content(embedder, file_id, path, &content, hash)
            .await)
    }

    /// Chunks and embeds one file. Chunks whose embedding fails are skipped.
    async fn prepare_content(
        &self,
        embedder: &Embedder,
        file_id: String,
        path: PathBuf,
        content: &str,
        content_hash: String,
    ) -> PreparedFile {
        let texts = chunk_text(
            content,
            self.inner.config.chunk_size,
            self.inner.config.chunk_overlap,
        );
        if texts.is_empty() {
            return PreparedFile {
                file_id,
                path,
                content_hash,
                chunks: Vec::new(),
                failed_chunks: 0,
            };
        }
        let provider = embedder.provider.as_ref();

        let vectors: Vec<Option<Vec<f32>>> = match provider.embed_texts(&texts).await {
            Ok(result) if result.len() == texts.len() => {
                result.embeddings.into_iter().map(Some).collect()
            }
            batch => {
                if let Err(e) = batch {
                    debug!(
                        "Batch embedding failed for {}, retrying per chunk: {}",
                        file_id, e
                    );
                }
                let mut vectors = Vec::with_capacity(texts.len());
                for (ordinal, text) in texts.iter().enumerate() {
                    match provider.embed_text(text).await {
                        Ok(vector) => vectors.push(Some(vector)),
                        Err(e) => {
                            warn!(
                                "Failed to embed chunk {} of {}: {}",
                                ordinal, file_id, e
                            );
                            vectors.push(None);
                        }
                    }
                }
                vectors
            }
        };

        let mut chunks = Vec::with_capacity(texts.len());
        let mut failed_chunks = 0;
        for (ordinal, (text, vector)) in texts.into_iter().zip(vectors).enumerate() {
            match vector {
                Some(vector) if vector.len() == embedder.dimension() => {
                    chunks.push(PreparedChunk {
                        ordinal,
                        text,
                        vector,
                    });
                }
                Some(vector) => {
                    warn!(
                        "Embedding for chunk {} of {} has {} dimensions, expected {}",
                        ordinal,
                        file_id,
                        vector.len(),
                        embedder.dimension()
                    );
                    failed_chunks += 1;
                }
                None => failed_chunks += 1,
            }
        }

        PreparedFile {
            file_id,
            path,
            content_hash,
            chunks,
            failed_chunks,
        }
    }

    async fn apply_batch(&self, batch: UpdateBatch) {
        if !self.is_enabled() {
            debug!("Indexing disabled, dropping pending updates");
            return;
        }
        let result = match batch {
            UpdateBatch::Rebuild => self.run_build(IndexerState::Reindexing).await.map(|_| ()),
            UpdateBatch::Paths(paths) => self.apply_updates(paths).await,
        };
        if let Err(e) = result {
            warn!("Failed to apply file updates: {:#}", e);
        }
    }

    async fn apply_updates(&self, paths: Vec<(PathBuf, UpdateAction)>) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let (ws, embedder) = self.require_embedder()?;
        let _write = self.inner.write_lock.lock().await;
        if self.inner.index.read().await.is_none() {
            return Ok(());
        }

        self.set_busy(Some(IndexerState::Updating));
        self.settle_state();
        let result = self.apply_updates_locked(ws, embedder, paths).await;
        self.inner.batches_applied.fetch_add(1, Ordering::SeqCst);
        self.set_busy(None);
        self.settle_state();
        result
    }

    async fn apply_updates_locked(
        &self,
        ws: &Workspace,
        embedder: &Embedder,
        paths: Vec<(PathBuf, UpdateAction)>,
    ) -> Result<()> {
        debug!("Applying {} file updates", paths.len());
        let mut changed = false;

        for (path, action) in paths {
            let Some(file_id) = file_id_for(&ws.root, &path) else {
                debug!("Ignoring change outside the workspace: {}", path.display());
                continue;
            };
            let reindex = action == UpdateAction::Reindex
                && ws.scanner.rules().is_eligible(&ws.root, &path);

            // The reader decides whether the path still holds a file.
            let content = if reindex {
                match self.inner.reader.read_file(&path).await {
                    Ok(content) => Some(content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("{} is gone, dropping it from the index", path.display());
                        None
                    }
                    Err(e) => {
                        warn!(
                            "Failed to read {}, dropping it from the index: {}",
                            path.display(),
                            e
                        );
                        None
                    }
                }
            } else {
                None
            };

            let Some(content) = content else {
                let removed = self
                    .inner
                    .index
                    .write()
                    .await
                    .as_mut()
                    .map_or(0, |state| state.remove_path(&file_id));
                if removed > 0 {
                    debug!("Removed {} documents for {}", removed, file_id);
                    changed = true;
                }
                continue;
            };

            let hash = content_hash(&content);
            let unchanged = {
                let guard = self.inner.index.read().await;
                guard
                    .as_ref()
                    .and_then(|state| state.catalog.get(&file_id))
                    .is_some_and(|entry| entry.content_hash() == hash)
            };
            if unchanged {
                debug!("{} is unchanged, skipping", file_id);
                continue;
            }

            let file = self
                .prepare_content(embedder, file_id.clone(), path, &content, hash)
                .await;
            let mut guard = self.inner.index.write().await;
            if let Some(state) = guard.as_mut() {
                match state.apply(file) {
                    Ok(count) => debug!("Re-indexed {} ({} chunks)", file_id, count),
                    Err(e) => warn!("Failed to re-index {}: {:#}", file_id, e),
                }
                changed = true;
            }
        }

        if !changed {
            return Ok(());
        }
        let encoded = {
            let mut guard = self.inner.index.write().await;
            let Some(state) = guard.as_mut() else {
                return Ok(());
            };
            state.compact_if_needed(self.inner.config.compaction_threshold)?;
            IndexStorage::encode(
                &state.index,
                &state.catalog,
                &embedder.snapshot,
                state.next_label,
            )?
        };
        self.persist(ws, encoded).await
    }

    async fn persist(&self, ws: &Workspace, encoded: EncodedIndex) -> Result<()> {
        let storage = ws.storage.clone();
        tokio::task::spawn_blocking(move || storage.write(&encoded)).await?
    }

    /// Empties the index, replacing it with a fresh generation, and persists the
    /// empty state.
    pub async fn clear(&self) -> Result<()> {
        let (ws, embedder) = self.require_embedder()?;
        let _write = self.inner.write_lock.lock().await;
        self.stop_watching();

        let fresh = IndexState::empty(embedder.dimension(), self.inner.config.initial_capacity);
        let encoded =
            IndexStorage::encode(&fresh.index, &fresh.catalog, &embedder.snapshot, 0)?;
        *self.inner.index.write().await = Some(fresh);
        let persisted = self.persist(ws, encoded).await;

        info!("Cleared index for {}", ws.root.display());
        self.start_watching();
        self.settle_state();
        persisted
    }

    /// Turns indexing and search on or off. Disabling stops the watcher and drops
    /// batches that have not started yet, enabling restarts the watcher. Neither
    /// triggers a rebuild.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.inner.enabled.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        if enabled {
            info!("Indexing enabled");
            if self.embedder().is_none() && self.inner.workspace.get().is_some() {
                warn!("No embedding provider is loaded, indexing stays disabled");
            }
            self.start_watching();
        } else {
            info!("Indexing disabled");
            self.stop_watching();
        }
        self.settle_state();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Whether searches can currently be answered.
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.embedder().is_some() && self.state().is_searchable()
    }

    /// Returns up to `k` chunks most similar to `query`, best first. Never fails:
    /// anything that prevents a search yields an empty list.
    pub async fn search(&self, query: &str, k: usize) -> Vec<RetrievalResult> {
        match self.try_search(query, k).await {
            Ok(results) => results,
            Err(e) => {
                debug!("Search unavailable: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Like [`search`](Self::search) but reports why nothing could be searched.
    pub async fn try_search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if !self.is_available() {
            anyhow::bail!("Index is not available in state {}", self.state());
        }
        let embedder = self.embedder().context("No embedding provider loaded")?;
        let query_vector = embedder
            .provider
            .embed_text(query)
            .await
            .context("Failed to embed query")?;

        let guard = self.inner.index.read().await;
        let Some(state) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let hits = state.index.search(&query_vector, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(label, distance)| {
                let (entry, chunk) = state.catalog.resolve(label)?;
                Some(RetrievalResult {
                    path: entry.file_id().to_string(),
                    text: chunk.text().to_string(),
                    chunk_ordinal: chunk.ordinal(),
                    score: similarity_from_distance(distance),
                })
            })
            .collect())
    }

    pub async fn stats(&self) -> IndexStats {
        let (documents_count, chunks_count) = self
            .inner
            .index
            .read()
            .await
            .as_ref()
            .map_or((0, 0), |s| (s.catalog.len(), s.catalog.chunk_count()));
        let state = self.state();
        IndexStats {
            enabled: self.is_enabled(),
            is_indexing: self.busy().is_some(),
            is_initialized: state.is_initialized(),
            documents_count,
            chunks_count,
            index_path: self
                .inner
                .workspace
                .get()
                .map(|ws| ws.storage.index_path()),
            state,
            batches_applied: self.inner.batches_applied.load(Ordering::SeqCst),
        }
    }

    pub fn state(&self) -> IndexerState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<IndexerState> {
        self.inner.state_tx.subscribe()
    }

    /// Sender for feeding file changes from an external watcher.
    pub fn event_sender(&self) -> flume::Sender<WatchEvent> {
        self.inner.events_tx.clone()
    }

    /// Stops the watcher and the update worker. Pending updates are dropped; a batch
    /// already being applied finishes first.
    pub async fn shutdown(&self) {
        self.stop_watching();
        self.inner.shutdown_tx.send_replace(true);
        let worker = self.tasks().worker.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Update worker ended abnormally: {}", e);
            }
        }
        info!("Index manager stopped");
    }

    /// Starts the file watcher if watching is configured and indexing is enabled.
    pub fn start_watching(&self) {
        if !self.inner.config.watch || !self.is_enabled() || *self.inner.shutdown_tx.borrow() {
            return;
        }
        let Some(ws) = self.inner.workspace.get() else {
            return;
        };
        if ws.embedder.is_none() {
            return;
        }
        let mut tasks = self.tasks();
        if tasks.watcher.is_some() {
            return;
        }
        match WorkspaceWatcher::start(
            &ws.root,
            ws.scanner.rules().clone(),
            self.inner.events_tx.clone(),
        ) {
            Ok(watcher) => {
                info!("Watching {} for changes", ws.root.display());
                tasks.watcher = Some(watcher);
            }
            Err(e) => warn!("Failed to start file watcher: {:#}", e),
        }
    }

    fn stop_watching(&self) {
        if self.tasks().watcher.take().is_some() {
            debug!("Stopped file watcher");
        }
    }

    fn start_worker(&self) {
        let receiver = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            return;
        };
        let worker = tokio::spawn(run_update_worker(
            Arc::downgrade(&self.inner),
            receiver,
            self.inner.shutdown_tx.subscribe(),
            self.inner.config.debounce(),
        ));
        self.tasks().worker = Some(worker);
    }

    fn require_embedder(&self) -> Result<(&Workspace, &Embedder)> {
        let ws = self
            .inner
            .workspace
            .get()
            .context("Index manager is not initialized")?;
        let embedder = ws
            .embedder
            .as_ref()
            .context("Embedding provider is unavailable")?;
        Ok((ws, embedder))
    }

    fn embedder(&self) -> Option<&Embedder> {
        self.inner.workspace.get()?.embedder.as_ref()
    }

    fn busy(&self) -> Option<IndexerState> {
        *self.inner.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_busy(&self, busy: Option<IndexerState>) {
        *self.inner.busy.lock().unwrap_or_else(PoisonError::into_inner) = busy;
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derives the resting state from the enabled flag, the provider and any
    /// running build or batch.
    fn settle_state(&self) {
        let next = if !self.is_enabled() || self.embedder().is_none() {
            IndexerState::Disabled
        } else if let Some(busy) = self.busy() {
            busy
        } else {
            IndexerState::Ready
        };
        self.set_state(next);
    }

    fn set_state(&self, next: IndexerState) {
        let previous = self.inner.state_tx.send_replace(next);
        if previous != next {
            debug!("Indexer state {} -> {}", previous, next);
        }
    }
}

/// Returns the storage directory relative to `root` when it lies inside the
/// workspace. The directory may not exist yet, so the nearest existing ancestor
/// is canonicalized.
async fn storage_within(root: &Path, storage: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(storage).ok()?;
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    let resolved = loop {
        if let Ok(canonical) = tokio::fs::canonicalize(existing).await {
            break canonical;
        }
        missing.push(existing.file_name()?.to_os_string());
        existing = existing.parent()?;
    };
    let full = missing.into_iter().rev().fold(resolved, |path, name| path.join(name));
    full.strip_prefix(root).ok().map(Path::to_path_buf)
}

/// Collects events until the channel has been quiet for `debounce`, then applies
/// them as one batch. Every received event restarts the timer.
async fn run_update_worker(
    inner: Weak<Inner>,
    events: flume::Receiver<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
    debounce: Duration,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let first = tokio::select! {
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        let mut pending = PendingUpdates::default();
        pending.push(first);
        loop {
            tokio::select! {
                next = tokio::time::timeout(debounce, events.recv_async()) => match next {
                    Ok(Ok(event)) => pending.push(event),
                    Ok(Err(_)) => return,
                    Err(_) => break,
                },
                _ = shutdown.changed() => return,
            }
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        debug!("Debounce elapsed with {} pending paths", pending.len());
        IndexManager { inner }.apply_batch(pending.drain()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_embed::HashingProvider;

    fn prepared(file_id: &str, texts: &[&str]) -> PreparedFile {
        let provider = HashingProvider::new(16);
        PreparedFile {
            file_id: file_id.to_string(),
            path: PathBuf::from("/ws").join(file_id),
            content_hash: content_hash(&texts.join("\n")),
            chunks: texts
                .iter()
                .enumerate()
                .map(|(ordinal, text)| PreparedChunk {
                    ordinal,
                    text: text.to_string(),
                    vector: provider.embed_sync(text).unwrap(),
                })
                .collect(),
            failed_chunks: 0,
        }
    }

    #[test]
    fn test_similarity_from_distance() {
        assert_eq!(similarity_from_distance(0.0), 1.0);
        assert_eq!(similarity_from_distance(2.0), 0.0);
        assert_eq!(similarity_from_distance(4.0), 0.0);
        assert!((similarity_from_distance(0.5) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_apply_replaces_chunks_and_tombstones() -> Result<()> {
        let mut state = IndexState::empty(16, 4);
        assert_eq!(state.apply(prepared("a.md", &["one", "two", "three"]))?, 3);
        assert_eq!(state.catalog.chunk_count(), 3);

        assert_eq!(state.apply(prepared("a.md", &["four", "five"]))?, 2);
        assert_eq!(state.catalog.len(), 1);
        assert_eq!(state.catalog.chunk_count(), 2);
        assert_eq!(state.index.tombstone_count(), 3);
        assert_eq!(state.next_label, 5);
        // capacity grew past the initial 4 slots
        assert!(state.index.capacity() >= 5);

        let labels: Vec<u64> = state.catalog.get("a.md").unwrap().labels().collect();
        assert_eq!(labels, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn test_apply_without_chunks_removes_entry() -> Result<()> {
        let mut state = IndexState::empty(16, 8);
        state.apply(prepared("a.md", &["one"]))?;
        assert_eq!(state.apply(prepared("a.md", &[]))?, 0);
        assert!(state.catalog.is_empty());
        assert_eq!(state.index.live_count(), 0);
        Ok(())
    }

    #[test]
    fn test_remove_path_handles_directories() -> Result<()> {
        let mut state = IndexState::empty(16, 8);
        state.apply(prepared("docs/a.md", &["a"]))?;
        state.apply(prepared("docs/b.md", &["b"]))?;
        state.apply(prepared("readme.md", &["r"]))?;

        assert_eq!(state.remove_path("docs"), 2);
        assert_eq!(state.remove_path("readme.md"), 1);
        assert_eq!(state.remove_path("missing.md"), 0);
        assert_eq!(state.index.live_count(), 0);
        Ok(())
    }

    #[test]
    fn test_compaction_threshold() -> Result<()> {
        let mut state = IndexState::empty(16, 8);
        state.apply(prepared("a.md", &["one", "two"]))?;
        state.apply(prepared("b.md", &["three", "four"]))?;
        state.remove_path("a.md");

        assert!(!state.compact_if_needed(0.5)?);
        assert!(state.compact_if_needed(0.25)?);
        assert_eq!(state.index.len(), 2);
        assert_eq!(state.index.tombstone_count(), 0);
        assert!(state.catalog.resolve(2).is_some());
        assert!(state.index.contains(3));
        Ok(())
    }

    mod proptest_labels {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn labels_stay_unique_across_updates(
                ops in proptest::collection::vec((0usize..5, 0usize..5, any::<bool>()), 1..40),
            ) {
                let mut state = IndexState::empty(16, 2);
                for (step, (file, chunks, remove)) in ops.into_iter().enumerate() {
                    let file_id = format!("dir{}/file{}.md", file % 2, file);
                    if remove {
                        state.remove_path(&file_id);
                    } else {
                        let texts: Vec<String> = (0..chunks)
                            .map(|c| format!("file {file} chunk {c} step {step}"))
                            .collect();
                        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
                        state.apply(prepared(&file_id, &texts)).unwrap();
                    }

                    let labels: Vec<u64> = state.catalog.iter().flat_map(|e| e.labels()).collect();
                    let unique: std::collections::HashSet<u64> = labels.iter().copied().collect();
                    prop_assert_eq!(unique.len(), labels.len());
                    prop_assert_eq!(labels.len(), state.catalog.chunk_count());
                    prop_assert_eq!(state.index.live_count(), labels.len());
                    for label in labels {
                        prop_assert!(label < state.next_label);
                        prop_assert!(state.index.contains(label));
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_uninitialized_manager() {
        let manager = IndexManager::new(IndexingConfig::default());
        assert_eq!(manager.state(), IndexerState::Uninitialized);
        assert!(!manager.is_available());
        assert!(manager.search("anything", 5).await.is_empty());
        assert!(manager.clear().await.is_err());

        let stats = manager.stats().await;
        assert!(!stats.is_initialized);
        assert_eq!(stats.documents_count, 0);
        assert_eq!(stats.index_path, None);
    }
}
