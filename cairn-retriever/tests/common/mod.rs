#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use cairn_embed::{EmbedError, EmbeddingProvider, HashingProvider};
use cairn_retriever::config::IndexingConfig;
use cairn_retriever::retrieval::index_manager::{InitOutcome, IndexManager};
use cairn_retriever::retrieval::indexer_state::IndexerState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DIMENSION: usize = 64;

/// Hashing embeddings that count calls and can be told to fail.
pub struct TestProvider {
    inner: HashingProvider,
    calls: AtomicUsize,
    fail_marker: Option<String>,
}

impl TestProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: HashingProvider::new(dimension),
            calls: AtomicUsize::new(0),
            fail_marker: None,
        }
    }

    /// Fails every text containing `marker`.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for TestProvider {
    async fn embed_text(&self, text: &str) -> cairn_embed::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(EmbedError::invalid_embedding("refusing marked text"));
            }
        }
        self.inner.embed_sync(text)
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "test"
    }

    fn model_id(&self) -> String {
        format!("test-{}", self.inner.embedding_dimension())
    }
}

pub fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// `lines` lines of exactly `width` characters, each ended by a newline.
pub fn fixed_lines(lines: usize, width: usize, word: &str) -> String {
    let mut out = String::new();
    for i in 0..lines {
        let mut line = format!("{word}{i} ");
        while line.len() < width {
            line.push_str(word);
            line.push(' ');
        }
        line.truncate(width);
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn test_config() -> IndexingConfig {
    IndexingConfig::default()
        .with_extensions(["md", "txt", "rs"])
        .with_watch(false)
        .with_debounce(Duration::from_millis(100))
}

pub fn storage_dir(root: &Path) -> PathBuf {
    root.join(".cairn")
}

pub async fn start(
    root: &Path,
    config: IndexingConfig,
    provider: Arc<TestProvider>,
) -> Result<(IndexManager, InitOutcome)> {
    let manager = IndexManager::new(config);
    let outcome = manager
        .initialize(root, storage_dir(root), async move {
            let provider: Arc<dyn EmbeddingProvider> = provider;
            Ok(provider)
        })
        .await?;
    wait_idle(&manager).await?;
    Ok((manager, outcome))
}

pub async fn wait_idle(manager: &IndexManager) -> Result<()> {
    let mut states = manager.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(30),
        states.wait_for(|s| s.is_initialized() && !s.is_indexing()),
    )
    .await??;
    Ok(())
}

pub async fn wait_for_batches(manager: &IndexManager, count: u64) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if manager.stats().await.batches_applied >= count
                && manager.state() != IndexerState::Updating
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}
