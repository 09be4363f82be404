//! Retrieval-augmented context assembly.
//!
//! [`ContextAssembler::get_context`] turns a query into a token-budgeted block of
//! context text:
//!
//! 1. Look up `(query, options)` in the TTL cache; a fresh hit is returned as is.
//! 2. Search the index for `k` candidates and drop those scoring below `min_score`.
//! 3. Rank by score, keeping search order for ties.
//! 4. Take candidates greedily while the estimated token total fits `max_tokens`,
//!    stopping at the first one that does not fit.
//! 5. Render the selection grouped by file and cache it.
//!
//! `None` means there is no retrieval system to ask (index disabled, not yet
//! initialized, or the query could not be embedded). A blank query, or a search
//! that finds nothing relevant, still yields a context, with empty text.

pub mod cache;
pub mod format;

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cairn_context::{CharRatioEstimator, TokenEstimator};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::retrieval::index_manager::{IndexManager, RetrievalResult};
use cache::{CacheKey, ContextCache};
pub use format::{ContextFormat, format_context};

/// Where candidate chunks come from.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Whether a search can be attempted at all.
    fn is_available(&self) -> bool;

    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<RetrievalResult>>;
}

#[async_trait]
impl SearchBackend for IndexManager {
    fn is_available(&self) -> bool {
        IndexManager::is_available(self)
    }

    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<RetrievalResult>> {
        self.try_search(query, k).await
    }
}

/// Knobs for one `get_context` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    pub k: usize,
    pub min_score: f32,
    pub max_tokens: usize,
    pub format: ContextFormat,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for ContextOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k: config.k,
            min_score: config.min_score,
            max_tokens: config.max_tokens,
            format: config.format,
        }
    }
}

impl ContextOptions {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_format(mut self, format: ContextFormat) -> Self {
        self.format = format;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    /// Candidates returned by the index search
    pub chunks_found: usize,
    /// Candidates that made it into the context
    pub chunks_used: usize,
    /// Estimated tokens of the used chunks
    pub total_tokens: usize,
    /// Distinct source files of the used chunks, in rank order
    pub files_included: Vec<String>,
}

/// An assembled context, ready for a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RagContext {
    pub context_text: String,
    pub chunks: Vec<RetrievalResult>,
    pub stats: ContextStats,
    /// When the context was assembled. Cache hits keep the original time.
    pub cached_at: Option<DateTime<Utc>>,
}

pub struct ContextAssembler<B, E = CharRatioEstimator> {
    backend: B,
    estimator: E,
    cache: Mutex<ContextCache>,
}

impl<B: SearchBackend> ContextAssembler<B, CharRatioEstimator> {
    pub fn new(backend: B, config: &RetrievalConfig) -> Self {
        Self {
            backend,
            estimator: CharRatioEstimator::default(),
            cache: Mutex::new(ContextCache::new(config.cache_ttl(), config.cache_capacity)),
        }
    }
}

impl<B: SearchBackend, E: TokenEstimator> ContextAssembler<B, E> {
    /// Swaps the token estimator used for budgeting.
    pub fn with_estimator<E2: TokenEstimator>(self, estimator: E2) -> ContextAssembler<B, E2> {
        ContextAssembler {
            backend: self.backend,
            estimator,
            cache: self.cache,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get_context(&self, query: &str, options: &ContextOptions) -> Option<RagContext> {
        if !self.backend.is_available() {
            debug!("Retrieval unavailable, no context for query");
            return None;
        }

        if query.trim().is_empty() {
            debug!("Blank query, returning empty context");
            return Some(self.assemble(Vec::new(), options));
        }

        let key = CacheKey::new(query, options);
        if let Some(hit) = self.cache().get(&key) {
            debug!("Context cache hit for {:?}", query);
            return Some(hit);
        }

        let found = match self.backend.search(query, options.k).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to retrieve context: {:#}", e);
                return None;
            }
        };
        let context = self.assemble(found, options);
        debug!(
            "Assembled context from {} of {} chunks ({} tokens)",
            context.stats.chunks_used, context.stats.chunks_found, context.stats.total_tokens
        );
        self.cache().insert(key, context.clone());
        Some(context)
    }

    /// Filters, ranks, packs and renders search results.
    pub fn assemble(&self, found: Vec<RetrievalResult>, options: &ContextOptions) -> RagContext {
        let chunks_found = found.len();
        let mut candidates: Vec<RetrievalResult> = found
            .into_iter()
            .filter(|c| c.score >= options.min_score)
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut chunks = Vec::new();
        let mut total_tokens = 0;
        for candidate in candidates {
            let cost = self.estimator.estimate(&candidate.text);
            if total_tokens + cost > options.max_tokens {
                break;
            }
            total_tokens += cost;
            chunks.push(candidate);
        }

        let files_included = chunks.iter().map(|c| c.path.clone()).unique().collect();
        RagContext {
            context_text: format_context(&chunks, options.format),
            stats: ContextStats {
                chunks_found,
                chunks_used: chunks.len(),
                total_tokens,
                files_included,
            },
            chunks,
            cached_at: Some(Utc::now()),
        }
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn cache(&self) -> MutexGuard<'_, ContextCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
