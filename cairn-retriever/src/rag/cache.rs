//! Time-bounded cache of assembled contexts.
//!
//! Entries expire passively: an expired entry is discarded when it is looked up or
//! when room is needed. When full, the oldest-inserted entry is evicted first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::format::ContextFormat;
use super::{ContextOptions, RagContext};

/// Identifies a query together with every option that shapes its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    k: usize,
    min_score_bits: u32,
    max_tokens: usize,
    format: ContextFormat,
}

impl CacheKey {
    pub fn new(query: &str, options: &ContextOptions) -> Self {
        Self {
            query: query.to_string(),
            k: options.k,
            min_score_bits: options.min_score.to_bits(),
            max_tokens: options.max_tokens,
            format: options.format,
        }
    }
}

struct CachedContext {
    context: RagContext,
    inserted_at: Instant,
}

pub struct ContextCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<CacheKey, CachedContext>,
    insertion_order: VecDeque<CacheKey>,
}

impl ContextCache {
    /// A capacity of zero disables caching.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached context if it is younger than the TTL.
    pub fn get(&mut self, key: &CacheKey) -> Option<RagContext> {
        let fresh = self
            .entries
            .get(key)
            .map(|entry| entry.inserted_at.elapsed() < self.ttl)?;
        if fresh {
            return self.entries.get(key).map(|entry| entry.context.clone());
        }
        self.remove(key);
        None
    }

    pub fn insert(&mut self, key: CacheKey, context: RagContext) {
        if self.capacity == 0 {
            return;
        }
        self.remove(&key);
        if self.entries.len() >= self.capacity {
            self.evict_expired();
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.insertion_order.push_back(key.clone());
        self.entries.insert(
            key,
            CachedContext {
                context,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }

    fn remove(&mut self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.insertion_order.retain(|k| k != key);
        }
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        let entries = &self.entries;
        self.insertion_order.retain(|k| entries.contains_key(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::ContextStats;

    fn context(text: &str) -> RagContext {
        RagContext {
            context_text: text.to_string(),
            chunks: Vec::new(),
            stats: ContextStats::default(),
            cached_at: None,
        }
    }

    fn key(query: &str) -> CacheKey {
        CacheKey::new(query, &ContextOptions::default())
    }

    #[test]
    fn test_key_includes_options() {
        let options = ContextOptions::default();
        let mut other = options.clone();
        other.min_score = 0.5;
        assert_eq!(CacheKey::new("q", &options), CacheKey::new("q", &options));
        assert_ne!(CacheKey::new("q", &options), CacheKey::new("q", &other));
        assert_ne!(CacheKey::new("q", &options), CacheKey::new("p", &options));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let mut cache = ContextCache::new(Duration::from_secs(60), 10);
        cache.insert(key("a"), context("A"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&key("a")).unwrap().context_text, "A");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_inserted_evicted_first() {
        let mut cache = ContextCache::new(Duration::from_secs(60), 2);
        cache.insert(key("a"), context("A"));
        cache.insert(key("b"), context("B"));
        // a lookup does not refresh insertion order
        assert!(cache.get(&key("a")).is_some());
        cache.insert(key("c"), context("C"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_make_room_first() {
        let mut cache = ContextCache::new(Duration::from_secs(10), 2);
        cache.insert(key("a"), context("A"));
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.insert(key("b"), context("B"));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert(key("c"), context("C"));

        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = ContextCache::new(Duration::from_secs(60), 0);
        cache.insert(key("a"), context("A"));
        assert!(cache.get(&key("a")).is_none());
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
