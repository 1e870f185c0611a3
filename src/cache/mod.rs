use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Thread-safe LRU cache for query embeddings.
///
/// Avoids re-embedding repeated questions (and guardrail pre-checks of
/// the same question) across requests. Bounded by LRU eviction.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Create a cache holding up to `capacity` embeddings.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("Cache capacity must be at least 1");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Look up the embedding for a query text.
    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache.lock().unwrap().get(query).cloned()
    }

    /// Store an embedding keyed by its query text.
    pub fn put(&self, query: String, embedding: Vec<f32>) {
        self.cache.lock().unwrap().put(query, embedding);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }
}
