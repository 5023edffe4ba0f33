//! Explicit registry of every cache the server owns.
//!
//! Invalidation goes through the manager: a changed file is forgotten in
//! every registered cache at once, whatever variant it was cached under.

use devito_graph::Runtime;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

use crate::deferred::Abandoned;
use crate::error::CacheError;
use crate::resource::ResourceCache;

/// Per-cache counters for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Type-erased eviction interface implemented by every cache.
pub trait Evict: Send + Sync {
    fn name(&self) -> &str;

    /// Evict every entry for `path`, returning how many were removed.
    fn forget_path(&self, path: &Path) -> usize;

    fn clear(&self) -> usize;

    fn stats(&self) -> CacheStats;
}

/// Owns the set of caches that `forget` and `clear_all` act on.
#[derive(Default)]
pub struct CacheManager {
    caches: RwLock<Vec<Arc<dyn Evict>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .caches
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        f.debug_struct("CacheManager").field("caches", &names).finish()
    }
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing cache.
    pub fn register(&self, cache: Arc<dyn Evict>) {
        tracing::trace!("registering cache '{}'", cache.name());
        self.caches.write().push(cache);
    }

    /// Create a cache and register it.
    ///
    /// # Arguments
    ///
    /// * `name` - Shown in logs and [`CacheStats`]
    /// * `runtime` - Filesystem the cache stats its keys against
    pub fn create<T, E>(&self, name: &str, runtime: Arc<dyn Runtime>) -> Arc<ResourceCache<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + From<CacheError> + From<Abandoned> + 'static,
    {
        let cache = Arc::new(ResourceCache::new(name, runtime));
        self.register(cache.clone());
        cache
    }

    /// Evict `path` (all variants) from every registered cache.
    ///
    /// # Returns
    ///
    /// The number of entries removed across all caches. Zero is normal for
    /// files nothing has read yet.
    pub fn forget(&self, path: &Path) -> usize {
        let removed: usize = self
            .caches
            .read()
            .iter()
            .map(|cache| cache.forget_path(path))
            .sum();
        if removed > 0 {
            tracing::debug!("evicted {} entries for {}", removed, path.display());
        }
        removed
    }

    /// Empty every registered cache.
    pub fn clear_all(&self) -> usize {
        let removed = self.caches.read().iter().map(|cache| cache.clear()).sum();
        tracing::debug!("cleared {} cache entries", removed);
        removed
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        self.caches.read().iter().map(|cache| cache.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }
}
