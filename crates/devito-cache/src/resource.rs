//! Stat-gated resource cache.
//!
//! Entries are keyed by [`CacheKey`] and guarded by the [`StatSignature`] of
//! the key's file at the time the entry was created. A request re-stats the
//! file; an unchanged signature returns the stored payload (possibly still
//! being computed), a changed one replaces the entry with a fresh compute.
//!
//! Concurrent requests for the same key and signature share one compute.
//! Computes run on their own task so a caller that goes away does not
//! cancel work other callers are waiting on. A failed compute removes its
//! entry before the failure is delivered, so the next request retries.

use devito_graph::{Runtime, StatSignature};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::deferred::{Abandoned, Deferred, Pending};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::manager::{CacheStats, Evict};

/// A payload together with the signature it was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    pub signature: StatSignature,
    pub payload: T,
}

struct CacheEntry<T, E> {
    id: u64,
    signature: StatSignature,
    /// Primed in memory; served without stat-gating until evicted.
    pinned: bool,
    payload: Pending<T, E>,
}

type Entries<T, E> = Arc<Mutex<FxHashMap<CacheKey, CacheEntry<T, E>>>>;

/// Keyed cache of lazily computed payloads, invalidated by stat signature.
///
/// Each entry remembers the [`StatSignature`] of its file at compute time.
/// A lookup stats the file again and reuses the entry only while the
/// signature matches, so no file watcher is needed for correctness. Watch
/// events just make eviction happen sooner.
///
/// Concurrent misses for one key share a single compute: the first caller
/// installs a pending entry and runs `compute`, later callers wait on it.
/// A failed compute is evicted rather than cached, so the next lookup
/// retries.
///
/// # Example
///
/// ```ignore
/// use devito_cache::{CacheKey, CacheManager, CacheError};
///
/// let manager = CacheManager::new();
/// let lengths = manager.create::<usize, CacheError>("lengths", runtime.clone());
///
/// let cached = lengths
///     .get_or_create(CacheKey::new("/app/index.ts"), |key, _signature| async move {
///         Ok(std::fs::read(&key.path)?.len())
///     })
///     .await?;
/// println!("{} bytes at {:?}", cached.payload, cached.signature);
/// ```
pub struct ResourceCache<T, E = CacheError> {
    name: String,
    runtime: Arc<dyn Runtime>,
    entries: Entries<T, E>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T, E> std::fmt::Debug for ResourceCache<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<T, E> ResourceCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<CacheError> + From<Abandoned> + 'static,
{
    pub fn new(name: impl Into<String>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            name: name.into(),
            runtime,
            entries: Arc::default(),
            next_id: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current signature of `key`'s file.
    pub async fn stat(&self, key: &CacheKey) -> Result<StatSignature, E> {
        let meta = self
            .runtime
            .metadata(&key.path)
            .await
            .map_err(|e| E::from(CacheError::from(e)))?;
        Ok(meta.signature())
    }

    /// Return the payload for `key`, computing it if there is no entry or
    /// the file's signature changed since the entry was created.
    ///
    /// `compute` is only called on a miss and receives the key and the
    /// signature the entry will be stored under.
    ///
    /// # Errors
    ///
    /// Returns the stat error if the file cannot be statted (a missing file
    /// is [`CacheError::NotFound`]), or the error `compute` returned. Callers
    /// that joined an in-flight compute get that compute's error too.
    pub async fn get_or_create<F, Fut>(&self, key: CacheKey, compute: F) -> Result<Cached<T>, E>
    where
        F: FnOnce(CacheKey, StatSignature) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(cached) = self.pinned(&key) {
            return cached.await_payload().await;
        }

        let signature = self.stat(&key).await?;
        self.get_or_create_at(key, signature, compute).await
    }

    /// [`get_or_create`](Self::get_or_create) against a signature the caller
    /// already observed, without statting again.
    ///
    /// For values derived from another cached payload: the derived entry is
    /// stored under the signature its input was read at, so a save between
    /// the two lookups cannot pair old text with the new signature.
    pub async fn get_or_create_at<F, Fut>(
        &self,
        key: CacheKey,
        signature: StatSignature,
        compute: F,
    ) -> Result<Cached<T>, E>
    where
        F: FnOnce(CacheKey, StatSignature) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(cached) = self.pinned(&key) {
            return cached.await_payload().await;
        }

        let (pending, fresh) = {
            let mut entries = self.entries.lock();
            let hit = entries
                .get(&key)
                .filter(|e| !e.pinned && e.signature == signature)
                .map(|e| e.payload.clone());
            match hit {
                Some(pending) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("{}: hit {}", self.name, key);
                    (pending, None)
                }
                None => {
                    if entries.contains_key(&key) {
                        tracing::debug!("{}: {} changed on disk, recomputing", self.name, key);
                    }
                    self.misses.fetch_add(1, Ordering::Relaxed);

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let deferred = Deferred::new();
                    let pending = deferred.subscribe();
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            id,
                            signature,
                            pinned: false,
                            payload: pending.clone(),
                        },
                    );
                    (pending, Some((id, deferred)))
                }
            }
        };

        if let Some((id, deferred)) = fresh {
            let work = compute(key.clone(), signature);
            let guard = ComputeGuard {
                entries: Arc::clone(&self.entries),
                key,
                id,
                deferred,
            };
            let name = self.name.clone();
            tokio::spawn(async move {
                match work.await {
                    Ok(value) => {
                        guard.deferred.resolve(value);
                    }
                    Err(err) => {
                        guard.evict();
                        tracing::debug!("{}: compute for {} failed", name, guard.key);
                        guard.deferred.reject(err);
                    }
                }
            });
        }

        let payload = pending.wait().await?;
        Ok(Cached { signature, payload })
    }

    fn pinned(&self, key: &CacheKey) -> Option<PinnedHit<T, E>> {
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|e| e.pinned)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(PinnedHit {
            signature: entry.signature,
            payload: entry.payload.clone(),
        })
    }

    /// Store an in-memory value for `key` that is served as-is, without
    /// consulting the filesystem, until it is forgotten or primed again.
    pub fn prime(&self, key: CacheKey, value: T) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deferred: Deferred<T, E> = Deferred::resolved(value);
        self.entries.lock().insert(
            key,
            CacheEntry {
                id,
                signature: StatSignature::default(),
                pinned: true,
                payload: deferred.subscribe(),
            },
        );
    }

    /// Evict one key. Returns whether an entry was removed.
    pub fn forget(&self, key: &CacheKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Evict every variant of `path`.
    pub fn forget_path(&self, path: &Path) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.path != path);
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.pinned)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of requests still waiting on a compute.
    pub fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.payload.is_settled())
            .count()
    }
}

/// Owns a compute's producer. A compute that ends without settling (its task
/// panicked or was cancelled) evicts its entry so the key is retried.
struct ComputeGuard<T: Clone, E: Clone + From<Abandoned>> {
    entries: Entries<T, E>,
    key: CacheKey,
    id: u64,
    deferred: Deferred<T, E>,
}

impl<T: Clone, E: Clone + From<Abandoned>> ComputeGuard<T, E> {
    fn evict(&self) {
        let mut entries = self.entries.lock();
        if entries.get(&self.key).is_some_and(|e| e.id == self.id) {
            entries.remove(&self.key);
        }
    }
}

impl<T: Clone, E: Clone + From<Abandoned>> Drop for ComputeGuard<T, E> {
    fn drop(&mut self) {
        if !self.deferred.is_settled() {
            self.evict();
        }
    }
}

struct PinnedHit<T, E> {
    signature: StatSignature,
    payload: Pending<T, E>,
}

impl<T, E> PinnedHit<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    async fn await_payload(self) -> Result<Cached<T>, E> {
        let payload = self.payload.wait().await?;
        Ok(Cached {
            signature: self.signature,
            payload,
        })
    }
}

impl<T, E> Evict for ResourceCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<CacheError> + From<Abandoned> + 'static,
{
    fn name(&self) -> &str {
        ResourceCache::name(self)
    }

    fn forget_path(&self, path: &Path) -> usize {
        ResourceCache::forget_path(self, path)
    }

    fn clear(&self) -> usize {
        ResourceCache::clear(self)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.clone(),
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
