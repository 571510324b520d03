//! LRU cache of native read windows with per-key read coalescing.
//!
//! Keyed by `(SourceId, PixelWindow)`. Concurrent misses on the same key share
//! a single load: the first caller performs the read, later callers block
//! until it finishes and receive the same result, success or failure.
//! Failures are never retained.
//!
//! Capacity counts entries. A capacity of zero disables retention but keeps
//! coalescing of in-flight reads.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use ndarray::Array3;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{SourceIoError, SourceIoKind};
use crate::geometry::PixelWindow;
use crate::source::SourceId;

pub type TileKey = (SourceId, PixelWindow);
pub type TileResult = Result<Arc<Array3<f32>>, SourceIoError>;

/// A load in progress; waiters park on the condvar until `result` is set.
struct Pending {
    result: Mutex<Option<TileResult>>,
    ready: Condvar,
}

impl Pending {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> TileResult {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut guard);
        }
    }

    fn complete(&self, result: TileResult) {
        *self.result.lock() = Some(result);
        self.ready.notify_all();
    }
}

struct Inner {
    entries: Option<LruCache<TileKey, Arc<Array3<f32>>>>,
    in_flight: HashMap<TileKey, Arc<Pending>>,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
}

pub struct TileCache {
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

/// Completes the pending entry even if the loader panics, so waiters never hang.
struct LoadGuard<'a> {
    cache: &'a TileCache,
    key: TileKey,
    pending: Arc<Pending>,
    done: bool,
}

impl LoadGuard<'_> {
    fn finish(mut self, result: TileResult) -> TileResult {
        self.cache.publish(self.key, &self.pending, result.clone());
        self.done = true;
        result
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let err = SourceIoError::new(
                SourceIoKind::Decode,
                format!("{}", self.key.0),
                "reader panicked",
            );
            self.cache.publish(self.key, &self.pending, Err(err));
        }
    }
}

impl TileCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: NonZeroUsize::new(capacity).map(LruCache::new),
                in_flight: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Cached window, without loading.
    pub fn get(&self, key: &TileKey) -> Option<Arc<Array3<f32>>> {
        let mut inner = self.inner.lock();
        inner.entries.as_mut().and_then(|entries| entries.get(key).cloned())
    }

    #[must_use]
    pub fn contains(&self, key: &TileKey) -> bool {
        let inner = self.inner.lock();
        inner.entries.as_ref().is_some_and(|entries| entries.contains(key))
    }

    /// Return the cached window for `key`, or run `load` exactly once across
    /// all concurrent callers and share its result.
    ///
    /// # Errors
    /// Returns the loader's error to every caller waiting on that load.
    pub fn get_or_load<F>(&self, key: TileKey, load: F) -> TileResult
    where
        F: FnOnce() -> Result<Array3<f32>, SourceIoError>,
    {
        let pending = {
            let mut inner = self.inner.lock();
            if let Some(hit) = inner.entries.as_mut().and_then(|entries| entries.get(&key).cloned()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
            if let Some(pending) = inner.in_flight.get(&key) {
                let pending = Arc::clone(pending);
                drop(inner);
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                return pending.wait();
            }
            let pending = Arc::new(Pending::new());
            inner.in_flight.insert(key, Arc::clone(&pending));
            pending
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let guard = LoadGuard {
            cache: self,
            key,
            pending,
            done: false,
        };
        let result = load().map(Arc::new);
        guard.finish(result)
    }

    fn publish(&self, key: TileKey, pending: &Pending, result: TileResult) {
        {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&key);
            if let (Ok(data), Some(entries)) = (&result, inner.entries.as_mut()) {
                entries.put(key, Arc::clone(data));
            }
        }
        pending.complete(result);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.as_ref().map_or(0, LruCache::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(entries) = self.inner.lock().entries.as_mut() {
            entries.clear();
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn key(i: usize) -> TileKey {
        (SourceId(i), PixelWindow::new(0, 0, 2, 2))
    }

    fn tile(v: f32) -> Array3<f32> {
        Array3::from_elem((1, 2, 2), v)
    }

    #[test]
    fn test_hit_after_load() {
        let cache = TileCache::new(4);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let data = cache
                .get_or_load(key(0), || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(tile(1.0))
                })
                .unwrap();
            assert_eq!(data[(0, 0, 0)], 1.0);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (2, 1, 1));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TileCache::new(2);
        for i in 0..3 {
            cache.get_or_load(key(i), || Ok(tile(0.0))).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn test_errors_not_cached() {
        let cache = TileCache::new(4);
        let err = cache
            .get_or_load(key(0), || Err(SourceIoError::new(SourceIoKind::Open, "a.tif", "missing")))
            .unwrap_err();
        assert_eq!(err.kind, SourceIoKind::Open);
        assert!(cache.is_empty());
        assert!(cache.get_or_load(key(0), || Ok(tile(2.0))).is_ok());
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let cache = TileCache::new(0);
        cache.get_or_load(key(0), || Ok(tile(0.0))).unwrap();
        assert!(cache.get(&key(0)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_concurrent_reads_coalesce() {
        let cache = Arc::new(TileCache::new(0));
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_load(key(7), || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(200));
                            Ok(tile(7.0))
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap()[(0, 1, 1)], 7.0);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 7);
    }
}
