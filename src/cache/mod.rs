//! Generic sharded-stat LRU cache with optional Bloom pre-filtering.
//!
//! Capacity is bounded by entry count, total bytes, or both. Eviction pops
//! the recency tail by default; cost-aware mode samples the tail and evicts
//! the entry with the lowest user-supplied cost, which keeps small hot
//! items alive when large cold items pass through.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{EngineError, Result};

pub mod bloom;

use bloom::BloomFilter;

/// Returns the resident size of a value, in bytes.
pub type SizeOfFn<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;

/// Computes an eviction cost from `(access_count, size)`; lowest goes first.
pub type CostFn = Arc<dyn Fn(u64, u64) -> f64 + Send + Sync>;

struct Entry<V> {
    value: V,
    size: u64,
    access_count: u64,
}

struct Inner<K: Hash + Eq, V> {
    map: lru::LruCache<K, Entry<V>, ahash::RandomState>,
    current_bytes: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the map.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Lookups answered negatively by the Bloom filter alone.
    pub bloom_skips: u64,
    /// Live entries.
    pub entries: usize,
    /// Bytes held by live entries.
    pub current_bytes: u64,
    /// Entry-count cap, when configured.
    pub max_entries: Option<usize>,
    /// Byte cap, when configured.
    pub max_bytes: Option<u64>,
}

impl CacheStats {
    /// Hits over total lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Builder for [`LruCache`]. At least one capacity bound is required.
pub struct CacheBuilder<K: Hash + Eq, V> {
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    size_of: Option<SizeOfFn<V>>,
    bloom_expected: Option<usize>,
    sample_size: Option<NonZeroUsize>,
    cost: Option<CostFn>,
    _key: std::marker::PhantomData<K>,
}

impl<K: Hash + Eq, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            max_entries: None,
            max_bytes: None,
            size_of: None,
            bloom_expected: None,
            sample_size: None,
            cost: None,
            _key: std::marker::PhantomData,
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    /// New builder with no bounds configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the cache by live entry count.
    pub fn max_entries(mut self, count: usize) -> Self {
        self.max_entries = Some(count);
        self
    }

    /// Bound the cache by total value bytes. `size_of` reports each value's
    /// resident size.
    pub fn max_bytes(mut self, bytes: u64, size_of: SizeOfFn<V>) -> Self {
        self.max_bytes = Some(bytes);
        self.size_of = Some(size_of);
        self
    }

    /// Enable the Bloom pre-filter, sized for `expected_items` at a 1% FP rate.
    pub fn bloom(mut self, expected_items: usize) -> Self {
        self.bloom_expected = Some(expected_items);
        self
    }

    /// Enable cost-aware eviction: sample up to `sample_size` tail entries
    /// and evict the one with the lowest `cost(access_count, size)`.
    pub fn cost_sampling(mut self, sample_size: usize, cost: CostFn) -> Self {
        self.sample_size = NonZeroUsize::new(sample_size);
        self.cost = Some(cost);
        self
    }

    /// Build the cache. Fails when no capacity bound was configured.
    pub fn build(self) -> Result<LruCache<K, V>> {
        if self.max_entries.is_none() && self.max_bytes.is_none() {
            return Err(EngineError::Config(
                "cache requires an entry or byte capacity".into(),
            ));
        }
        if let Some(0) = self.max_entries {
            return Err(EngineError::Config(
                "cache entry capacity must be greater than zero".into(),
            ));
        }
        Ok(LruCache {
            inner: Mutex::new(Inner {
                map: lru::LruCache::unbounded_with_hasher(ahash::RandomState::new()),
                current_bytes: 0,
            }),
            bloom: self.bloom_expected.map(|n| RwLock::new(BloomFilter::new(n))),
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            size_of: self.size_of,
            sample_size: self.sample_size,
            cost: self.cost,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bloom_skips: AtomicU64::new(0),
        })
    }
}

/// Thread-safe LRU cache. See [`CacheBuilder`] for configuration.
pub struct LruCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    bloom: Option<RwLock<BloomFilter>>,
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    size_of: Option<SizeOfFn<V>>,
    sample_size: Option<NonZeroUsize>,
    cost: Option<CostFn>,
    hits: AtomicU64,
    misses: AtomicU64,
    bloom_skips: AtomicU64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(bloom) = &self.bloom {
            if !bloom.read().may_contain(key) {
                self.bloom_skips.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        let mut inner = self.inner.lock();
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Batch lookup: Bloom-partition without the lock, then resolve the
    /// remainder under a single lock acquisition.
    pub fn get_multi(&self, keys: &[K]) -> (FxHashMap<K, V>, Vec<K>) {
        let mut found = FxHashMap::default();
        let mut missing = Vec::new();
        let mut candidates = Vec::with_capacity(keys.len());

        if let Some(bloom) = &self.bloom {
            let bloom = bloom.read();
            for key in keys {
                if bloom.may_contain(key) {
                    candidates.push(key);
                } else {
                    self.bloom_skips.fetch_add(1, Ordering::Relaxed);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(key.clone());
                }
            }
        } else {
            candidates.extend(keys.iter());
        }

        let mut inner = self.inner.lock();
        for key in candidates {
            match inner.map.get_mut(key) {
                Some(entry) => {
                    entry.access_count += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), entry.value.clone());
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(key.clone());
                }
            }
        }
        (found, missing)
    }

    /// Insert or replace `key`. Returns false when the value alone exceeds
    /// the byte cap and was rejected outright.
    pub fn put(&self, key: K, value: V) -> bool {
        let size = self.size_of.as_ref().map(|f| f(&value)).unwrap_or(0);
        if let Some(max_bytes) = self.max_bytes {
            if size > max_bytes {
                return false;
            }
        }

        if let Some(bloom) = &self.bloom {
            bloom.write().insert(&key);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.map.get_mut(&key) {
            let old_size = entry.size;
            entry.value = value;
            entry.size = size;
            inner.current_bytes = inner.current_bytes - old_size + size;
        } else {
            inner.map.push(
                key,
                Entry {
                    value,
                    size,
                    access_count: 0,
                },
            );
            inner.current_bytes += size;
        }
        self.evict_to_fit(inner);
        true
    }

    /// Insert every pair from `items`.
    pub fn put_multi(&self, items: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in items {
            self.put(key, value);
        }
    }

    /// Drop every entry and reset the Bloom filter.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.current_bytes = 0;
        if let Some(bloom) = &self.bloom {
            bloom.write().reset();
        }
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bloom_skips: self.bloom_skips.load(Ordering::Relaxed),
            entries: inner.map.len(),
            current_bytes: inner.current_bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }

    fn over_capacity(&self, inner: &Inner<K, V>) -> bool {
        if let Some(max) = self.max_entries {
            if inner.map.len() > max {
                return true;
            }
        }
        if let Some(max) = self.max_bytes {
            if inner.current_bytes > max {
                return true;
            }
        }
        false
    }

    fn evict_to_fit(&self, inner: &mut Inner<K, V>) {
        while self.over_capacity(inner) && inner.map.len() > 1 {
            let victim = match (&self.sample_size, &self.cost) {
                (Some(sample), Some(cost)) => {
                    // Sample the recency tail; evict the cheapest entry.
                    inner
                        .map
                        .iter()
                        .rev()
                        .take(sample.get())
                        .map(|(k, e)| (k.clone(), cost(e.access_count, e.size)))
                        .min_by(|a, b| a.1.total_cmp(&b.1))
                        .map(|(k, _)| k)
                }
                _ => None,
            };
            let removed = match victim {
                Some(key) => inner.map.pop(&key).map(|e| e.size),
                None => inner.map.pop_lru().map(|(_, e)| e.size),
            };
            match removed {
                Some(size) => inner.current_bytes = inner.current_bytes.saturating_sub(size),
                None => break,
            }
        }
    }
}
