#![allow(missing_docs)]

use std::sync::Arc;

use gitmill::cache::{CacheBuilder, CostFn, LruCache, SizeOfFn};

#[test]
fn recency_invariant_holds_without_cost_sampling() {
    // Eviction never removes an entry touched more recently than K others
    // that remain.
    let cache: LruCache<u32, u32> = CacheBuilder::new().max_entries(8).build().expect("cache");
    for i in 0..8 {
        cache.put(i, i);
    }
    // Touch 0..4 so 4..8 form the cold tail.
    for i in 0..4 {
        cache.get(&i);
    }
    for i in 100..104 {
        cache.put(i, i);
    }
    for i in 0..4 {
        assert_eq!(cache.get(&i), Some(i), "recently-touched entry {i} evicted");
    }
    for i in 4..8 {
        assert_eq!(cache.get(&i), None, "cold entry {i} should have been evicted");
    }
}

#[test]
fn bloom_filter_never_false_negative() {
    let cache: LruCache<u64, u64> = CacheBuilder::new()
        .max_entries(1024)
        .bloom(1024)
        .build()
        .expect("cache");
    for i in 0..500u64 {
        cache.put(i, i * 2);
    }
    for i in 0..500u64 {
        assert_eq!(cache.get(&i), Some(i * 2), "put key {i} must hit");
    }
}

#[test]
fn bloom_effectiveness_on_absent_keys() {
    // 100 present keys, 200 absent queries: at the nominal 1% FP rate the
    // expected skip count is ~198; require at least 180.
    let cache: LruCache<u64, u64> = CacheBuilder::new()
        .max_entries(256)
        .bloom(100)
        .build()
        .expect("cache");
    for i in 0..100u64 {
        cache.put(i, i);
    }
    for i in 10_000..10_200u64 {
        assert_eq!(cache.get(&i), None);
    }
    let stats = cache.stats();
    assert!(
        stats.bloom_skips >= 180,
        "expected at least 180 bloom skips, got {}",
        stats.bloom_skips
    );
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 200);
}

#[test]
fn byte_capped_cache_tracks_sizes_through_updates() {
    let size_of: SizeOfFn<Vec<u8>> = Arc::new(|v| v.len() as u64);
    let cache: LruCache<u32, Vec<u8>> = CacheBuilder::new()
        .max_bytes(1000, size_of)
        .build()
        .expect("cache");
    cache.put(1, vec![0; 400]);
    cache.put(1, vec![0; 100]);
    cache.put(2, vec![0; 500]);
    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.current_bytes, 600);
}

#[test]
fn cost_sampling_keeps_hot_small_entries_under_churn() {
    let size_of: SizeOfFn<Vec<u8>> = Arc::new(|v| v.len() as u64);
    let cost: CostFn = Arc::new(|access, size| (access + 1) as f64 / size.max(1) as f64);
    let cache: LruCache<u32, Vec<u8>> = CacheBuilder::new()
        .max_bytes(4096, size_of)
        .cost_sampling(8, cost)
        .build()
        .expect("cache");

    cache.put(0, vec![0; 64]);
    for _ in 0..50 {
        cache.get(&0);
    }
    // Stream large cold values through; the hot 64-byte entry survives.
    for i in 1..100u32 {
        cache.put(i, vec![0; 1024]);
    }
    assert_eq!(cache.get(&0), Some(vec![0; 64]));
}

#[test]
fn get_multi_uses_one_pass_and_reports_missing() {
    let cache: LruCache<u64, u64> = CacheBuilder::new()
        .max_entries(64)
        .bloom(64)
        .build()
        .expect("cache");
    for i in 0..32u64 {
        cache.put(i, i + 1000);
    }
    let keys: Vec<u64> = (0..64).collect();
    let (found, missing) = cache.get_multi(&keys);
    assert_eq!(found.len(), 32);
    assert_eq!(missing.len(), 32);
    for key in 0..32u64 {
        assert_eq!(found[&key], key + 1000);
    }
    for key in &missing {
        assert!(*key >= 32);
    }
}

#[test]
fn concurrent_readers_and_writers_never_panic() {
    let size_of: SizeOfFn<Vec<u8>> = Arc::new(|v| v.len() as u64);
    let cache: Arc<LruCache<u64, Vec<u8>>> = Arc::new(
        CacheBuilder::new()
            .max_bytes(64 * 1024, size_of)
            .bloom(4096)
            .build()
            .expect("cache"),
    );

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || {
            for i in 0..2000u64 {
                let key = (t * 1_000_000) + (i % 512);
                if i % 3 == 0 {
                    cache.put(key, vec![0; (i % 256) as usize]);
                } else {
                    let _ = cache.get(&key);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no panics under contention");
    }
    let stats = cache.stats();
    assert!(stats.current_bytes <= 64 * 1024);
}
