use criterion::{criterion_group, criterion_main, Criterion};

use capmap::{Builder, CacheMap, EvictionPolicy};
use std::time::Instant;

fn get(c: &mut Criterion) {
    c.bench_function("CacheMap: get", |b| {
        b.iter_custom(|iters| {
            let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(iters.max(1) * 2);
            for i in 0..iters {
                assert!(cache.put(i, i).is_none());
            }
            let start = Instant::now();
            for i in 0..iters {
                drop(cache.get(&i));
            }
            start.elapsed()
        })
    });
}

fn put_unbounded(c: &mut Criterion) {
    c.bench_function("CacheMap: put, unbounded", |b| {
        b.iter_custom(|iters| {
            let cache = Builder::<u64, u64>::new(u64::MAX)
                .eviction_policy(EvictionPolicy::None)
                .build()
                .unwrap();
            let start = Instant::now();
            for i in 0..iters {
                assert!(cache.put(i, i).is_none());
            }
            start.elapsed()
        })
    });
}

fn put_saturated_lru(c: &mut Criterion) {
    let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(256);
    for k in 0..256 {
        cache.put(k, k);
    }
    let mut max_key = 256;
    c.bench_function("CacheMap: put, saturated, lru", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for i in max_key..(max_key + iters) {
                cache.put(i, i);
            }
            max_key += iters;
            start.elapsed()
        })
    });
}

fn put_saturated_lirs(c: &mut Criterion) {
    let cache = Builder::<u64, u64>::new(256)
        .eviction_policy(EvictionPolicy::Lirs)
        .build()
        .unwrap();
    for k in 0..256 {
        cache.put(k, k);
    }
    let mut max_key = 256;
    c.bench_function("CacheMap: put, saturated, lirs", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for i in max_key..(max_key + iters) {
                cache.put(i, i);
            }
            max_key += iters;
            start.elapsed()
        })
    });
}

criterion_group!(cache_map, get, put_unbounded, put_saturated_lru, put_saturated_lirs);
criterion_main!(cache_map);
