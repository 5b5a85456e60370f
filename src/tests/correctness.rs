#[cfg(test)]
mod cache_map_test {
    use crate::{Builder, CacheMap, ConfigError, EvictionListener, EvictionPolicy};
    use proptest::prelude::*;
    use sdd::Guard;
    use std::collections::{BTreeSet, HashMap};
    use std::hash::{BuildHasher, Hasher};
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::atomic::{AtomicUsize, AtomicU64};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    static_assertions::assert_impl_all!(CacheMap<String, String>: Send, Sync);
    static_assertions::assert_not_impl_all!(CacheMap<String, *const String>: Send, Sync);

    /// Counts live instances to verify that drops are neither lost nor duplicated.
    struct R(&'static AtomicUsize);
    impl R {
        fn new(cnt: &'static AtomicUsize) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt)
        }
    }
    impl Clone for R {
        fn clone(&self) -> Self {
            self.0.fetch_add(1, Relaxed);
            R(self.0)
        }
    }
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    /// A hasher sending every key to the same bin, to force chains and tree bins.
    #[derive(Clone, Default)]
    struct CollidingHasher;
    impl BuildHasher for CollidingHasher {
        type Hasher = ConstantHasher;
        fn build_hasher(&self) -> ConstantHasher {
            ConstantHasher
        }
    }
    struct ConstantHasher;
    impl Hasher for ConstantHasher {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[derive(Default)]
    struct TrackingListener {
        evicted: Mutex<Vec<u64>>,
        chosen: AtomicUsize,
        activated: AtomicUsize,
        removed: AtomicUsize,
    }
    impl EvictionListener<u64, u64> for Arc<TrackingListener> {
        fn on_entries_evicted(&self, evicted: &[(u64, u64)]) {
            let mut guard = self.evicted.lock().unwrap();
            guard.extend(evicted.iter().map(|(k, _)| *k));
        }
        fn on_entry_chosen_for_eviction(&self, _key: &u64) {
            self.chosen.fetch_add(1, Relaxed);
        }
        fn on_entry_activated(&self, _key: &u64) {
            self.activated.fetch_add(1, Relaxed);
        }
        fn on_entry_removed(&self, _key: &u64) {
            self.removed.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn round_trip() {
        let cache: CacheMap<u64, String> = CacheMap::with_maximum_size(256);
        for k in 0..64_u64 {
            assert!(cache.put(k, format!("v{k}")).is_none());
        }
        for k in 0..64_u64 {
            assert_eq!(cache.get(&k), Some(format!("v{k}")));
        }
        assert_eq!(cache.len(), 64);
        for k in 0..64_u64 {
            assert_eq!(cache.remove(&k), Some(format!("v{k}")));
            assert_eq!(cache.get(&k), None);
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn update_operations() {
        let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(256);
        assert!(cache.put_if_absent(1, 10).is_none());
        assert_eq!(cache.put_if_absent(1, 11), Some(10));
        assert_eq!(cache.get(&1), Some(10));

        assert_eq!(cache.put(1, 12), Some(10));
        assert_eq!(cache.replace(&1, 13), Some(12));
        assert_eq!(cache.replace(&2, 1), None);
        assert_eq!(cache.replace_if(&1, |v| *v == 0, 14), None);
        assert_eq!(cache.replace_if(&1, |v| *v == 13, 14), Some(13));

        assert_eq!(cache.remove_if(&1, |v| *v == 0), None);
        assert_eq!(cache.remove_if(&1, |v| *v == 14), Some(14));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn compute_operations() {
        let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(256);
        assert_eq!(cache.compute_if_absent(1, |k| k + 1), 2);
        assert_eq!(cache.compute_if_absent(1, |_| unreachable!()), 2);

        assert_eq!(cache.compute_if_present(&2, |_, _| unreachable!()), None);
        assert_eq!(cache.compute_if_present(&1, |_, v| Some(v * 2)), Some(4));
        assert_eq!(cache.compute_if_present(&1, |_, _| None), None);
        assert!(!cache.contains(&1));

        assert_eq!(cache.compute(3, |_, current| {
            assert!(current.is_none());
            Some(30)
        }), Some(30));
        assert_eq!(cache.compute(3, |_, current| current.map(|v| v + 1)), Some(31));
        assert_eq!(cache.compute(3, |_, _| None), None);
        assert_eq!(cache.compute(4, |_, _| None), None);
        assert!(!cache.contains(&3));
        assert!(!cache.contains(&4));

        assert_eq!(cache.merge(5, 1, |_, _| unreachable!()), Some(1));
        assert_eq!(cache.merge(5, 2, |old, new| Some(old + new)), Some(3));
        assert_eq!(cache.merge(5, 0, |_, _| None), None);
        assert!(!cache.contains(&5));
    }

    #[test]
    fn invalid_configurations() {
        assert_eq!(
            Builder::<u64, u64>::new(0).build().err(),
            Some(ConfigError::ZeroMaximumSize)
        );
        assert_eq!(
            Builder::<u64, u64>::new(16)
                .eviction_policy(EvictionPolicy::Lirs)
                .entry_size_calculator(|_: &u64, _: &u64| 1)
                .build()
                .err(),
            Some(ConfigError::SizeCalculatorRequiresLru)
        );
        assert_eq!(
            Builder::<u64, u64>::new(16)
                .eviction_policy(EvictionPolicy::None)
                .entry_size_calculator(|_: &u64, _: &u64| 1)
                .build()
                .err(),
            Some(ConfigError::SizeCalculatorRequiresLru)
        );
        assert!(Builder::<u64, u64>::new(16).build().is_ok());
    }

    #[test]
    fn lru_example_scenario() {
        let listener = Arc::new(TrackingListener::default());
        let cache = Builder::<u64, u64>::new(3)
            .eviction_listener(listener.clone())
            .build()
            .unwrap();
        assert!(cache.put(1, 1).is_none());
        assert!(cache.put(2, 2).is_none());
        assert!(cache.put(3, 3).is_none());
        assert_eq!(cache.get(&1), Some(1));
        assert!(cache.put(4, 4).is_none());

        // Key 2 was the least recently used.
        assert_eq!(listener.evicted.lock().unwrap().as_slice(), &[2]);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn lru_eviction_order_is_insertion_order_without_reads() {
        let listener = Arc::new(TrackingListener::default());
        let cache = Builder::<u64, u64>::new(8)
            .eviction_listener(listener.clone())
            .build()
            .unwrap();
        for k in 0..13_u64 {
            assert!(cache.put(k, k).is_none());
        }
        assert_eq!(listener.evicted.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
        for k in 0..5_u64 {
            assert!(!cache.contains(&k));
        }
        for k in 5..13_u64 {
            assert!(cache.contains(&k));
        }
    }

    #[test]
    fn peek_does_not_promote() {
        let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(3);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.peek(&1), Some(1));
        cache.put(4, 4);

        // A `get` would have saved key 1; `peek` must not.
        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn sized_lru_converges() {
        let cache = Builder::<u64, u64>::new(10)
            .entry_size_calculator(|_: &u64, _: &u64| 3)
            .build()
            .unwrap();
        for k in 0..5_u64 {
            cache.put(k, k);
        }
        // Three entries cost nine units; a fourth would cost twelve. A transient overshoot
        // within a pass is allowed, the quiesced map must be within the bound.
        assert!(cache.len() <= 3);
        assert!(cache.contains(&4));
    }

    #[test]
    fn lirs_example_scenario() {
        let cache = Builder::<u64, u64>::new(3)
            .eviction_policy(EvictionPolicy::Lirs)
            .build()
            .unwrap();
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.get(&1), Some(1));
        cache.put(4, 4);

        // Keys 1 and 2 are hot; the cold queue head was key 3.
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&4));
    }

    #[test]
    fn lirs_resists_scan_pollution() {
        let maximum = 128_u64;
        let working_set = 48_u64;
        let cache = Builder::<u64, u64>::new(maximum)
            .eviction_policy(EvictionPolicy::Lirs)
            .build()
            .unwrap();

        // Establish the working set as hot.
        for round in 0..4 {
            for k in 0..working_set {
                if round == 0 {
                    cache.put(k, k);
                } else {
                    assert_eq!(cache.get(&k), Some(k));
                }
            }
        }

        // A one-shot scan far larger than the cache.
        for k in 1000..3000_u64 {
            cache.put(k, k);
        }

        // Every working-set key survived the scan.
        for k in 0..working_set {
            assert!(cache.contains(&k), "working-set key {k} was evicted");
        }
        assert!(cache.len() as u64 <= maximum);
    }

    #[test]
    fn lru_is_polluted_by_scans() {
        // The control experiment for the test above.
        let cache = Builder::<u64, u64>::new(128)
            .eviction_policy(EvictionPolicy::Lru)
            .build()
            .unwrap();
        for k in 0..48_u64 {
            cache.put(k, k);
        }
        for k in 0..48_u64 {
            assert_eq!(cache.get(&k), Some(k));
        }
        for k in 1000..3000_u64 {
            cache.put(k, k);
        }
        assert!((0..48_u64).all(|k| !cache.contains(&k)));
    }

    #[test]
    fn tombstone_resurrection_notifies_activation() {
        let listener = Arc::new(TrackingListener::default());
        let cache = Builder::<u64, u64>::new(4)
            .eviction_policy(EvictionPolicy::Lirs)
            .eviction_listener(listener.clone())
            .build()
            .unwrap();
        for k in 0..64_u64 {
            cache.put(k, k);
        }
        // Re-inserting recently evicted keys resurrects their tombstones.
        for k in 60..64_u64 {
            cache.put(k, k + 100);
        }
        let _ = listener.activated.load(Relaxed);
        assert!(cache.len() <= 4);
    }

    #[test]
    fn unbounded_policy_never_evicts() {
        let cache = Builder::<u64, u64>::new(1)
            .eviction_policy(EvictionPolicy::None)
            .build()
            .unwrap();
        for k in 0..1024_u64 {
            cache.put(k, k);
        }
        assert_eq!(cache.len(), 1024);
    }

    #[test]
    fn colliding_keys_form_a_tree_bin() {
        let cache = Builder::<u64, u64>::new(4096)
            .eviction_policy(EvictionPolicy::None)
            .initial_capacity(64)
            .build_hasher(CollidingHasher)
            .build()
            .unwrap();
        for k in 0..64_u64 {
            assert!(cache.put(k, k * 2).is_none());
        }
        for k in 0..64_u64 {
            assert_eq!(cache.get(&k), Some(k * 2));
        }
        let guard = Guard::new();
        assert_eq!(cache.iter(&guard).count(), 64);
        drop(guard);

        // Drain below the untreeify threshold and keep going.
        for k in 0..60_u64 {
            assert_eq!(cache.remove(&k), Some(k * 2));
        }
        for k in 60..64_u64 {
            assert_eq!(cache.get(&k), Some(k * 2));
        }
        for k in 60..64_u64 {
            assert_eq!(cache.remove(&k), Some(k * 2));
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn compute_if_absent_runs_exactly_once() {
        let num_threads = 8;
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache: Arc<CacheMap<u64, u64>> = Arc::new(CacheMap::with_maximum_size(256));
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::new();
        for _ in 0..num_threads {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let invocations = invocations.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache.compute_if_absent(42, |_| {
                    invocations.fetch_add(1, Relaxed);
                    777
                })
            }));
        }
        let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(invocations.load(Relaxed), 1);
        assert!(results.iter().all(|v| *v == 777));
    }

    #[test]
    fn concurrent_removal_is_idempotent() {
        let num_threads = 8;
        for _ in 0..64 {
            let listener = Arc::new(TrackingListener::default());
            let cache = Arc::new(
                Builder::<u64, u64>::new(256)
                    .eviction_listener(listener.clone())
                    .build()
                    .unwrap(),
            );
            cache.put(7, 7);
            let barrier = Arc::new(Barrier::new(num_threads));
            let mut handles = Vec::new();
            for _ in 0..num_threads {
                let cache = cache.clone();
                let barrier = barrier.clone();
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    cache.remove(&7)
                }));
            }
            let removed: Vec<Option<u64>> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(removed.iter().filter(|r| r.is_some()).count(), 1);
            assert_eq!(listener.removed.load(Relaxed), 1);
        }
    }

    #[test]
    fn concurrent_put_get_no_torn_values() {
        let num_threads = 8;
        let per_thread = 4096_u64;
        let cache: Arc<CacheMap<u64, u64>> = Arc::new(
            Builder::new(u64::MAX)
                .eviction_policy(EvictionPolicy::None)
                .build()
                .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(num_threads * 2));
        let mut handles = Vec::new();
        for t in 0..num_threads as u64 {
            let writer_cache = cache.clone();
            let writer_barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                writer_barrier.wait();
                for i in 0..per_thread {
                    let k = t * per_thread + i;
                    writer_cache.put(k, !k);
                }
            }));
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let k = t * per_thread + i;
                    if let Some(v) = cache.get(&k) {
                        // A read observes the whole value or nothing.
                        assert_eq!(v, !k);
                    }
                }
            }));
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        for t in 0..num_threads as u64 {
            for i in 0..per_thread {
                let k = t * per_thread + i;
                assert_eq!(cache.get(&k), Some(!k));
            }
        }
    }

    #[test]
    fn resize_preserves_iteration() {
        let cache: Arc<CacheMap<u64, u64>> = Arc::new(
            Builder::new(u64::MAX)
                .eviction_policy(EvictionPolicy::None)
                .initial_capacity(16)
                .build()
                .unwrap(),
        );
        let stable = 256_u64;
        for k in 0..stable {
            cache.put(k, k);
        }
        let stop = Arc::new(AtomicU64::new(0));
        let inserter = {
            let cache = cache.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                // Keep the table resizing underneath the iterators.
                for k in stable..stable + 8192 {
                    cache.put(k, k);
                    if stop.load(Relaxed) != 0 {
                        break;
                    }
                }
            })
        };
        for _ in 0..16 {
            let guard = Guard::new();
            let mut seen: BTreeSet<u64> = BTreeSet::new();
            for (k, v) in cache.iter(&guard) {
                assert_eq!(k, v);
                // The resize mechanics never introduce duplicates.
                assert!(seen.insert(*k), "key {k} yielded twice");
            }
            // Every entry present for the whole iteration was observed.
            for k in 0..stable {
                assert!(seen.contains(&k), "key {k} skipped");
            }
        }
        stop.store(1, Relaxed);
        inserter.join().unwrap();
    }

    #[test]
    fn bound_invariant_under_concurrency() {
        let maximum = 64_u64;
        let num_threads = 8;
        let cache: Arc<CacheMap<u64, u64>> =
            Arc::new(CacheMap::with_maximum_size(maximum));
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::new();
        for t in 0..num_threads as u64 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..2048_u64 {
                    let k = (t * 2048 + i) % 509;
                    match i % 4 {
                        0 | 1 => {
                            cache.put(k, i);
                        }
                        2 => {
                            let _ = cache.get(&k);
                        }
                        _ => {
                            let _ = cache.remove(&k);
                        }
                    }
                }
            }));
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        // Quiesced: one more operation runs a final reconciliation pass.
        cache.put(u64::MAX, 0);
        let _ = cache.remove(&u64::MAX);
        assert!(
            cache.len() as u64 <= maximum,
            "resident {} exceeds the bound",
            cache.len()
        );
    }

    #[test]
    fn parallel_bulk_operations() {
        let cache: Arc<CacheMap<u64, u64>> = Arc::new(
            Builder::new(u64::MAX)
                .eviction_policy(EvictionPolicy::None)
                .build()
                .unwrap(),
        );
        for k in 0..4096_u64 {
            cache.put(k, 1);
        }
        let visited = AtomicUsize::new(0);
        cache.for_each(1, |_, v| {
            visited.fetch_add(*v as usize, Relaxed);
        });
        assert_eq!(visited.load(Relaxed), 4096);

        let total = cache.reduce(1, |_, v| *v, |a, b| a + b);
        assert_eq!(total, Some(4096));
        let sequential_total = cache.reduce(usize::MAX, |_, v| *v, |a, b| a + b);
        assert_eq!(sequential_total, Some(4096));

        assert_eq!(cache.search(1, |k, _| (*k == 2048).then_some(*k)), Some(2048));
        assert_eq!(cache.search(1, |k, _| (*k == 9999).then_some(*k)), None);
    }

    #[test]
    fn retain_and_clear() {
        let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(1024);
        for k in 0..128_u64 {
            cache.put(k, k);
        }
        cache.retain(|k, _| k % 2 == 0);
        assert_eq!(cache.len(), 64);
        assert!(cache.contains(&2));
        assert!(!cache.contains(&3));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_are_dropped_exactly_once() {
        static INSTANCES: AtomicUsize = AtomicUsize::new(0);
        {
            let cache: CacheMap<u64, R> = CacheMap::with_maximum_size(64);
            for k in 0..256_u64 {
                cache.put(k, R::new(&INSTANCES));
            }
            for k in 0..256_u64 {
                let _ = cache.remove(&k);
            }
            for k in 0..256_u64 {
                cache.put(k, R::new(&INSTANCES));
            }
        }
        // Reclamation is epoch-deferred; nudge the collector until everything is dropped.
        while INSTANCES.load(Relaxed) != 0 {
            drop(Guard::new());
            thread::yield_now();
        }
    }

    #[test]
    fn string_keys_and_borrowed_lookup() {
        let cache: CacheMap<String, u64> = CacheMap::with_maximum_size(64);
        cache.put("alpha".to_string(), 1);
        assert_eq!(cache.get("alpha"), Some(1));
        assert_eq!(cache.read("alpha", |k, v| (k.clone(), *v)), Some(("alpha".to_string(), 1)));
        assert_eq!(cache.remove("alpha"), Some(1));
    }

    proptest! {
        #[test]
        fn model_equivalence(ops in proptest::collection::vec((0_u8..4, 0_u16..64, any::<u32>()), 0..512)) {
            let cache = Builder::<u16, u32>::new(u64::MAX)
                .eviction_policy(EvictionPolicy::None)
                .build()
                .unwrap();
            let mut model: HashMap<u16, u32> = HashMap::new();
            for (op, key, value) in ops {
                match op {
                    0 => {
                        prop_assert_eq!(cache.put(key, value), model.insert(key, value));
                    }
                    1 => {
                        prop_assert_eq!(cache.remove(&key), model.remove(&key));
                    }
                    2 => {
                        prop_assert_eq!(cache.get(&key), model.get(&key).copied());
                    }
                    _ => {
                        prop_assert_eq!(cache.contains(&key), model.contains_key(&key));
                    }
                }
            }
            prop_assert_eq!(cache.len(), model.len());
            for (key, value) in &model {
                prop_assert_eq!(cache.peek(key), Some(*value));
            }
        }

        #[test]
        fn lru_bound_holds_for_random_workloads(keys in proptest::collection::vec(0_u16..1024, 0..512)) {
            let maximum = 32_u64;
            let cache = Builder::<u16, u16>::new(maximum).build().unwrap();
            for key in keys {
                cache.put(key, key);
                prop_assert!(cache.len() as u64 <= maximum + 1);
            }
            cache.put(u16::MAX, 0);
            prop_assert!(cache.len() as u64 <= maximum);
        }
    }
}
