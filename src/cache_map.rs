//! [`CacheMap`] is a concurrent hash map bounded by a pluggable eviction policy.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Mutex;

use sdd::{AtomicShared, Guard, Shared};

use crate::counter::Counter;
use crate::eviction::lirs::LirsPolicy;
use crate::eviction::lru::LruPolicy;
use crate::eviction::{
    EntrySizeCalculator, EvictionListener, EvictionPolicy, Policy,
};
use crate::exit_guard::ExitGuard;
use crate::hash_table::bin::{Bin, Node, FORWARDED, RESERVED};
use crate::hash_table::{
    detach_entry, find_in_bin, insert_into_bin, Table, Traverser, DEFAULT_CAPACITY,
    MAXIMUM_CAPACITY, TREEIFY_THRESHOLD,
};
use crate::Equivalent;

/// A concurrent hash map that keeps its resident entries within a maximum size by delegating
/// to a pluggable eviction policy.
///
/// ## Structure
///
/// Entries are stored in chains hanging off a power-of-two array of bins. Reads are
/// lock-free; writes synchronize on the one bin they touch. A bin whose chain grows long is
/// indexed by a red-black tree, and the table grows by cooperative migration: any thread
/// observing a resize claims a range of bins and helps move them, so no thread ever blocks on
/// the whole table.
///
/// ## Eviction
///
/// Every mutating operation, and every successful read, lets the configured policy update its
/// recency bookkeeping and then applies any evictions the policy requests. The maximum size
/// is a convergence bound: concurrent inserts may transiently overshoot it, and the following
/// eviction pass brings the map back within the bound.
///
/// # Examples
///
/// ```
/// use capmap::CacheMap;
///
/// let cache: CacheMap<u64, String> = CacheMap::with_maximum_size(256);
///
/// assert!(cache.put(1, "one".to_string()).is_none());
/// assert_eq!(cache.get(&1), Some("one".to_string()));
/// assert_eq!(cache.remove(&1), Some("one".to_string()));
/// assert_eq!(cache.get(&1), None);
/// ```
pub struct CacheMap<K, V, H = RandomState>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    pub(crate) array: AtomicShared<Table<K, V>>,
    pub(crate) count: Counter,
    pub(crate) policy: Policy<K, V>,
    pub(crate) listener: Option<Box<dyn EvictionListener<K, V>>>,
    pub(crate) maximum_size: u64,
    pub(crate) initial_capacity: usize,
    pub(crate) build_hasher: H,
}

/// An error returned when a [`Builder`] is misconfigured.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigError {
    /// The maximum size must be positive.
    ZeroMaximumSize,
    /// An entry size calculator is only supported by the LRU policy.
    SizeCalculatorRequiresLru,
    /// The initial capacity exceeds the largest supported table length.
    InvalidInitialCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroMaximumSize => f.write_str("the maximum size must be positive"),
            Self::SizeCalculatorRequiresLru => {
                f.write_str("an entry size calculator is only supported by the LRU policy")
            }
            Self::InvalidInitialCapacity => {
                f.write_str("the initial capacity exceeds the largest supported table length")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configures and builds a [`CacheMap`].
///
/// # Examples
///
/// ```
/// use capmap::{Builder, EvictionPolicy};
///
/// let cache = Builder::<u64, u64>::new(1024)
///     .initial_capacity(64)
///     .eviction_policy(EvictionPolicy::Lirs)
///     .build()
///     .unwrap();
/// assert_eq!(cache.maximum_size(), 1024);
/// ```
pub struct Builder<K, V, H = RandomState> {
    maximum_size: u64,
    initial_capacity: usize,
    policy: EvictionPolicy,
    size_calculator: Option<Box<dyn EntrySizeCalculator<K, V>>>,
    listener: Option<Box<dyn EvictionListener<K, V>>>,
    build_hasher: H,
}

impl<K, V> Builder<K, V, RandomState> {
    /// Starts building a [`CacheMap`] bounded by `maximum_size` cost units.
    ///
    /// Without an entry size calculator every entry costs one unit, making the bound a
    /// maximum entry count.
    #[must_use]
    pub fn new(maximum_size: u64) -> Self {
        Self {
            maximum_size,
            initial_capacity: DEFAULT_CAPACITY,
            policy: EvictionPolicy::default(),
            size_calculator: None,
            listener: None,
            build_hasher: RandomState::new(),
        }
    }
}

impl<K, V, H> Builder<K, V, H> {
    /// Pre-sizes the table for the expected number of entries.
    #[must_use]
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Selects the eviction policy.
    #[must_use]
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Installs an entry size calculator; LRU only.
    #[must_use]
    pub fn entry_size_calculator<C: EntrySizeCalculator<K, V> + 'static>(
        mut self,
        calculator: C,
    ) -> Self {
        self.size_calculator = Some(Box::new(calculator));
        self
    }

    /// Installs an eviction listener.
    #[must_use]
    pub fn eviction_listener<L: EvictionListener<K, V> + 'static>(mut self, listener: L) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Replaces the hasher.
    #[must_use]
    pub fn build_hasher<H2: BuildHasher>(self, build_hasher: H2) -> Builder<K, V, H2> {
        Builder {
            maximum_size: self.maximum_size,
            initial_capacity: self.initial_capacity,
            policy: self.policy,
            size_calculator: self.size_calculator,
            listener: self.listener,
            build_hasher,
        }
    }
}

impl<K, V, H> Builder<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
    H: BuildHasher,
{
    /// Validates the configuration and builds the [`CacheMap`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the maximum size is zero, a size calculator is combined
    /// with a non-LRU policy, or the initial capacity is out of range.
    pub fn build(self) -> Result<CacheMap<K, V, H>, ConfigError> {
        if self.maximum_size == 0 {
            return Err(ConfigError::ZeroMaximumSize);
        }
        if self.size_calculator.is_some() && self.policy != EvictionPolicy::Lru {
            return Err(ConfigError::SizeCalculatorRequiresLru);
        }
        if self.initial_capacity > MAXIMUM_CAPACITY {
            return Err(ConfigError::InvalidInitialCapacity);
        }
        let policy = match self.policy {
            EvictionPolicy::None => Policy::None,
            EvictionPolicy::Lru => {
                Policy::Lru(LruPolicy::new(self.maximum_size, self.size_calculator))
            }
            EvictionPolicy::Lirs => Policy::Lirs(LirsPolicy::new(self.maximum_size)),
        };
        Ok(CacheMap {
            array: AtomicShared::null(),
            count: Counter::new(),
            policy,
            listener: self.listener,
            maximum_size: self.maximum_size,
            initial_capacity: self
                .initial_capacity
                .max(DEFAULT_CAPACITY)
                .next_power_of_two(),
            build_hasher: self.build_hasher,
        })
    }
}

impl<K, V> CacheMap<K, V, RandomState>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
{
    /// Creates a [`CacheMap`] bounded by `maximum_size` entries with the LRU policy.
    ///
    /// # Panics
    ///
    /// Panics if `maximum_size` is zero.
    #[must_use]
    pub fn with_maximum_size(maximum_size: u64) -> Self {
        assert_ne!(maximum_size, 0, "the maximum size must be positive");
        let Ok(map) = Builder::new(maximum_size).build() else {
            unreachable!()
        };
        map
    }
}

impl<K, V, H> CacheMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
    H: BuildHasher,
{
    /// Returns the configured maximum size.
    #[inline]
    pub fn maximum_size(&self) -> u64 {
        self.maximum_size
    }

    /// Returns the number of resident entries.
    ///
    /// The count is an aggregate of striped counters and therefore approximate while
    /// operations are in flight.
    #[inline]
    #[allow(clippy::cast_sign_loss)]
    pub fn len(&self) -> usize {
        self.count.sum().max(0) as usize
    }

    /// Returns `true` if the map holds no resident entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of bins.
    pub fn capacity(&self) -> usize {
        let guard = Guard::new();
        self.array
            .load(std::sync::atomic::Ordering::Acquire, &guard)
            .as_ref()
            .map_or(self.initial_capacity, Table::len)
    }

    /// Returns the value of the key, promoting the entry's recency.
    ///
    /// # Examples
    ///
    /// ```
    /// use capmap::CacheMap;
    ///
    /// let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(64);
    /// cache.put(1, 10);
    /// assert_eq!(cache.get(&1), Some(10));
    /// assert_eq!(cache.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, value| value.clone())
    }

    /// Reads the entry under a closure without cloning, promoting the entry's recency.
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash_key(key);
        let (node, value) = self.read_entry(key, hash, &guard)?;
        let result = reader(node.key(), &value);
        self.policy.on_hit_read(self, &node, &value, &guard);
        self.run_eviction_pass(&guard);
        Some(result)
    }

    /// Returns the value of the key without any recency bookkeeping.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.peek_with(key, |_, value| value.clone())
    }

    /// Reads the entry under a closure without any recency bookkeeping.
    pub fn peek_with<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash_key(key);
        let (node, value) = self.read_entry(key, hash, &guard)?;
        Some(reader(node.key(), &value))
    }

    /// Returns `true` if the key is resident.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.peek_with(key, |_, _| ()).is_some()
    }

    /// Inserts or replaces the entry, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.upsert(key, value, false)
    }

    /// Inserts the entry unless the key is already resident, in which case the existing value
    /// is returned and the entry's recency is promoted.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        self.upsert(key, value, true)
    }

    /// Removes the entry, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.remove_if(key, |_| true)
    }

    /// Removes the entry if its current value satisfies the condition.
    pub fn remove_if<Q, F: FnOnce(&V) -> bool>(&self, key: &Q, condition: F) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash_key(key);
        let mut removed: Option<(K, V)> = None;
        self.write_entry(hash, &guard, |bin_ctx| {
            let Some(node) = bin_ctx.find(key) else {
                return;
            };
            match node.value_shared(&guard) {
                Some(value) => {
                    if !condition(&value) {
                        return;
                    }
                    let _ = node.swap_value(None);
                    bin_ctx.detach(&node);
                    self.policy.on_remove(&node, &guard);
                    removed = Some((node.key().clone(), (*value).clone()));
                }
                None => {
                    // A non-resident tombstone reads as absent; drop it for hygiene.
                    bin_ctx.detach(&node);
                    self.policy.on_remove(&node, &guard);
                }
            }
        });
        let result = removed.map(|(removed_key, value)| {
            self.adjust_count(-1);
            self.notify_removed(&removed_key);
            value
        });
        self.run_eviction_pass(&guard);
        result
    }

    /// Replaces the value of a resident entry, returning the previous value.
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.replace_if(key, |_| true, value)
    }

    /// Replaces the value of a resident entry if its current value satisfies the condition.
    pub fn replace_if<Q, F: FnOnce(&V) -> bool>(
        &self,
        key: &Q,
        condition: F,
        value: V,
    ) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash_key(key);
        let value_shared = Shared::new(value);
        let mut previous: Option<V> = None;
        self.write_entry(hash, &guard, |bin_ctx| {
            let Some(node) = bin_ctx.find(key) else {
                return;
            };
            let Some(current) = node.value_shared(&guard) else {
                return;
            };
            if condition(&current) {
                let _ = node.swap_value(Some(value_shared.clone()));
                self.policy.on_hit_write(self, &node, &value_shared, &guard);
                previous = Some((*current).clone());
            }
        });
        self.run_eviction_pass(&guard);
        previous
    }

    /// Returns the value of the key, computing and inserting one from the closure if the key
    /// is absent.
    ///
    /// The closure is invoked exactly once across all threads racing on an absent key; the
    /// bin is reserved while the closure runs, so concurrent operations on the same bin wait
    /// instead of inserting a duplicate. The closure must not operate on this map: the bin
    /// lock it runs under is not reentrant.
    ///
    /// # Examples
    ///
    /// ```
    /// use capmap::CacheMap;
    ///
    /// let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(64);
    /// assert_eq!(cache.compute_if_absent(1, |key| key * 10), 10);
    /// assert_eq!(cache.compute_if_absent(1, |_| unreachable!()), 10);
    /// ```
    pub fn compute_if_absent<F: FnOnce(&K) -> V>(&self, key: K, constructor: F) -> V {
        let guard = Guard::new();
        let hash = self.hash_key(&key);
        let mut constructor = Some(constructor);
        let mut result: Option<V> = None;
        let mut inserted = false;
        let mut activated = false;
        self.write_entry_allocating(hash, &guard, |bin_ctx| {
            if let Some(node) = bin_ctx.find(&key) {
                if let Some(current) = node.value_shared(&guard) {
                    self.policy.on_hit_write(self, &node, &current, &guard);
                    result = Some((*current).clone());
                    return;
                }
                // Resurrect the tombstone.
                let constructor = unsafe { constructor.take().unwrap_unchecked() };
                let value_shared = Shared::new(constructor(&key));
                result = Some((*value_shared).clone());
                let _ = node.swap_value(Some(value_shared));
                self.policy.on_miss(&node, &guard);
                inserted = true;
                activated = true;
                return;
            }
            let constructor = unsafe { constructor.take().unwrap_unchecked() };
            let value_shared = Shared::new(constructor(&key));
            result = Some((*value_shared).clone());
            let node =
                self.policy
                    .create_entry(key.clone(), hash, Some(value_shared), None, None);
            bin_ctx.append(node.clone());
            self.policy.on_miss(&node, &guard);
            inserted = true;
        });
        if inserted {
            self.add_count(1, &guard);
        }
        if activated {
            self.notify_activated(&key);
        }
        self.run_eviction_pass(&guard);
        unsafe { result.unwrap_unchecked() }
    }

    /// Updates the value of a resident entry, removing it if the closure returns `None`.
    pub fn compute_if_present<Q, F: FnOnce(&K, &V) -> Option<V>>(
        &self,
        key: &Q,
        remapper: F,
    ) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let hash = self.hash_key(key);
        let mut result: Option<V> = None;
        let mut removed_key: Option<K> = None;
        self.write_entry(hash, &guard, |bin_ctx| {
            let Some(node) = bin_ctx.find(key) else {
                return;
            };
            let Some(current) = node.value_shared(&guard) else {
                return;
            };
            if let Some(new_value) = remapper(node.key(), &current) {
                let value_shared = Shared::new(new_value);
                result = Some((*value_shared).clone());
                let _ = node.swap_value(Some(value_shared.clone()));
                self.policy.on_hit_write(self, &node, &value_shared, &guard);
            } else {
                let _ = node.swap_value(None);
                bin_ctx.detach(&node);
                self.policy.on_remove(&node, &guard);
                removed_key = Some(node.key().clone());
            }
        });
        if let Some(removed_key) = removed_key {
            self.adjust_count(-1);
            self.notify_removed(&removed_key);
        }
        self.run_eviction_pass(&guard);
        result
    }

    /// Updates, inserts, or removes the entry: the closure receives the current value if the
    /// key is resident and decides the new state, `None` meaning absent.
    ///
    /// The closure runs under the entry's bin lock and must not operate on this map.
    pub fn compute<F: FnOnce(&K, Option<&V>) -> Option<V>>(
        &self,
        key: K,
        remapper: F,
    ) -> Option<V> {
        let guard = Guard::new();
        let hash = self.hash_key(&key);
        let mut remapper = Some(remapper);
        let mut result: Option<V> = None;
        let mut inserted = false;
        let mut activated = false;
        let mut removed_key: Option<K> = None;
        self.write_entry_allocating(hash, &guard, |bin_ctx| {
            let remapper = unsafe { remapper.take().unwrap_unchecked() };
            if let Some(node) = bin_ctx.find(&key) {
                let current = node.value_shared(&guard);
                let was_resident = current.is_some();
                match remapper(node.key(), current.as_deref()) {
                    Some(new_value) => {
                        let value_shared = Shared::new(new_value);
                        result = Some((*value_shared).clone());
                        let _ = node.swap_value(Some(value_shared.clone()));
                        if was_resident {
                            self.policy.on_hit_write(self, &node, &value_shared, &guard);
                        } else {
                            self.policy.on_miss(&node, &guard);
                            inserted = true;
                            activated = true;
                        }
                    }
                    None => {
                        if was_resident {
                            let _ = node.swap_value(None);
                            bin_ctx.detach(&node);
                            self.policy.on_remove(&node, &guard);
                            removed_key = Some(node.key().clone());
                        }
                    }
                }
                return;
            }
            if let Some(new_value) = remapper(&key, None) {
                let value_shared = Shared::new(new_value);
                result = Some((*value_shared).clone());
                let node =
                    self.policy
                        .create_entry(key.clone(), hash, Some(value_shared), None, None);
                bin_ctx.append(node.clone());
                self.policy.on_miss(&node, &guard);
                inserted = true;
            }
        });
        if inserted {
            self.add_count(1, &guard);
        }
        if activated {
            self.notify_activated(&key);
        }
        if let Some(removed_key) = removed_key {
            self.adjust_count(-1);
            self.notify_removed(&removed_key);
        }
        self.run_eviction_pass(&guard);
        result
    }

    /// Merges the value into the entry: inserts it if the key is absent, otherwise combines
    /// the current and new values, removing the entry if the combiner returns `None`.
    pub fn merge<F: FnOnce(&V, V) -> Option<V>>(
        &self,
        key: K,
        value: V,
        combiner: F,
    ) -> Option<V> {
        self.compute(key, move |_, current| match current {
            Some(current) => combiner(current, value),
            None => Some(value),
        })
    }

    /// Visits every resident entry sequentially.
    ///
    /// The scan is weakly consistent: entries present for its whole duration are visited
    /// exactly once, concurrent changes may or may not be observed.
    pub fn scan<F: FnMut(&K, &V)>(&self, mut visitor: F) {
        let guard = Guard::new();
        let table = self.current_table(&guard);
        let mut traverser = Traverser::new(table, 0, table.len(), &guard);
        while let Some(node) = traverser.advance() {
            if let Some(value) = node.value_ptr(&guard).as_ref() {
                visitor(node.key(), value);
            }
        }
    }

    /// Retains only the entries the predicate accepts.
    pub fn retain<F: FnMut(&K, &V) -> bool>(&self, mut predicate: F) {
        let guard = Guard::new();
        let table = self.current_table(&guard);
        let mut traverser = Traverser::new(table, 0, table.len(), &guard);
        while let Some(node) = traverser.advance() {
            let retain = node
                .value_ptr(&guard)
                .as_ref()
                .is_none_or(|value| predicate(node.key(), value));
            if !retain {
                self.remove_if(node.key(), |_| true);
            }
        }
        self.run_eviction_pass(&guard);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.retain(|_, _| false);
    }

    /// Returns a weakly-consistent iterator over the resident entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use capmap::epoch::Guard;
    /// use capmap::CacheMap;
    ///
    /// let cache: CacheMap<u64, u64> = CacheMap::with_maximum_size(64);
    /// cache.put(1, 10);
    ///
    /// let guard = Guard::new();
    /// assert_eq!(cache.iter(&guard).count(), 1);
    /// ```
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, K, V> {
        let table = self.current_table(guard);
        Iter {
            traverser: Traverser::new(table, 0, table.len(), guard),
            guard,
        }
    }

    /// Visits every resident entry, splitting the traversal across threads once the map is at
    /// least `parallelism_threshold` entries large.
    pub fn for_each<F>(&self, parallelism_threshold: usize, visitor: F)
    where
        F: Fn(&K, &V) + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        let guard = Guard::new();
        let table = self.current_table(&guard);
        if self.len() < parallelism_threshold.max(1) {
            self.scan(|key, value| visitor(key, value));
            return;
        }
        let num_workers = Self::bulk_workers(table.len());
        let chunk = table.len().div_ceil(num_workers);
        std::thread::scope(|scope| {
            for worker in 0..num_workers {
                let from = worker * chunk;
                let limit = ((worker + 1) * chunk).min(table.len());
                let visitor = &visitor;
                scope.spawn(move || {
                    let worker_guard = Guard::new();
                    let mut traverser = Traverser::new(table, from, limit, &worker_guard);
                    while let Some(node) = traverser.advance() {
                        if let Some(value) = node.value_ptr(&worker_guard).as_ref() {
                            visitor(node.key(), value);
                        }
                    }
                });
            }
        });
    }

    /// Searches the entries for the first closure result, in parallel above the threshold.
    ///
    /// Which matching entry wins under concurrency is unspecified.
    pub fn search<R, F>(&self, parallelism_threshold: usize, matcher: F) -> Option<R>
    where
        F: Fn(&K, &V) -> Option<R> + Sync,
        R: Send,
        K: Send + Sync,
        V: Send + Sync,
    {
        let guard = Guard::new();
        let table = self.current_table(&guard);
        if self.len() < parallelism_threshold.max(1) {
            let mut traverser = Traverser::new(table, 0, table.len(), &guard);
            while let Some(node) = traverser.advance() {
                if let Some(value) = node.value_ptr(&guard).as_ref() {
                    if let Some(result) = matcher(node.key(), value) {
                        return Some(result);
                    }
                }
            }
            return None;
        }
        let num_workers = Self::bulk_workers(table.len());
        let chunk = table.len().div_ceil(num_workers);
        let found = AtomicBool::new(false);
        let result: Mutex<Option<R>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for worker in 0..num_workers {
                let from = worker * chunk;
                let limit = ((worker + 1) * chunk).min(table.len());
                let matcher = &matcher;
                let found = &found;
                let result = &result;
                scope.spawn(move || {
                    let worker_guard = Guard::new();
                    let mut traverser = Traverser::new(table, from, limit, &worker_guard);
                    while let Some(node) = traverser.advance() {
                        if found.load(Relaxed) {
                            return;
                        }
                        if let Some(value) = node.value_ptr(&worker_guard).as_ref() {
                            if let Some(matched) = matcher(node.key(), value) {
                                let mut slot =
                                    result.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                                if slot.is_none() {
                                    *slot = Some(matched);
                                }
                                found.store(true, Relaxed);
                                return;
                            }
                        }
                    }
                });
            }
        });
        result.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Maps and reduces the entries, in parallel above the threshold.
    ///
    /// Concurrent updates during the scan may be partially reflected; there is no cross-key
    /// atomicity.
    pub fn reduce<R, M, F>(&self, parallelism_threshold: usize, mapper: M, reducer: F) -> Option<R>
    where
        M: Fn(&K, &V) -> R + Sync,
        F: Fn(R, R) -> R + Sync,
        R: Send,
        K: Send + Sync,
        V: Send + Sync,
    {
        let guard = Guard::new();
        let table = self.current_table(&guard);
        let fold = |from: usize, limit: usize, fold_guard: &Guard| {
            let mut accumulated: Option<R> = None;
            let mut traverser = Traverser::new(table, from, limit, fold_guard);
            while let Some(node) = traverser.advance() {
                if let Some(value) = node.value_ptr(fold_guard).as_ref() {
                    let mapped = mapper(node.key(), value);
                    accumulated = Some(match accumulated.take() {
                        Some(accumulated) => reducer(accumulated, mapped),
                        None => mapped,
                    });
                }
            }
            accumulated
        };
        if self.len() < parallelism_threshold.max(1) {
            return fold(0, table.len(), &guard);
        }
        let num_workers = Self::bulk_workers(table.len());
        let chunk = table.len().div_ceil(num_workers);
        let result: Mutex<Option<R>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for worker in 0..num_workers {
                let from = worker * chunk;
                let limit = ((worker + 1) * chunk).min(table.len());
                let fold = &fold;
                let result = &result;
                let reducer = &reducer;
                scope.spawn(move || {
                    let worker_guard = Guard::new();
                    if let Some(local) = fold(from, limit, &worker_guard) {
                        let mut slot =
                            result.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        *slot = Some(match slot.take() {
                            Some(accumulated) => reducer(accumulated, local),
                            None => local,
                        });
                    }
                });
            }
        });
        result.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bulk_workers(num_bins: usize) -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(num_bins)
            .max(1)
    }

    /// Locates the entry without any lock.
    fn read_entry<'g, Q>(
        &self,
        key: &Q,
        hash: u64,
        guard: &'g Guard,
    ) -> Option<(Shared<Node<K, V>>, Shared<V>)>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let table_ptr = self
            .array
            .load(std::sync::atomic::Ordering::Acquire, guard);
        let mut table = table_ptr.as_ref()?;
        loop {
            let bin = table.bin(table.index(hash));
            let head = bin.head_ptr(guard);
            if head.tag() == FORWARDED {
                let Some(next_table) = table.next_ptr(guard).as_ref() else {
                    return None;
                };
                table = next_table;
                continue;
            }
            if let Some(tree) = bin.tree_ptr(guard).as_ref() {
                if let Ok(found) = tree.find_optimistic(hash, key, guard) {
                    let node = found?;
                    let value = node.value_shared(guard)?;
                    return Some((node, value));
                }
                // The tree is write-locked; fall back to a linear chain scan.
            }
            let mut current = bin.head_ptr(guard);
            while let Some(node) = current.as_ref() {
                if node.hash() == hash && key.equivalent(node.key()) {
                    let value = node.value_shared(guard)?;
                    let node_shared = current.get_shared()?;
                    return Some((node_shared, value));
                }
                current = node.next_ptr(guard);
            }
            return None;
        }
    }

    /// Inserts or updates the entry.
    fn upsert(&self, key: K, value: V, only_if_absent: bool) -> Option<V> {
        let guard = Guard::new();
        let hash = self.hash_key(&key);
        let value_shared = Shared::new(value);
        let mut previous: Option<V> = None;
        let mut inserted = false;
        let mut activated = false;
        'outer: loop {
            let mut table = self.current_table(&guard);
            loop {
                let index = table.index(hash);
                let bin = table.bin(index);
                let head = bin.head_ptr(&guard);
                if head.tag() == FORWARDED {
                    self.help_transfer(table, &guard);
                    if let Some(next_table) = table.next_ptr(&guard).as_ref() {
                        table = next_table;
                    }
                    continue;
                }
                if head.tag() == RESERVED {
                    // A compute operation owns the bin; wait for it to finish.
                    drop(bin.lock());
                    continue 'outer;
                }
                if head.is_null() {
                    // Lock-free fast path for the first entry of a bin.
                    let node = self.policy.create_entry(
                        key.clone(),
                        hash,
                        Some(value_shared.clone()),
                        None,
                        None,
                    );
                    if bin.try_insert_first(node.clone(), &guard) {
                        self.policy.on_miss(&node, &guard);
                        inserted = true;
                        break 'outer;
                    }
                    continue;
                }
                let locker = bin.lock();
                if bin.head_ptr(&guard).tag() == FORWARDED {
                    drop(locker);
                    continue;
                }
                if let Some(node) = find_in_bin(bin, hash, &key, &guard) {
                    match node.value_shared(&guard) {
                        Some(current) if only_if_absent => {
                            self.policy.on_hit_write(self, &node, &current, &guard);
                            previous = Some((*current).clone());
                        }
                        Some(current) => {
                            let _ = node.swap_value(Some(value_shared.clone()));
                            self.policy.on_hit_write(self, &node, &value_shared, &guard);
                            previous = Some((*current).clone());
                        }
                        None => {
                            // The entry is a non-resident tombstone; this insert resurrects
                            // it.
                            let _ = node.swap_value(Some(value_shared.clone()));
                            self.policy.on_miss(&node, &guard);
                            inserted = true;
                            activated = true;
                        }
                    }
                    drop(locker);
                    break 'outer;
                }
                let node = self.policy.create_entry(
                    key.clone(),
                    hash,
                    Some(value_shared.clone()),
                    None,
                    None,
                );
                let chain_len = insert_into_bin(bin, node.clone(), &guard);
                self.policy.on_miss(&node, &guard);
                inserted = true;
                drop(locker);
                if chain_len >= TREEIFY_THRESHOLD {
                    self.treeify_bin(table, index, &guard);
                }
                break 'outer;
            }
        }
        if inserted {
            self.add_count(1, &guard);
        }
        if activated {
            self.notify_activated(&key);
        }
        self.run_eviction_pass(&guard);
        previous
    }

    /// Runs the closure against the locked bin of the key; absent keys see `find` return
    /// `None`. Does not allocate a table when none exists.
    fn write_entry<F>(&self, hash: u64, guard: &Guard, writer: F)
    where
        F: FnOnce(&mut BinContext<'_, '_, K, V>),
    {
        if self
            .array
            .load(std::sync::atomic::Ordering::Acquire, guard)
            .is_null()
        {
            return;
        }
        'outer: loop {
            let mut table = self.current_table(guard);
            loop {
                let bin = table.bin(table.index(hash));
                let head = bin.head_ptr(guard);
                if head.tag() == FORWARDED {
                    self.help_transfer(table, guard);
                    if let Some(next_table) = table.next_ptr(guard).as_ref() {
                        table = next_table;
                    }
                    continue;
                }
                if head.tag() == RESERVED {
                    drop(bin.lock());
                    continue 'outer;
                }
                let locker = bin.lock();
                if bin.head_ptr(guard).tag() == FORWARDED {
                    drop(locker);
                    continue;
                }
                let mut bin_ctx = BinContext { bin, hash, guard };
                writer(&mut bin_ctx);
                drop(locker);
                return;
            }
        }
    }

    /// Like [`Self::write_entry`], but allocates the table on demand and reserves an empty
    /// bin while the closure runs, so compute-style operations are exactly-once.
    fn write_entry_allocating<F>(&self, hash: u64, guard: &Guard, mut writer: F)
    where
        F: FnMut(&mut BinContext<'_, '_, K, V>),
    {
        'outer: loop {
            let mut table = self.current_table(guard);
            loop {
                let index = table.index(hash);
                let bin = table.bin(index);
                let head = bin.head_ptr(guard);
                if head.tag() == FORWARDED {
                    self.help_transfer(table, guard);
                    if let Some(next_table) = table.next_ptr(guard).as_ref() {
                        table = next_table;
                    }
                    continue;
                }
                if head.tag() == RESERVED {
                    drop(bin.lock());
                    continue 'outer;
                }
                let locker = bin.lock();
                let head = bin.head_ptr(guard);
                if head.tag() == FORWARDED {
                    drop(locker);
                    continue;
                }
                let reserved = head.is_null() && bin.try_reserve(guard);
                if head.is_null() && !reserved {
                    // Lost the bin to a concurrent lock-free insert.
                    drop(locker);
                    continue;
                }
                {
                    // If the user closure panics, the reservation must not outlive it.
                    let mut reservation_guard = ExitGuard::new(reserved, |pending| {
                        if pending {
                            bin.clear_reservation();
                        }
                    });
                    let mut bin_ctx = BinContext { bin, hash, guard };
                    writer(&mut bin_ctx);
                    if reserved && bin.head_ptr(guard).tag() == RESERVED {
                        // Nothing was inserted; restore the empty state.
                        bin.clear_reservation();
                    }
                    *reservation_guard = false;
                }
                drop(locker);
                return;
            }
        }
    }

    /// Runs the policy's eviction pass and notifies the listener of the evicted batch.
    pub(crate) fn run_eviction_pass(&self, guard: &Guard) {
        if !self.policy.needs_eviction_check() {
            return;
        }
        let evicted = self.policy.find_evictions(self, guard);
        if !evicted.is_empty() {
            if let Some(listener) = self.listener.as_ref() {
                listener.on_entries_evicted(&evicted);
            }
        }
    }

    pub(crate) fn notify_chosen_for_eviction(&self, key: &K) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_entry_chosen_for_eviction(key);
        }
    }

    fn notify_activated(&self, key: &K) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_entry_activated(key);
        }
    }

    fn notify_removed(&self, key: &K) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_entry_removed(key);
        }
    }
}

/// A view of a locked bin handed to write closures.
struct BinContext<'b, 'g, K, V> {
    bin: &'b Bin<K, V>,
    hash: u64,
    guard: &'g Guard,
}

impl<K, V> BinContext<'_, '_, K, V>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
{
    fn find<Q>(&self, key: &Q) -> Option<Shared<Node<K, V>>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        find_in_bin(self.bin, self.hash, key, self.guard)
    }

    fn append(&self, node: Shared<Node<K, V>>) {
        if self.bin.head_ptr(self.guard).tag() == RESERVED {
            // Consuming the reservation publishes the entry.
            self.bin.set_head(Some(node));
            return;
        }
        let _ = insert_into_bin(self.bin, node, self.guard);
    }

    fn detach(&self, node: &Node<K, V>) {
        detach_entry(self.bin, node, self.guard);
    }
}

/// A weakly-consistent iterator over the resident entries of a [`CacheMap`].
///
/// Entries present for the iterator's whole lifetime are yielded exactly once; entries added
/// or removed concurrently may or may not be observed. Iteration never fails due to
/// concurrent modification and follows an in-flight resize into the successor table.
pub struct Iter<'g, K, V> {
    traverser: Traverser<'g, K, V>,
    guard: &'g Guard,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.traverser.advance()?;
            if let Some(value) = node.value_ptr(self.guard).as_ref() {
                return Some((node.key(), value));
            }
        }
    }
}

impl<K, V, H> PartialEq for CacheMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone + PartialEq,
    H: BuildHasher,
{
    /// Compares the resident entries of two maps.
    ///
    /// The comparison is only meaningful while neither map is concurrently modified.
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut equal = true;
        self.scan(|key, value| {
            if equal && other.peek_with(key, |_, other_value| other_value == value) != Some(true) {
                equal = false;
            }
        });
        equal
    }
}

impl<K, V, H> Debug for CacheMap<K, V, H>
where
    K: 'static + Clone + Debug + Eq + Hash,
    V: 'static + Clone + Debug,
    H: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.scan(|key, value| {
            let _ = map.entry(key, value);
        });
        map.finish()
    }
}
