//! Eviction policies and the bookkeeping shared between them.
//!
//! The table engine never inspects eviction state itself: it calls into the active policy at
//! fixed points (entry creation, miss, read hit, write hit, removal, resize) and, after every
//! mutating operation, asks the policy whether entries must now be evicted. The policy owns
//! the per-entry metadata and its own ordering structures.

pub(crate) mod lirs;
pub(crate) mod lru;

use std::hash::BuildHasher;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::{AcqRel, Relaxed};

use sdd::{Guard, Shared};

use crate::cache_map::CacheMap;
use crate::hash_table::bin::Node;
use lirs::{LirsMeta, LirsPolicy};
use lru::{LruMeta, LruPolicy};

/// The eviction policy of a [`CacheMap`](crate::CacheMap).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EvictionPolicy {
    /// No eviction: the maximum size is not enforced.
    None,
    /// Least-recently-used eviction.
    #[default]
    Lru,
    /// LIRS (Low Inter-reference Recency Set) eviction.
    ///
    /// LIRS keeps a bounded set of hot entries always resident and tracks cold entries in a
    /// separate queue, which makes it resistant to one-shot scans polluting the cache.
    Lirs,
}

/// Computes the abstract cost of an entry for memory-aware LRU eviction.
///
/// The default cost is one unit per entry. A calculator may instead estimate bytes; the unit
/// is opaque to the map, only its sum is compared against the maximum size.
pub trait EntrySizeCalculator<K, V>: Send + Sync {
    /// Returns the cost of the entry.
    fn entry_size(&self, key: &K, value: &V) -> u64;
}

impl<K, V, F: Fn(&K, &V) -> u64 + Send + Sync> EntrySizeCalculator<K, V> for F {
    #[inline]
    fn entry_size(&self, key: &K, value: &V) -> u64 {
        self(key, value)
    }
}

/// Receives cache lifecycle notifications.
///
/// All callbacks are invoked outside any lock held by the map; a callback is free to call back
/// into the map.
pub trait EvictionListener<K, V>: Send + Sync {
    /// A batch of entries was evicted by the policy.
    fn on_entries_evicted(&self, _evicted: &[(K, V)]) {}

    /// An entry was selected for eviction; it may still escape eviction by a concurrent
    /// access.
    fn on_entry_chosen_for_eviction(&self, _key: &K) {}

    /// A previously evicted entry became resident again.
    fn on_entry_activated(&self, _key: &K) {}

    /// An entry was removed by a user operation.
    fn on_entry_removed(&self, _key: &K) {}
}

/// Per-entry eviction metadata, owned by the policy and opaque to the table.
///
/// The metadata is shared between an entry and its clones made during resize, so a position in
/// an ordering structure survives table reorganization.
pub(crate) enum EvictMeta<K, V> {
    /// No bookkeeping.
    None,
    /// LRU deque position.
    Lru(Shared<LruMeta>),
    /// LIRS recency record.
    Lirs(Shared<LirsMeta<K, V>>),
}

impl<K, V> Clone for EvictMeta<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Lru(meta) => Self::Lru(meta.clone()),
            Self::Lirs(meta) => Self::Lirs(meta.clone()),
        }
    }
}

impl<K, V> EvictMeta<K, V> {
    /// Returns `true` if both refer to the same metadata record.
    #[inline]
    pub(crate) fn same_record(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Lru(left), Self::Lru(right)) => std::ptr::eq(left.as_ptr(), right.as_ptr()),
            (Self::Lirs(left), Self::Lirs(right)) => std::ptr::eq(left.as_ptr(), right.as_ptr()),
            _ => false,
        }
    }
}

/// The resolution an eviction pass reached for a single victim once the victim's bin lock and
/// metadata lock were both acquired.
pub(crate) enum EvictAction {
    /// Unlink the entry from its bin.
    RemoveEntry,
    /// Null the value, keeping the entry as a non-resident tombstone.
    NullValue,
    /// The victim escaped; leave the entry untouched.
    Skip,
}

/// The active eviction policy, dispatched by pattern matching to keep the read path free of
/// virtual calls.
pub(crate) enum Policy<K: 'static, V: 'static> {
    None,
    Lru(LruPolicy<K, V>),
    Lirs(LirsPolicy<K, V>),
}

impl<K, V> Policy<K, V>
where
    K: 'static + Clone + Eq + std::hash::Hash,
    V: 'static + Clone,
{
    /// Creates a new entry wired with fresh or carried-over eviction metadata.
    ///
    /// Called with the bin lock held, or right before a lock-free first-insert.
    pub(crate) fn create_entry(
        &self,
        key: K,
        hash: u64,
        value: Option<Shared<V>>,
        next: Option<Shared<Node<K, V>>>,
        existing_meta: Option<EvictMeta<K, V>>,
    ) -> Shared<Node<K, V>> {
        let meta = existing_meta.unwrap_or_else(|| match self {
            Self::None => EvictMeta::None,
            Self::Lru(_) => EvictMeta::Lru(Shared::new(LruMeta::new())),
            Self::Lirs(_) => EvictMeta::Lirs(Shared::new(LirsMeta::new(key.clone(), hash))),
        });
        Shared::new(Node::new(hash, key, value, next, meta))
    }

    /// Notifies the policy of a brand-new or resurrected entry.
    pub(crate) fn on_miss(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        match self {
            Self::None => (),
            Self::Lru(policy) => policy.on_miss(node, guard),
            Self::Lirs(policy) => policy.on_miss(node, guard),
        }
    }

    /// Notifies the policy of a successful lock-free read.
    ///
    /// Must not be called with a bin lock held: the LIRS policy re-enters the table when the
    /// entry requires a value mutation.
    pub(crate) fn on_hit_read<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        node: &Shared<Node<K, V>>,
        value: &Shared<V>,
        guard: &Guard,
    ) {
        match self {
            Self::None => (),
            Self::Lru(policy) => policy.on_hit(node, false, guard),
            Self::Lirs(policy) => policy.on_hit_read(map, node, value, guard),
        }
    }

    /// Notifies the policy of a write to an existing entry, with the bin lock held.
    pub(crate) fn on_hit_write<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        node: &Shared<Node<K, V>>,
        value: &Shared<V>,
        guard: &Guard,
    ) {
        match self {
            Self::None => (),
            Self::Lru(policy) => policy.on_hit(node, true, guard),
            Self::Lirs(policy) => policy.on_hit_write(map, node, value, guard),
        }
    }

    /// Notifies the policy of an entry removed by a user operation, with the bin lock held.
    pub(crate) fn on_remove(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        match self {
            Self::None => (),
            Self::Lru(policy) => policy.on_remove(node, guard),
            Self::Lirs(policy) => policy.on_remove(node, guard),
        }
    }

    /// Informs the policy of a table resize.
    ///
    /// All built-in policies account abstract per-entry cost rather than table memory, so none
    /// of them reacts; the hook is part of the policy contract nevertheless.
    pub(crate) fn on_resize(&self, _old_capacity: usize, _new_capacity: usize) {}

    /// Finds and applies pending evictions, returning the evicted pairs for listener
    /// notification.
    ///
    /// Never called with a bin lock held: applying an eviction re-enters the table and takes
    /// the victim's bin lock.
    pub(crate) fn find_evictions<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        guard: &Guard,
    ) -> Vec<(K, V)> {
        match self {
            Self::None => Vec::new(),
            Self::Lru(policy) => policy.find_evictions(map, guard),
            Self::Lirs(policy) => policy.find_evictions(map, guard),
        }
    }

    /// Returns `true` if an eviction pass may be required.
    #[inline]
    pub(crate) fn needs_eviction_check(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// An atomic `(size, evicting)` pair packed into a single word: 40 bits of signed size, 24
/// bits of signed in-flight eviction reservation.
///
/// The pair must move together: an eviction pass reserves `size - evicting - maximum` in one
/// step so concurrent passes never evict the same surplus twice.
pub(crate) struct SizeAndEvicting(AtomicI64);

const EVICTING_BITS: u32 = 24;
const EVICTING_MASK: i64 = (1_i64 << EVICTING_BITS) - 1;

impl SizeAndEvicting {
    pub(crate) fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    #[inline]
    fn decode(word: i64) -> (i64, i64) {
        let size = word >> EVICTING_BITS;
        // Sign-extend the low field.
        let evicting = (word << (64 - EVICTING_BITS)) >> (64 - EVICTING_BITS);
        (size, evicting)
    }

    #[inline]
    fn encode(size: i64, evicting: i64) -> i64 {
        assert!(
            size.unsigned_abs() < 1_u64 << 38 && evicting.unsigned_abs() < 1_u64 << 22,
            "size accounting overflow"
        );
        (size << EVICTING_BITS) | (evicting & EVICTING_MASK)
    }

    /// Returns the current `(size, evicting)` pair.
    #[inline]
    pub(crate) fn load(&self) -> (i64, i64) {
        Self::decode(self.0.load(Relaxed))
    }

    /// Atomically adds the deltas to the pair.
    pub(crate) fn add(&self, delta_size: i64, delta_evicting: i64) {
        let mut word = self.0.load(Relaxed);
        loop {
            let (size, evicting) = Self::decode(word);
            let new = Self::encode(size + delta_size, evicting + delta_evicting);
            match self.0.compare_exchange_weak(word, new, AcqRel, Relaxed) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Atomically reserves the surplus above `maximum` for eviction and returns it, or zero if
    /// the size is within bounds.
    pub(crate) fn reserve_surplus(&self, maximum: i64) -> i64 {
        let mut word = self.0.load(Relaxed);
        loop {
            let (size, evicting) = Self::decode(word);
            let surplus = size - evicting - maximum;
            if surplus <= 0 {
                return 0;
            }
            let new = Self::encode(size, evicting + surplus);
            match self.0.compare_exchange_weak(word, new, AcqRel, Relaxed) {
                Ok(_) => return surplus,
                Err(actual) => word = actual,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::SizeAndEvicting;

    #[test]
    fn packed_pair() {
        let pair = SizeAndEvicting::new();
        pair.add(10, 0);
        assert_eq!(pair.load(), (10, 0));
        pair.add(-3, 2);
        assert_eq!(pair.load(), (7, 2));
        pair.add(0, -2);
        assert_eq!(pair.load(), (7, 0));
    }

    #[test]
    fn surplus_reservation() {
        let pair = SizeAndEvicting::new();
        pair.add(12, 0);
        assert_eq!(pair.reserve_surplus(10), 2);
        assert_eq!(pair.reserve_surplus(10), 0);
        assert_eq!(pair.load(), (12, 2));
        pair.add(-2, -2);
        assert_eq!(pair.load(), (10, 0));
    }

    #[test]
    fn negative_size_is_tolerated() {
        let pair = SizeAndEvicting::new();
        pair.add(-5, 0);
        assert_eq!(pair.load(), (-5, 0));
        assert_eq!(pair.reserve_surplus(3), 0);
        pair.add(5, 0);
        assert_eq!(pair.load(), (0, 0));
    }
}
