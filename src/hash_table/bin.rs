//! A bin is one slot of the table's bin array together with its lock.
//!
//! The bin's state is encoded on the head pointer: a null head with no tag is an empty bin, a
//! plain pointer heads a singly linked chain, the first tag forwards traffic to the successor
//! table during a resize, and the second tag reserves an empty bin for an in-flight atomic
//! compute operation. A bin whose `tree` slot is occupied additionally indexes its chain with
//! a red-black tree; the chain stays intact and remains the source of truth for lock-free
//! readers.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::tree_bin::TreeBin;
use crate::eviction::EvictMeta;
use crate::wait_queue::WaitQueue;

/// An entry of the map.
///
/// The hash and key are immutable; the value slot is mutated in place under the bin lock and
/// read without any lock. A null value is the private absence sentinel distinguishing an entry
/// that exists but is logically removed (a non-resident tombstone) from one that is present.
pub(crate) struct Node<K, V> {
    hash: u64,
    key: K,
    val: AtomicShared<V>,
    next: AtomicShared<Node<K, V>>,
    eviction: EvictMeta<K, V>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(
        hash: u64,
        key: K,
        value: Option<Shared<V>>,
        next: Option<Shared<Node<K, V>>>,
        eviction: EvictMeta<K, V>,
    ) -> Self {
        Self {
            hash,
            key,
            val: value.map_or_else(AtomicShared::null, AtomicShared::from),
            next: next.map_or_else(AtomicShared::null, AtomicShared::from),
            eviction,
        }
    }

    #[inline]
    pub(crate) const fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub(crate) const fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub(crate) const fn eviction(&self) -> &EvictMeta<K, V> {
        &self.eviction
    }

    #[inline]
    pub(crate) fn value_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, V> {
        self.val.load(Acquire, guard)
    }

    #[inline]
    pub(crate) fn value_shared(&self, guard: &Guard) -> Option<Shared<V>> {
        self.val.get_shared(Acquire, guard)
    }

    /// Replaces the value, returning the previous one.
    ///
    /// The bin lock must be held.
    #[inline]
    pub(crate) fn swap_value(&self, value: Option<Shared<V>>) -> Option<Shared<V>> {
        self.val.swap((value, Tag::None), Release).0
    }

    #[inline]
    pub(crate) fn next_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, Node<K, V>> {
        self.next.load(Acquire, guard)
    }

    #[inline]
    pub(crate) fn next_shared(&self, guard: &Guard) -> Option<Shared<Node<K, V>>> {
        self.next.get_shared(Acquire, guard)
    }

    /// Replaces the successor link.
    ///
    /// The bin lock must be held.
    #[inline]
    pub(crate) fn set_next(&self, next: Option<Shared<Node<K, V>>>) {
        let _ = self.next.swap((next, Tag::None), Release);
    }
}

/// The head pointer tag marking a bin that was migrated to the successor table.
pub(crate) const FORWARDED: Tag = Tag::First;

/// The head pointer tag reserving an empty bin for an in-flight compute operation.
pub(crate) const RESERVED: Tag = Tag::Second;

const LOCK: u32 = 1;
const WAITING: u32 = 2;

/// One slot of the bin array.
#[repr(align(64))]
pub(crate) struct Bin<K, V> {
    head: AtomicShared<Node<K, V>>,
    tree: AtomicShared<TreeBin<K, V>>,
    state: AtomicU32,
    wait_queue: WaitQueue,
}

impl<K, V> Default for Bin<K, V> {
    fn default() -> Self {
        Self {
            head: AtomicShared::null(),
            tree: AtomicShared::null(),
            state: AtomicU32::new(0),
            wait_queue: WaitQueue::default(),
        }
    }
}

impl<K, V> Bin<K, V> {
    #[inline]
    pub(crate) fn head_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, Node<K, V>> {
        self.head.load(Acquire, guard)
    }

    #[inline]
    pub(crate) fn head_shared(&self, guard: &Guard) -> Option<Shared<Node<K, V>>> {
        self.head.get_shared(Acquire, guard)
    }

    #[inline]
    pub(crate) fn tree_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, TreeBin<K, V>> {
        self.tree.load(Acquire, guard)
    }

    /// Tries to install the first entry of an empty bin without taking the bin lock.
    ///
    /// Fails if the bin is no longer empty, is reserved, or was forwarded.
    #[inline]
    pub(crate) fn try_insert_first(&self, node: Shared<Node<K, V>>, guard: &Guard) -> bool {
        self.head
            .compare_exchange(Ptr::null(), (Some(node), Tag::None), Release, Relaxed, guard)
            .is_ok()
    }

    /// Tries to reserve an empty bin for a compute operation.
    ///
    /// The bin lock must be held; the reservation tag makes the concurrent lock-free
    /// first-insert fast path fail and fall into the lock path.
    #[inline]
    pub(crate) fn try_reserve(&self, guard: &Guard) -> bool {
        self.head
            .compare_exchange(Ptr::null(), (None, RESERVED), Release, Relaxed, guard)
            .is_ok()
    }

    /// Clears a reservation, restoring the empty state.
    #[inline]
    pub(crate) fn clear_reservation(&self) {
        let _ = self.head.swap((None, Tag::None), Release);
    }

    /// Replaces the head, consuming a reservation if one is present.
    ///
    /// The bin lock must be held.
    #[inline]
    pub(crate) fn set_head(&self, head: Option<Shared<Node<K, V>>>) {
        let _ = self.head.swap((head, Tag::None), Release);
    }

    /// Installs the forwarding marker, returning the previous chain.
    ///
    /// The bin lock must be held; the chain was already migrated to the successor table.
    #[inline]
    pub(crate) fn forward(&self) -> Option<Shared<Node<K, V>>> {
        let _ = self.tree.swap((None, Tag::None), Release);
        self.head.swap((None, FORWARDED), Release).0
    }

    /// Installs or clears the tree index.
    ///
    /// The bin lock must be held.
    #[inline]
    pub(crate) fn set_tree(&self, tree: Option<Shared<TreeBin<K, V>>>) {
        let _ = self.tree.swap((tree, Tag::None), Release);
    }

    /// Acquires the bin lock.
    #[inline]
    pub(crate) fn lock(&self) -> BinGuard<'_, K, V> {
        for _ in 0..16 {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
        loop {
            if let Ok(()) = self.wait_queue.wait_sync(|| {
                let mut state = self.state.load(Relaxed);
                loop {
                    if state & LOCK == 0 {
                        match self.state.compare_exchange(
                            state,
                            state | LOCK,
                            Acquire,
                            Relaxed,
                        ) {
                            Ok(_) => return Ok(()),
                            Err(actual) => state = actual,
                        }
                    } else if state & WAITING == WAITING {
                        return Err(());
                    } else {
                        match self.state.compare_exchange(
                            state,
                            state | WAITING,
                            Relaxed,
                            Relaxed,
                        ) {
                            Ok(_) => return Err(()),
                            Err(actual) => state = actual,
                        }
                    }
                }
            }) {
                return BinGuard { bin: self };
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> Option<BinGuard<'_, K, V>> {
        let state = self.state.load(Relaxed);
        if state & LOCK == 0
            && self
                .state
                .compare_exchange(state, state | LOCK, Acquire, Relaxed)
                .is_ok()
        {
            return Some(BinGuard { bin: self });
        }
        None
    }
}

/// An RAII guard holding a bin lock.
pub(crate) struct BinGuard<'b, K, V> {
    bin: &'b Bin<K, V>,
}

impl<K, V> Drop for BinGuard<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        let previous = self.bin.state.swap(0, Release);
        if previous & WAITING == WAITING {
            self.bin.wait_queue.signal();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn bin_lock_mutual_exclusion() {
        let bin: Arc<Bin<usize, usize>> = Arc::new(Bin::default());
        let critical = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bin_clone = bin.clone();
            let critical_clone = critical.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1024 {
                    let _guard = bin_clone.lock();
                    let value = critical_clone.load(Relaxed);
                    critical_clone.store(value + 1, Relaxed);
                }
            }));
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(critical.load(Relaxed), 8 * 1024);
    }

    #[test]
    fn first_insert_fails_when_reserved() {
        let bin: Bin<usize, usize> = Bin::default();
        let guard = Guard::new();
        {
            let _lock = bin.lock();
            assert!(bin.try_reserve(&guard));
            let node = Shared::new(Node::new(0, 1, None, None, EvictMeta::None));
            assert!(!bin.try_insert_first(node, &guard));
            bin.clear_reservation();
        }
        let node = Shared::new(Node::new(0, 1, None, None, EvictMeta::None));
        assert!(bin.try_insert_first(node, &guard));
    }
}
