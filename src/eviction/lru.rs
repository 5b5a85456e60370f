//! Least-recently-used eviction.
//!
//! One lock-free deque orders the entries by recency; every access unlinks the entry's deque
//! node and relinks a fresh one at the tail. The per-entry metadata is synchronized on its own
//! mutex, never on a bin, so recency bumps do not contend with table operations on other keys.

use std::hash::BuildHasher;
use std::sync::Mutex;

use sdd::{Guard, Shared};

use crate::cache_map::CacheMap;
use crate::deque::{Deque, NodeRef};
use crate::eviction::{EntrySizeCalculator, EvictAction, EvictMeta, SizeAndEvicting};
use crate::hash_table::bin::Node;

/// Per-entry LRU bookkeeping.
pub(crate) struct LruMeta {
    core: Mutex<LruCore>,
}

struct LruCore {
    /// The entry's current deque position.
    node: Option<NodeRef>,
    /// Set exactly once, by whichever of a user removal or an eviction claims the entry first;
    /// the claimant owns the size decrement.
    removed: bool,
    /// The cost charged to the size accounting for this entry.
    charged: i64,
}

impl LruMeta {
    pub(crate) fn new() -> Self {
        Self {
            core: Mutex::new(LruCore {
                node: None,
                removed: false,
                charged: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCore> {
        self.core
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The LRU eviction policy.
pub(crate) struct LruPolicy<K: 'static, V: 'static> {
    deque: Deque<Node<K, V>>,
    size: SizeAndEvicting,
    maximum_size: i64,
    calculator: Option<Box<dyn EntrySizeCalculator<K, V>>>,
}

impl<K, V> LruPolicy<K, V>
where
    K: 'static + Clone + Eq + std::hash::Hash,
    V: 'static + Clone,
{
    pub(crate) fn new(
        maximum_size: u64,
        calculator: Option<Box<dyn EntrySizeCalculator<K, V>>>,
    ) -> Self {
        Self {
            deque: Deque::new(),
            size: SizeAndEvicting::new(),
            maximum_size: i64::try_from(maximum_size).unwrap_or(i64::MAX),
            calculator,
        }
    }

    /// Computes the cost of the entry in its current state.
    fn entry_cost(&self, node: &Node<K, V>, guard: &Guard) -> i64 {
        self.calculator.as_ref().map_or(1, |calculator| {
            node.value_ptr(guard).as_ref().map_or(1, |value| {
                i64::try_from(calculator.entry_size(node.key(), value)).unwrap_or(i64::MAX)
            })
        })
    }

    /// A brand-new entry was inserted.
    pub(crate) fn on_miss(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        let EvictMeta::Lru(meta) = node.eviction() else {
            return;
        };
        let charge = self.entry_cost(node, guard);
        {
            let mut core = meta.lock();
            if core.removed {
                return;
            }
            if let Some(old) = core.node.take() {
                self.deque.claim_unlink(old, guard);
            }
            core.node = Some(self.deque.link_last(node.clone(), guard));
            core.charged = charge;
        }
        self.size.add(charge, 0);
    }

    /// The entry was read or written; relink it at the deque tail.
    pub(crate) fn on_hit(&self, node: &Shared<Node<K, V>>, written: bool, guard: &Guard) {
        let EvictMeta::Lru(meta) = node.eviction() else {
            return;
        };
        let mut delta = 0;
        {
            let mut core = meta.lock();
            if core.removed {
                return;
            }
            if let Some(old) = core.node.take() {
                self.deque.claim_unlink(old, guard);
            }
            core.node = Some(self.deque.link_last(node.clone(), guard));
            if written {
                // Re-charge so a later removal subtracts exactly what was added.
                let charge = self.entry_cost(node, guard);
                delta = charge - core.charged;
                core.charged = charge;
            }
        }
        if delta != 0 {
            self.size.add(delta, 0);
        }
    }

    /// The entry was unlinked by a user operation.
    pub(crate) fn on_remove(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        let EvictMeta::Lru(meta) = node.eviction() else {
            return;
        };
        let charged;
        {
            let mut core = meta.lock();
            if core.removed {
                return;
            }
            core.removed = true;
            charged = core.charged;
            if let Some(old) = core.node.take() {
                self.deque.claim_unlink(old, guard);
            }
        }
        self.size.add(-charged, 0);
    }

    /// Reserves the surplus above the maximum size and evicts from the deque head until the
    /// reservation is covered.
    pub(crate) fn find_evictions<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        guard: &Guard,
    ) -> Vec<(K, V)> {
        let surplus = self.size.reserve_surplus(self.maximum_size);
        if surplus == 0 {
            return Vec::new();
        }
        let mut freed = 0_i64;
        let mut remaining = surplus;
        let mut evicted = Vec::new();
        while remaining > 0 {
            let Some((node_ref, node)) = self.deque.poll_first_node(guard) else {
                // The deque drained before the reservation was covered: concurrent removals
                // already freed the space. The reservation is handed back below and any
                // residual surplus is recovered by the next pass.
                break;
            };
            let EvictMeta::Lru(meta) = node.eviction() else {
                continue;
            };
            let charged;
            {
                let mut core = meta.lock();
                if core.removed || core.node != Some(node_ref) {
                    // Claimed by a remover, or repositioned by a concurrent access after the
                    // poll; this unit of surplus is deferred to the next pass.
                    continue;
                }
                core.removed = true;
                core.node = None;
                charged = core.charged;
            }
            // Once the removed flag is flipped this pass owns the accounting, whether or not
            // the entry is still in the table.
            freed += charged;
            remaining -= charged;
            map.notify_chosen_for_eviction(node.key());
            let removed = map.evict_entry(
                node.key(),
                node.hash(),
                |candidate| {
                    if candidate.eviction().same_record(node.eviction()) {
                        EvictAction::RemoveEntry
                    } else {
                        // The key was removed and re-inserted; the fresh entry is not ours to
                        // evict.
                        EvictAction::Skip
                    }
                },
                guard,
            );
            if let Some(pair) = removed {
                evicted.push(pair);
            }
        }
        self.size.add(-freed, -surplus);
        evicted
    }
}
