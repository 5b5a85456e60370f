//! LIRS (Low Inter-reference Recency Set) eviction.
//!
//! A bounded hot set stays always resident; cold entries are tracked by a queue and evicted
//! from its head. Recency is maintained by a stack: a cold entry re-accessed while still on
//! the stack has a low inter-reference recency and is promoted to hot, demoting the hot entry
//! at the stack bottom. Cold entries evicted from residency while still stacked are kept as
//! non-resident tombstones so a quick re-reference can resurrect them. One-shot scans never
//! enter the hot set, which makes the policy scan-resistant, unlike plain LRU.

use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Mutex;
use std::time::Duration;

use sdd::{Guard, Shared};

use crate::cache_map::CacheMap;
use crate::deque::{Deque, NodeRef};
use crate::eviction::{EvictAction, EvictMeta, SizeAndEvicting};
use crate::hash_table::bin::Node;

/// The fraction of the maximum size dedicated to hot entries.
const HOT_RATE: f64 = 0.95;

/// The recency class of an entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Recency {
    /// A hot, always-resident entry; it is on the stack and never on the queue.
    HotResident,
    /// A cold resident entry, queued for eviction and possibly on the stack.
    ColdResident,
    /// A cold entry evicted from residency but still stacked; its value slot is nulled and
    /// the entry is retained as a tombstone for recency tracking.
    ColdNonResident,
    /// Selected for full eviction; the eviction pass is about to drop the entry.
    Evicting,
    /// Fully evicted; terminal unless the key misses again.
    Evicted,
    /// Removed by a user operation; terminal.
    Removed,
}

/// Per-entry LIRS bookkeeping.
///
/// The key and hash are retained so the eviction pass can re-enter the table the same way an
/// insert does.
pub(crate) struct LirsMeta<K, V> {
    key: K,
    hash: u64,
    core: Mutex<LirsCore>,
    _value: PhantomData<fn() -> V>,
}

struct LirsCore {
    /// `None` until the first miss or hit processes the entry.
    state: Option<Recency>,
    /// Set by the first miss; a subsequent miss observing the flag knows the entry was
    /// concurrently evicted or demoted to non-resident in between.
    created: bool,
    stack_node: Option<NodeRef>,
    queue_node: Option<NodeRef>,
}

impl<K, V> LirsMeta<K, V> {
    pub(crate) fn new(key: K, hash: u64) -> Self {
        Self {
            key,
            hash,
            core: Mutex::new(LirsCore {
                state: None,
                created: false,
                stack_node: None,
                queue_node: None,
            }),
            _value: PhantomData,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LirsCore> {
        self.core
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The LIRS eviction policy.
pub(crate) struct LirsPolicy<K: 'static, V: 'static> {
    /// The LIRS stack `S`: all hot entries, plus every cold or non-resident entry accessed
    /// more recently than the least recent hot entry. Most recent at the tail.
    stack: Deque<LirsMeta<K, V>>,
    /// The LIRS queue `Q`: all cold resident entries, evicted from the head.
    queue: Deque<LirsMeta<K, V>>,
    maximum_size: i64,
    maximum_hot: i64,
    /// The current number of hot entries.
    hot: AtomicI64,
    /// Hot-to-cold demotions owed to keep the hot set bounded, drained by the eviction pass.
    pending_demotions: AtomicI64,
    size: SizeAndEvicting,
}

impl<K, V> LirsPolicy<K, V>
where
    K: 'static + Clone + Eq + std::hash::Hash,
    V: 'static + Clone,
{
    pub(crate) fn new(maximum_size: u64) -> Self {
        let maximum_size = i64::try_from(maximum_size).unwrap_or(i64::MAX);
        Self {
            stack: Deque::new(),
            queue: Deque::new(),
            maximum_size,
            maximum_hot: Self::hot_bound(maximum_size),
            hot: AtomicI64::new(0),
            pending_demotions: AtomicI64::new(0),
            size: SizeAndEvicting::new(),
        }
    }

    /// The hot set bound: `0.95 × maximum`, reduced by one when it would fill the whole
    /// cache, guaranteeing at least one cold slot.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn hot_bound(maximum_size: i64) -> i64 {
        let bound = (HOT_RATE * maximum_size as f64) as i64;
        if bound == maximum_size {
            maximum_size - 1
        } else {
            bound
        }
    }

    /// Makes the entry hot if the hot set has room.
    fn add_to_hot_if_room(
        &self,
        meta: &Shared<LirsMeta<K, V>>,
        core: &mut LirsCore,
        increment_size: bool,
        guard: &Guard,
    ) -> bool {
        let mut hot = self.hot.load(Relaxed);
        while hot < self.maximum_hot {
            match self.hot.compare_exchange(hot, hot + 1, Relaxed, Relaxed) {
                Ok(_) => {
                    if increment_size {
                        self.size.add(1, 0);
                    }
                    core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
                    core.state = Some(Recency::HotResident);
                    return true;
                }
                Err(actual) => hot = actual,
            }
        }
        false
    }

    /// The first touch of a key, or the re-insertion of an evicted one.
    pub(crate) fn on_miss(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        let EvictMeta::Lirs(meta) = node.eviction() else {
            return;
        };
        let mut prune_hot = 0_i64;
        let mut evict_cold = false;
        let mut skip_increment;
        {
            let mut core = meta.lock();
            skip_increment = core.created;
            core.created = true;
            let state = core.state;
            if let Some(state) = state {
                // The entry was hit or evicted before this miss could process.
                if skip_increment {
                    match state {
                        Recency::ColdNonResident => {
                            // Re-reference of a tombstone; the table already restored the
                            // value.
                            if self.add_to_hot_if_room(meta, &mut core, true, guard) {
                                return;
                            }
                            self.promote_cold_to_hot(meta, &mut core, guard);
                            prune_hot = 1;
                            skip_increment = false;
                        }
                        Recency::Evicting => {
                            // Re-inserted while the eviction pass holds a claim: revive as a
                            // cold resident and owe one extra cold eviction.
                            evict_cold = true;
                            core.state = Some(Recency::ColdResident);
                            core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
                            core.queue_node = Some(self.queue.link_last(meta.clone(), guard));
                        }
                        Recency::Removed | Recency::Evicted => {
                            // Both transitions hold the bin lock for their whole duration, so
                            // a miss cannot observe them.
                            debug_assert!(false, "miss on a {state:?} entry");
                        }
                        Recency::HotResident | Recency::ColdResident => (),
                    }
                }
            } else {
                debug_assert!(!skip_increment, "created flag set before the first miss");
                if self.add_to_hot_if_room(meta, &mut core, true, guard) {
                    return;
                }
                let hot_difference = self.hot.load(Relaxed) - self.maximum_hot;
                if hot_difference > 0 {
                    // The bound shrank below the current hot population.
                    prune_hot = hot_difference;
                }
                core.state = Some(Recency::ColdResident);
                // Stack before queue, so a concurrent miss observing the queue node finds
                // the stack node in place.
                core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
                core.queue_node = Some(self.queue.link_last(meta.clone(), guard));
            }
        }
        if prune_hot > 0 {
            self.pending_demotions.fetch_add(prune_hot, Relaxed);
        }
        if !skip_increment || evict_cold {
            // The bound is enforced by the caller's eviction pass.
            self.size.add(1, 0);
        }
    }

    /// Unlinks the entry from both deques and restacks it as hot.
    ///
    /// The metadata lock must be held.
    fn promote_cold_to_hot(
        &self,
        meta: &Shared<LirsMeta<K, V>>,
        core: &mut LirsCore,
        guard: &Guard,
    ) {
        if let Some(stack_node) = core.stack_node.take() {
            self.stack.claim_unlink(stack_node, guard);
        }
        if let Some(queue_node) = core.queue_node.take() {
            self.queue.claim_unlink(queue_node, guard);
        }
        core.state = Some(Recency::HotResident);
        core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
    }

    /// A successful lock-free read.
    ///
    /// Non-resident and in-eviction states require a value mutation, so those retry under the
    /// bin lock exactly like a write; the recency may still change in between, which the
    /// locked handler re-examines.
    pub(crate) fn on_hit_read<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        node: &Shared<Node<K, V>>,
        value: &Shared<V>,
        guard: &Guard,
    ) {
        let EvictMeta::Lirs(meta) = node.eviction() else {
            return;
        };
        let reattempt;
        {
            let mut core = meta.lock();
            match core.state {
                Some(Recency::ColdNonResident | Recency::Evicting) => reattempt = true,
                _ => {
                    reattempt = false;
                    let (demote, evict) =
                        self.on_hit_locked(map, node, value, meta, &mut core, guard);
                    drop(core);
                    self.apply_hit_outcome(demote, evict);
                }
            }
        }
        if reattempt {
            map.with_bin_locked(meta.hash, guard, || {
                self.on_hit_write(map, node, value, guard);
            });
        }
    }

    /// A write to an existing entry, with the bin lock held.
    pub(crate) fn on_hit_write<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        node: &Shared<Node<K, V>>,
        value: &Shared<V>,
        guard: &Guard,
    ) {
        let EvictMeta::Lirs(meta) = node.eviction() else {
            return;
        };
        let (demote, evict) = {
            let mut core = meta.lock();
            self.on_hit_locked(map, node, value, meta, &mut core, guard)
        };
        self.apply_hit_outcome(demote, evict);
    }

    fn apply_hit_outcome(&self, demote: bool, evict: bool) {
        if demote {
            self.pending_demotions.fetch_add(1, Relaxed);
        }
        if evict {
            self.size.add(1, 0);
        }
    }

    /// The hit state machine; returns `(demote_hot, evict_cold)`.
    fn on_hit_locked<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        node: &Shared<Node<K, V>>,
        value: &Shared<V>,
        meta: &Shared<LirsMeta<K, V>>,
        core: &mut LirsCore,
        guard: &Guard,
    ) -> (bool, bool) {
        let mut demote = false;
        let mut evict = false;
        let mut state = core.state;
        if state.is_none() {
            // The hit outran the miss; the entry would have become a cold resident, so a
            // promotion with a matching demotion keeps the hot set bounded.
            if self.add_to_hot_if_room(meta, core, false, guard) {
                return (false, false);
            }
            core.state = Some(Recency::HotResident);
            state = core.state;
            demote = true;
        }
        match unsafe { state.unwrap_unchecked() } {
            Recency::HotResident => {
                // A concurrent pruning may have claimed the stack node; the hit takes
                // precedence by restacking.
                if let Some(stack_node) = core.stack_node.take() {
                    self.stack.claim_unlink(stack_node, guard);
                }
                core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
            }
            Recency::ColdNonResident => {
                if node.value_ptr(guard).is_null() {
                    // The hit revives the tombstone.
                    let _ = node.swap_value(Some(value.clone()));
                    map.adjust_count(1);
                }
                if self.add_to_hot_if_room(meta, core, true, guard) {
                    return (demote, evict);
                }
                self.promote_cold_to_hot(meta, core, guard);
                demote = true;
                evict = true;
            }
            Recency::Evicted => {
                // Resurrecting here would make the value transiently observable as absent;
                // the next miss re-creates the entry instead.
            }
            Recency::Evicting | Recency::ColdResident => {
                if core.state == Some(Recency::Evicting) {
                    // Rescue the entry from the in-flight eviction as a cold resident, and
                    // owe one cold eviction in its place.
                    evict = true;
                    core.state = Some(Recency::ColdResident);
                    if node.value_ptr(guard).is_null() {
                        let _ = node.swap_value(Some(value.clone()));
                        map.adjust_count(1);
                    }
                }
                if core.stack_node.is_some() {
                    // Still stacked: a low inter-reference recency, promote to hot.
                    self.promote_cold_to_hot(meta, core, guard);
                    demote = true;
                } else {
                    // Off the stack: restack and move to the queue tail without promotion.
                    if let Some(queue_node) = core.queue_node.take() {
                        self.queue.claim_unlink(queue_node, guard);
                    }
                    core.stack_node = Some(self.stack.link_last(meta.clone(), guard));
                    core.queue_node = Some(self.queue.link_last(meta.clone(), guard));
                }
            }
            Recency::Removed => (),
        }
        (demote, evict)
    }

    /// A user removal; terminal.
    pub(crate) fn on_remove(&self, node: &Shared<Node<K, V>>, guard: &Guard) {
        let EvictMeta::Lirs(meta) = node.eviction() else {
            return;
        };
        let mut core = meta.lock();
        match core.state {
            Some(Recency::HotResident) => {
                self.hot.fetch_sub(1, Relaxed);
                self.size.add(-1, 0);
                core.state = Some(Recency::Removed);
            }
            Some(Recency::ColdResident) => {
                self.size.add(-1, 0);
                core.state = Some(Recency::Removed);
            }
            Some(Recency::ColdNonResident | Recency::Evicting) | None => {
                // The residency accounting was already released.
                core.state = Some(Recency::Removed);
            }
            Some(Recency::Removed | Recency::Evicted) => (),
        }
        if let Some(queue_node) = core.queue_node.take() {
            self.queue.claim_unlink(queue_node, guard);
        }
        if let Some(stack_node) = core.stack_node.take() {
            self.stack.claim_unlink(stack_node, guard);
        }
    }

    /// Prunes stack-bottom entries until a hot one is removed, demoting it to the cold queue.
    fn demote_lowest_hot(&self, scratch: &mut Vec<Shared<LirsMeta<K, V>>>, guard: &Guard) {
        loop {
            let Some((node_ref, meta)) = self.prune_including_hot(scratch, guard) else {
                return;
            };
            let mut core = meta.lock();
            if core.stack_node != Some(node_ref) {
                // Resurrected by a concurrent hit; demote the next candidate instead.
                continue;
            }
            if core.state != Some(Recency::Removed) {
                core.state = Some(Recency::ColdResident);
                core.stack_node = None;
                core.queue_node = Some(self.queue.link_last(meta.clone(), guard));
                return;
            }
        }
    }

    /// Stack pruning: pops stack-bottom entries until a hot one is popped.
    ///
    /// Pruned cold residents stay on the queue; pruned non-resident tombstones lose their last
    /// anchor and are collected into `scratch` for the caller to drop from the table.
    fn prune_including_hot(
        &self,
        scratch: &mut Vec<Shared<LirsMeta<K, V>>>,
        guard: &Guard,
    ) -> Option<(NodeRef, Shared<LirsMeta<K, V>>)> {
        loop {
            let Some((node_ref, meta)) = self.stack.poll_first_node(guard) else {
                // A negative hot count means a concurrent removal drained the cache; give the
                // owed demotion back instead of spinning for a hot entry that no longer
                // exists.
                let mut hot = self.hot.load(Relaxed);
                while hot < 0 {
                    match self.hot.compare_exchange(hot, hot + 1, Relaxed, Relaxed) {
                        Ok(_) => return None,
                        Err(actual) => hot = actual,
                    }
                }
                continue;
            };
            let mut core = meta.lock();
            if core.stack_node != Some(node_ref) {
                continue;
            }
            match core.state {
                Some(Recency::HotResident) => {
                    // The stack node is left in place; the caller re-validates it under the
                    // metadata lock before demoting.
                    drop(core);
                    return Some((node_ref, meta));
                }
                Some(Recency::ColdNonResident) => {
                    // No longer on the queue or the stack: effectively gone, but the
                    // tombstone entry still has to be dropped from the table.
                    core.state = Some(Recency::Evicting);
                    core.stack_node = None;
                    scratch.push(meta.clone());
                }
                Some(Recency::ColdResident) => {
                    // Stays on the queue.
                    core.stack_node = None;
                }
                Some(Recency::Removed | Recency::Evicting | Recency::Evicted) | None => (),
            }
        }
    }

    /// Drains owed demotions, then evicts cold entries from the queue head until the size
    /// reservation is covered, and finally applies each eviction under the victim's bin lock.
    pub(crate) fn find_evictions<H: BuildHasher>(
        &self,
        map: &CacheMap<K, V, H>,
        guard: &Guard,
    ) -> Vec<(K, V)> {
        let mut demotions = self.pending_demotions.load(Relaxed);
        while demotions > 0 {
            match self
                .pending_demotions
                .compare_exchange(demotions, 0, Relaxed, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => demotions = actual,
            }
        }
        let mut scratch = Vec::new();
        for _ in 0..demotions.max(0) {
            self.demote_lowest_hot(&mut scratch, guard);
        }

        let evict_count = self.size.reserve_surplus(self.maximum_size);
        if evict_count == 0 && scratch.is_empty() {
            return Vec::new();
        }

        let mut victims: Vec<Shared<LirsMeta<K, V>>> = Vec::new();
        let mut evicted_values = evict_count;
        let mut reservation = evict_count;
        let mut selected = 0;
        while selected < evict_count {
            let polled = self.queue.poll_first_node(guard);
            let Some((node_ref, meta)) = polled else {
                let (size, evicting) = self.size.load();
                if size - evicting < self.maximum_size {
                    // A concurrent removal already freed the space this reservation was
                    // supposed to reclaim.
                    self.size.add(0, -1);
                    evicted_values -= 1;
                    reservation -= 1;
                    selected += 1;
                    continue;
                }
                // A promotion is mid-flight between unlinking the demoted hot entry and
                // re-queueing it as cold; wait out the window.
                std::thread::park_timeout(Duration::from_millis(10));
                continue;
            };
            let mut core = meta.lock();
            if core.queue_node != Some(node_ref) {
                continue;
            }
            core.queue_node = None;
            match core.state {
                Some(Recency::ColdResident) => {
                    if core.stack_node.is_some() {
                        // Still stacked: keep the entry as a recency tombstone.
                        core.state = Some(Recency::ColdNonResident);
                    } else {
                        core.state = Some(Recency::Evicting);
                    }
                    drop(core);
                    victims.push(meta);
                    selected += 1;
                }
                Some(Recency::Removed) => {
                    // Removed, not evicted: no residency was freed by this pass.
                    evicted_values -= 1;
                    selected += 1;
                }
                _ => (),
            }
        }
        self.size.add(-evicted_values, -reservation);

        victims.extend(scratch);

        let mut evicted = Vec::new();
        for meta in victims {
            let state = meta.lock().state;
            if !matches!(
                state,
                Some(Recency::Evicting | Recency::ColdNonResident)
            ) {
                continue;
            }
            map.notify_chosen_for_eviction(&meta.key);
            // Re-acquire the bin lock the same way an insert does, so a write racing the
            // eviction is never lost.
            let removed = map.evict_entry(
                &meta.key,
                meta.hash,
                |candidate| {
                    let EvictMeta::Lirs(current) = candidate.eviction() else {
                        return EvictAction::Skip;
                    };
                    if !std::ptr::eq(current.as_ptr(), meta.as_ptr()) {
                        return EvictAction::Skip;
                    }
                    let mut core = meta.lock();
                    match core.state {
                        Some(Recency::Evicting) => {
                            core.state = Some(Recency::Evicted);
                            EvictAction::RemoveEntry
                        }
                        Some(Recency::ColdNonResident) => EvictAction::NullValue,
                        _ => EvictAction::Skip,
                    }
                },
                guard,
            );
            if let Some(pair) = removed {
                evicted.push(pair);
            }
        }
        evicted
    }
}
