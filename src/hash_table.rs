//! The concurrent table engine: bin array, cooperative resize, and traversal.

pub(crate) mod bin;
pub(crate) mod tree_bin;

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use crate::cache_map::CacheMap;
use crate::eviction::EvictAction;
use crate::exit_guard::ExitGuard;
use crate::Equivalent;
use bin::{Bin, Node, FORWARDED};
use tree_bin::TreeBin;

/// The chain length at which a bin is turned into a tree bin.
pub(crate) const TREEIFY_THRESHOLD: usize = 8;

/// The entry count at which a tree bin is turned back into a plain chain.
pub(crate) const UNTREEIFY_THRESHOLD: usize = 6;

/// The smallest table length at which bins may be treeified; smaller tables grow instead.
pub(crate) const MIN_TREEIFY_CAPACITY: usize = 64;

/// The default table length.
pub(crate) const DEFAULT_CAPACITY: usize = 16;

/// The largest table length.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The number of bins a helper migrates per claim.
const TRANSFER_STRIDE: usize = 16;

/// The number of low bits of the transfer word counting in-flight helpers; the rest is the
/// stride claim cursor.
const TRANSFER_HELPER_BITS: u32 = 16;

/// Spreads the entropy of a hash value into its lower bits before masking by the table length.
#[inline]
pub(crate) const fn spread(hash: u64) -> u64 {
    hash ^ (hash >> 32) ^ (hash >> 16)
}

/// A bin array of power-of-two length, replaced wholesale on resize.
pub(crate) struct Table<K, V> {
    bins: Box<[Bin<K, V>]>,
    /// The successor table, installed when a resize begins; its presence guarantees at most
    /// one resize per table generation.
    next: AtomicShared<Table<K, V>>,
    /// The packed transfer word: stride claim cursor plus in-flight helper count.
    transfer: AtomicU64,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            bins: (0..len).map(|_| Bin::default()).collect(),
            next: AtomicShared::null(),
            transfer: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn index(&self, hash: u64) -> usize {
        hash as usize & (self.bins.len() - 1)
    }

    #[inline]
    pub(crate) fn bin(&self, index: usize) -> &Bin<K, V> {
        &self.bins[index]
    }

    #[inline]
    pub(crate) fn next_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, Table<K, V>> {
        self.next.load(Acquire, guard)
    }

    #[inline]
    fn next_shared(&self, guard: &Guard) -> Option<Shared<Table<K, V>>> {
        self.next.get_shared(Acquire, guard)
    }

    /// The entry count above which the table grows.
    #[inline]
    pub(crate) fn resize_threshold(&self) -> i64 {
        let len = self.bins.len();
        (len - len / 4) as i64
    }
}

impl<K, V, H> CacheMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
    H: BuildHasher,
{
    /// Returns the spread hash of the key.
    #[inline]
    pub(crate) fn hash_key<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        spread(hasher.finish())
    }

    /// Returns a reference to the current table, allocating one if none exists.
    #[inline]
    pub(crate) fn current_table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        let table_ptr = self.array.load(Acquire, guard);
        if let Some(table) = table_ptr.as_ref() {
            return table;
        }
        let new_table = Shared::new(Table::new(self.initial_capacity));
        match self.array.compare_exchange(
            Ptr::null(),
            (Some(new_table), Tag::None),
            AcqRel,
            Acquire,
            guard,
        ) {
            Ok((_, ptr)) | Err((_, ptr)) => unsafe { ptr.as_ref().unwrap_unchecked() },
        }
    }

    /// Adjusts the resident entry count and checks whether the table should grow.
    #[inline]
    pub(crate) fn add_count(&self, delta: i64, guard: &Guard) {
        self.count.add(delta);
        if delta > 0 {
            self.check_resize(guard);
        }
    }

    /// Adjusts the resident entry count without a resize check; used by eviction paths that
    /// only ever shrink the population.
    #[inline]
    pub(crate) fn adjust_count(&self, delta: i64) {
        self.count.add(delta);
    }

    fn check_resize(&self, guard: &Guard) {
        let table = self.current_table(guard);
        if table.next_ptr(guard).is_null()
            && table.len() < MAXIMUM_CAPACITY
            && self.count.sum() >= table.resize_threshold()
        {
            self.start_resize(table, guard);
        }
    }

    /// Installs a doubled successor table; losing the installation race just means helping the
    /// winner.
    pub(crate) fn start_resize(&self, table: &Table<K, V>, guard: &Guard) {
        let new_len = table.len() * 2;
        let new_table = Shared::new(Table::new(new_len));
        if table
            .next
            .compare_exchange(
                Ptr::null(),
                (Some(new_table), Tag::None),
                AcqRel,
                Acquire,
                guard,
            )
            .is_ok()
        {
            self.policy.on_resize(table.len(), new_len);
        }
        self.help_transfer(table, guard);
    }

    /// Migrates bins from the table to its successor, claiming strides of bin indices from a
    /// shared cursor so any number of threads can help; the last finisher swings the map's
    /// array pointer.
    pub(crate) fn help_transfer(&self, table: &Table<K, V>, guard: &Guard) {
        if table.next_ptr(guard).is_null() {
            return;
        }
        let num_bins = table.len();
        loop {
            // Claim a stride, registering as an in-flight helper.
            let mut word = table.transfer.load(Relaxed);
            let claimed = loop {
                let cursor = (word >> TRANSFER_HELPER_BITS) as usize;
                if cursor * TRANSFER_STRIDE >= num_bins {
                    break None;
                }
                match table.transfer.compare_exchange(
                    word,
                    word + (1 << TRANSFER_HELPER_BITS) + 1,
                    AcqRel,
                    Relaxed,
                ) {
                    Ok(_) => break Some(cursor),
                    Err(actual) => word = actual,
                }
            };
            let Some(stride_index) = claimed else { break };

            // The guard rolls the cursor back if migration fails mid-stride, so the bins are
            // re-claimed; on success it deregisters the helper and completes the resize if it
            // was the last one out.
            let mut transfer_guard = ExitGuard::new(false, |success: bool| {
                if success {
                    let word = table.transfer.fetch_sub(1, AcqRel) - 1;
                    if word & ((1 << TRANSFER_HELPER_BITS) - 1) == 0
                        && ((word >> TRANSFER_HELPER_BITS) as usize) * TRANSFER_STRIDE >= num_bins
                    {
                        self.finish_transfer(table, guard);
                    }
                } else {
                    let mut word = table.transfer.load(Relaxed);
                    loop {
                        let new = if ((word >> TRANSFER_HELPER_BITS) as usize) <= stride_index {
                            word - 1
                        } else {
                            ((stride_index as u64) << TRANSFER_HELPER_BITS)
                                | ((word & ((1 << TRANSFER_HELPER_BITS) - 1)) - 1)
                        };
                        match table.transfer.compare_exchange(word, new, AcqRel, Relaxed) {
                            Ok(_) => break,
                            Err(actual) => word = actual,
                        }
                    }
                }
            });

            if let Some(next_table) = table.next_ptr(guard).as_ref() {
                let start = stride_index * TRANSFER_STRIDE;
                for index in start..(start + TRANSFER_STRIDE).min(num_bins) {
                    self.migrate_bin(table, next_table, index, guard);
                }
            }
            *transfer_guard = true;
        }

        // The cursor is exhausted; a late joiner may still be the one to observe completion.
        let word = table.transfer.load(Acquire);
        if word & ((1 << TRANSFER_HELPER_BITS) - 1) == 0
            && ((word >> TRANSFER_HELPER_BITS) as usize) * TRANSFER_STRIDE >= num_bins
        {
            self.finish_transfer(table, guard);
        }
    }

    fn finish_transfer(&self, table: &Table<K, V>, guard: &Guard) {
        let Some(next_shared) = table.next_shared(guard) else {
            return;
        };
        let current = self.array.load(Acquire, guard);
        if std::ptr::eq(current.as_ptr(), table) {
            let _ = self.array.compare_exchange(
                current,
                (Some(next_shared), Tag::None),
                AcqRel,
                Acquire,
                guard,
            );
        }
    }

    /// Migrates one bin, splitting its chain between the two successor bins selected by the
    /// new high bit of the hash.
    fn migrate_bin(
        &self,
        table: &Table<K, V>,
        next_table: &Table<K, V>,
        index: usize,
        guard: &Guard,
    ) {
        let bin = table.bin(index);
        if bin.head_ptr(guard).tag() == FORWARDED {
            return;
        }
        let locker = bin.lock();
        let head = bin.head_ptr(guard);
        if head.tag() == FORWARDED {
            return;
        }
        let bit = table.len() as u64;
        if let Some(first) = bin.head_shared(guard) {
            let (low, high) = if bin.tree_ptr(guard).is_null() {
                self.split_chain(first, bit, guard)
            } else {
                self.split_tree_chain(&first, bit, guard)
            };
            let low_count = Self::chain_len(low.as_ref(), guard);
            let high_count = Self::chain_len(high.as_ref(), guard);
            let low_bin = next_table.bin(index);
            let high_bin = next_table.bin(index + table.len());
            if low_count > TREEIFY_THRESHOLD && next_table.len() >= MIN_TREEIFY_CAPACITY {
                Self::treeify(low_bin, low.as_ref(), guard);
            }
            if high_count > TREEIFY_THRESHOLD && next_table.len() >= MIN_TREEIFY_CAPACITY {
                Self::treeify(high_bin, high.as_ref(), guard);
            }
            low_bin.set_head(low);
            high_bin.set_head(high);
        }
        let _previous = bin.forward();
        drop(locker);
    }

    /// Splits a plain chain, reusing the longest suffix whose entries all land in the same
    /// successor bin and cloning the rest through the eviction policy's entry factory.
    fn split_chain(
        &self,
        first: Shared<Node<K, V>>,
        bit: u64,
        guard: &Guard,
    ) -> (Option<Shared<Node<K, V>>>, Option<Shared<Node<K, V>>>) {
        // Find the last run: the suffix sharing one target bin.
        let mut run_bit = first.hash() & bit;
        let mut last_run = first.clone();
        let mut walker = first.next_shared(guard);
        while let Some(node) = walker {
            let node_bit = node.hash() & bit;
            if node_bit != run_bit {
                run_bit = node_bit;
                last_run = node.clone();
            }
            walker = node.next_shared(guard);
        }
        let mut low;
        let mut high;
        if run_bit == 0 {
            low = Some(last_run.clone());
            high = None;
        } else {
            low = None;
            high = Some(last_run.clone());
        }
        // Clone the prefix, pushing each clone onto its target chain.
        let mut walker = Some(first);
        while let Some(node) = walker {
            if std::ptr::eq(node.as_ptr(), last_run.as_ptr()) {
                break;
            }
            let target = if node.hash() & bit == 0 {
                &mut low
            } else {
                &mut high
            };
            let clone = self.policy.create_entry(
                node.key().clone(),
                node.hash(),
                node.value_shared(guard),
                target.take(),
                Some(node.eviction().clone()),
            );
            *target = Some(clone);
            walker = node.next_shared(guard);
        }
        (low, high)
    }

    /// Splits a tree bin's chain; every entry is cloned since tree bins have no reusable
    /// suffix ordering.
    fn split_tree_chain(
        &self,
        first: &Shared<Node<K, V>>,
        bit: u64,
        guard: &Guard,
    ) -> (Option<Shared<Node<K, V>>>, Option<Shared<Node<K, V>>>) {
        let mut low = None;
        let mut high = None;
        let mut walker = Some(first.clone());
        while let Some(node) = walker {
            let target = if node.hash() & bit == 0 {
                &mut low
            } else {
                &mut high
            };
            let clone = self.policy.create_entry(
                node.key().clone(),
                node.hash(),
                node.value_shared(guard),
                target.take(),
                Some(node.eviction().clone()),
            );
            *target = Some(clone);
            walker = node.next_shared(guard);
        }
        (low, high)
    }

    fn chain_len(chain: Option<&Shared<Node<K, V>>>, guard: &Guard) -> usize {
        let mut len = 0;
        let mut walker = chain.cloned();
        while let Some(node) = walker {
            len += 1;
            walker = node.next_shared(guard);
        }
        len
    }

    /// Builds a tree index over a chain and installs it.
    fn treeify(target: &Bin<K, V>, chain: Option<&Shared<Node<K, V>>>, guard: &Guard) {
        let Some(first) = chain else { return };
        let mut nodes = Vec::new();
        let mut walker = Some(first.clone());
        while let Some(node) = walker {
            walker = node.next_shared(guard);
            nodes.push(node);
        }
        target.set_tree(Some(Shared::new(TreeBin::new(&nodes, guard))));
    }

    /// Turns a bin's chain into a tree bin, or grows the table if it is still small.
    ///
    /// Called after the insert that crossed the threshold released its bin lock, so the lock
    /// is re-acquired here.
    pub(crate) fn treeify_bin(&self, table: &Table<K, V>, index: usize, guard: &Guard) {
        if table.len() < MIN_TREEIFY_CAPACITY {
            if table.next_ptr(guard).is_null() && table.len() < MAXIMUM_CAPACITY {
                self.start_resize(table, guard);
            }
            return;
        }
        let bin = table.bin(index);
        let locker = bin.lock();
        if bin.head_ptr(guard).tag() != FORWARDED && bin.tree_ptr(guard).is_null() {
            Self::treeify(bin, bin.head_shared(guard).as_ref(), guard);
        }
        drop(locker);
    }

    /// Runs the closure with the bin covering `hash` locked in the newest table, mirroring
    /// the locking of the insert path.
    pub(crate) fn with_bin_locked<R>(
        &self,
        hash: u64,
        guard: &Guard,
        f: impl FnOnce() -> R,
    ) -> R {
        loop {
            let mut table = self.current_table(guard);
            loop {
                let bin = table.bin(table.index(hash));
                if bin.head_ptr(guard).tag() == FORWARDED {
                    self.help_transfer(table, guard);
                    if let Some(next_table) = table.next_ptr(guard).as_ref() {
                        table = next_table;
                        continue;
                    }
                }
                let locker = bin.lock();
                if bin.head_ptr(guard).tag() == FORWARDED {
                    drop(locker);
                    break;
                }
                let result = f();
                drop(locker);
                return result;
            }
        }
    }

    /// Removes or nulls out an eviction victim, re-acquiring its bin the same way an insert
    /// does.
    ///
    /// The closure decides, under the bin lock, whether the candidate entry is still the
    /// victim; a concurrent removal or re-insertion makes the eviction a no-op. Policy
    /// callbacks are deliberately not invoked: the policy itself drove this removal.
    pub(crate) fn evict_entry(
        &self,
        key: &K,
        hash: u64,
        decide: impl FnOnce(&Node<K, V>) -> EvictAction,
        guard: &Guard,
    ) -> Option<(K, V)> {
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
            if head.is_null() {
                // The victim is already gone; a reservation also reads as absent.
                return None;
            }
            let locker = bin.lock();
            if bin.head_ptr(guard).tag() == FORWARDED {
                drop(locker);
                continue;
            }
            let Some(node) = find_in_bin(bin, hash, key, guard) else {
                return None;
            };
            let result = match decide(&node) {
                EvictAction::Skip => None,
                EvictAction::NullValue => {
                    let previous = node.swap_value(None);
                    previous.map(|value| (key.clone(), (*value).clone()))
                }
                EvictAction::RemoveEntry => {
                    let previous = node.swap_value(None);
                    detach_entry(bin, &node, guard);
                    previous.map(|value| (key.clone(), (*value).clone()))
                }
            };
            drop(locker);
            if result.is_some() {
                self.adjust_count(-1);
            }
            return result;
        }
    }
}

/// Searches a locked bin for the entry of the key.
pub(crate) fn find_in_bin<K, V, Q>(
    bin: &Bin<K, V>,
    hash: u64,
    key: &Q,
    guard: &Guard,
) -> Option<Shared<Node<K, V>>>
where
    K: 'static,
    V: 'static,
    Q: Equivalent<K> + ?Sized,
{
    if let Some(tree) = bin.tree_ptr(guard).as_ref() {
        return tree.find_locked(hash, key, guard);
    }
    let mut current = bin.head_ptr(guard);
    while let Some(node) = current.as_ref() {
        if node.hash() == hash && key.equivalent(node.key()) {
            return current.get_shared();
        }
        current = node.next_ptr(guard);
    }
    None
}

/// Unlinks the entry from its locked bin, dropping the tree index when it becomes small
/// enough to revert to a plain chain.
///
/// The bin lock must be held.
pub(crate) fn detach_entry<K: 'static, V: 'static>(
    bin: &Bin<K, V>,
    target: &Node<K, V>,
    guard: &Guard,
) {
    if let Some(tree) = bin.tree_ptr(guard).as_ref() {
        if tree.remove(target, guard) {
            bin.set_tree(None);
        }
    }
    let mut prev: Option<Shared<Node<K, V>>> = None;
    let mut current = bin.head_shared(guard);
    while let Some(node) = current {
        if std::ptr::eq(node.as_ptr(), target) {
            let successor = node.next_shared(guard);
            if let Some(prev) = prev {
                prev.set_next(successor);
            } else {
                bin.set_head(successor);
            }
            return;
        }
        current = node.next_shared(guard);
        prev = Some(node);
    }
}

/// Inserts a new entry into a locked bin, returning the resulting chain length.
///
/// The empty-bin transition is a compare-and-exchange because the lock-free first-insert
/// fast path does not take the bin lock; a plain store could overwrite its published entry.
pub(crate) fn insert_into_bin<K: 'static, V: 'static>(
    bin: &Bin<K, V>,
    node: Shared<Node<K, V>>,
    guard: &Guard,
) -> usize {
    if let Some(tree) = bin.tree_ptr(guard).as_ref() {
        node.set_next(bin.head_shared(guard));
        bin.set_head(Some(node.clone()));
        tree.insert(node, guard);
        return 0;
    }
    loop {
        let Some(mut tail) = bin.head_shared(guard) else {
            if bin.try_insert_first(node.clone(), guard) {
                return 1;
            }
            continue;
        };
        let mut chain_len = 2;
        loop {
            match tail.next_shared(guard) {
                Some(next) => {
                    chain_len += 1;
                    tail = next;
                }
                None => {
                    tail.set_next(Some(node));
                    return chain_len;
                }
            }
        }
    }
}

/// A weakly-consistent traverser over the bins of a table, following forwarded bins into the
/// successor table with an explicit save/restore stack so entries split across tables during
/// an in-flight resize are neither skipped nor visited twice.
pub(crate) struct Traverser<'g, K, V> {
    guard: &'g Guard,
    table: &'g Table<K, V>,
    node: Option<&'g Node<K, V>>,
    stack: Vec<Frame<'g, K, V>>,
    index: usize,
    base_index: usize,
    base_limit: usize,
    base_size: usize,
}

struct Frame<'g, K, V> {
    table: &'g Table<K, V>,
    index: usize,
    length: usize,
}

impl<K, V> Clone for Frame<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Frame<'_, K, V> {}

impl<'g, K, V> Traverser<'g, K, V> {
    /// Creates a traverser over the base bin range `[from, limit)` of the given table.
    pub(crate) fn new(
        table: &'g Table<K, V>,
        from: usize,
        limit: usize,
        guard: &'g Guard,
    ) -> Self {
        Self {
            guard,
            table,
            node: None,
            stack: Vec::new(),
            index: from,
            base_index: from,
            base_limit: limit,
            base_size: table.len(),
        }
    }

    /// Advances to the next entry, resident or not.
    pub(crate) fn advance(&mut self) -> Option<&'g Node<K, V>> {
        let mut entry = self
            .node
            .and_then(|node| node.next_ptr(self.guard).as_ref());
        loop {
            if entry.is_some() {
                self.node = entry;
                return entry;
            }
            if self.base_index >= self.base_limit || self.index >= self.table.len() {
                self.node = None;
                return None;
            }
            let n = self.table.len();
            let bin = self.table.bin(self.index);
            let head = bin.head_ptr(self.guard);
            if head.tag() == FORWARDED {
                if let Some(next_table) = self.table.next_ptr(self.guard).as_ref() {
                    self.stack.push(Frame {
                        table: self.table,
                        index: self.index,
                        length: n,
                    });
                    self.table = next_table;
                    continue;
                }
            }
            entry = head.as_ref();
            if self.stack.is_empty() {
                self.index += self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            } else {
                self.recover_state(n);
            }
        }
    }

    /// Pops back to the saved table once both split bins of a forwarded bin were visited.
    fn recover_state(&mut self, mut n: usize) {
        loop {
            let Some(frame) = self.stack.last().copied() else {
                self.index += self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
                return;
            };
            self.index += frame.length;
            if self.index < n {
                return;
            }
            n = frame.length;
            self.index = frame.index;
            self.table = frame.table;
            self.stack.pop();
        }
    }
}
