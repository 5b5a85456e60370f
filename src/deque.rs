//! A lock-free doubly linked deque that only supports linking at the tail, unlinking an
//! arbitrary node, and polling at the head.
//!
//! The deque is the ordering spine of the eviction policies: it is never iterated as a
//! collection, instead callers keep [`NodeRef`] handles to the nodes they linked and remove or
//! reposition them directly. Nodes live in a growable slab of fixed-size segments and are
//! addressed by `(slot, generation)` words; recycling a slot bumps its generation so that any
//! stale handle or in-flight traversal detects reuse and restarts from an end instead of
//! touching the reused slot.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64};

use sdd::{AtomicShared, Guard, Shared, Tag};

/// A packed link word: the upper half is the target slot's expected generation, the lower half
/// the slot id.
type Link = u64;

/// Slot id representing the absence of a link.
const NIL: u32 = u32::MAX;

/// A null link.
const NIL_LINK: Link = NIL as Link;

/// The number of dead nodes an unlink tolerates before it starts squeezing them out.
const HOPS: usize = 2;

/// A handle to a deque node.
///
/// Handles are compared by callers to detect that a node was concurrently repositioned: a
/// handle taken before the node was unlinked and relinked no longer compares equal to the
/// current one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NodeRef(Link);

#[inline]
const fn link(id: u32, generation: u32) -> Link {
    ((generation as Link) << 32) | id as Link
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn link_id(link: Link) -> u32 {
    link as u32
}

#[inline]
const fn link_generation(link: Link) -> u32 {
    (link >> 32) as u32
}

/// A deque node slot.
struct Slot<T> {
    /// The slot's current generation; a link only resolves while its generation matches.
    generation: AtomicU32,
    /// Free list chaining.
    free_next: AtomicU32,
    /// Link to the predecessor.
    prev: AtomicU64,
    /// Link to the successor.
    next: AtomicU64,
    /// The item; cleared by a compare-and-exchange when the node is claimed.
    item: AtomicShared<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            free_next: AtomicU32::new(NIL),
            prev: AtomicU64::new(NIL_LINK),
            next: AtomicU64::new(NIL_LINK),
            item: AtomicShared::null(),
        }
    }
}

/// The result of resolving a [`Link`].
enum Resolved<'d, T> {
    /// The link is null.
    Null,
    /// The target slot was recycled; the holder must restart from an end.
    Stale,
    /// The target slot is still at the expected generation.
    Live(&'d Slot<T>),
}

/// The number of slots in the first segment; segment `i` holds `SEGMENT_0_LEN << i` slots.
const SEGMENT_0_LEN: u32 = 64;
const NUM_SEGMENTS: usize = 25;

/// A growable slab of [`Slot`] instances with a lock-free free list.
struct SlotArena<T> {
    segments: [AtomicPtr<Slot<T>>; NUM_SEGMENTS],
    /// Bump allocation cursor used when the free list is empty.
    next_slot: AtomicU32,
    /// Free list head: the upper half is a modification counter, the lower half a slot id.
    free_head: AtomicU64,
    /// The segments are owned through raw pointers; restore the slots' auto traits.
    _owned: std::marker::PhantomData<Box<[Slot<T>]>>,
}

impl<T> SlotArena<T> {
    fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            next_slot: AtomicU32::new(0),
            free_head: AtomicU64::new(NIL_LINK),
            _owned: std::marker::PhantomData,
        }
    }

    /// Maps a slot id to its segment index, offset, and segment length.
    #[inline]
    fn locate(id: u32) -> (usize, usize) {
        let adjusted = id + SEGMENT_0_LEN;
        let segment = (31 - adjusted.leading_zeros()) as usize - SEGMENT_0_LEN.trailing_zeros() as usize;
        let offset = adjusted as usize - (SEGMENT_0_LEN as usize) * (1_usize << segment);
        (segment, offset)
    }

    /// Returns a reference to the slot; the segment must have been allocated.
    #[inline]
    fn slot(&self, id: u32) -> &Slot<T> {
        let (segment, offset) = Self::locate(id);
        let base = self.segments[segment].load(Acquire);
        debug_assert!(!base.is_null());
        unsafe { &*base.add(offset) }
    }

    /// Allocates a slot, returning its id and current generation.
    fn allocate(&self) -> (u32, u32) {
        let mut free_head = self.free_head.load(Acquire);
        while link_id(free_head) != NIL {
            let id = link_id(free_head);
            let slot = self.slot(id);
            let next = slot.free_next.load(Relaxed);
            let counter = link_generation(free_head).wrapping_add(1);
            match self.free_head.compare_exchange_weak(
                free_head,
                link(next, counter),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => {
                    slot.prev.store(NIL_LINK, Relaxed);
                    slot.next.store(NIL_LINK, Relaxed);
                    return (id, slot.generation.load(Relaxed));
                }
                Err(actual) => free_head = actual,
            }
        }

        let id = self.next_slot.fetch_add(1, Relaxed);
        assert!(id < NIL - 1, "deque slot id space exhausted");
        self.ensure_segment(id);
        (id, self.slot(id).generation.load(Relaxed))
    }

    /// Makes sure the segment covering `id` is allocated.
    fn ensure_segment(&self, id: u32) {
        let (segment, _) = Self::locate(id);
        if !self.segments[segment].load(Acquire).is_null() {
            return;
        }
        let len = (SEGMENT_0_LEN as usize) << segment;
        let boxed: Box<[Slot<T>]> = (0..len).map(|_| Slot::new()).collect();
        let ptr = Box::into_raw(boxed).cast::<Slot<T>>();
        if self.segments[segment]
            .compare_exchange(std::ptr::null_mut(), ptr, AcqRel, Acquire)
            .is_err()
        {
            // Another thread published the segment first.
            drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
        }
    }

    /// Recycles a slot if it is still at the expected generation.
    ///
    /// The generation bump makes every outstanding link to the slot stale, and doubles as the
    /// once-only claim when several sweepers collected the same dead node.
    fn free(&self, target: Link) {
        let id = link_id(target);
        let slot = self.slot(id);
        if slot
            .generation
            .compare_exchange(
                link_generation(target),
                link_generation(target).wrapping_add(1),
                AcqRel,
                Relaxed,
            )
            .is_err()
        {
            return;
        }
        let _ = slot.item.swap((None, Tag::None), Relaxed);
        let mut free_head = self.free_head.load(Acquire);
        loop {
            slot.free_next.store(link_id(free_head), Relaxed);
            let counter = link_generation(free_head).wrapping_add(1);
            match self
                .free_head
                .compare_exchange_weak(free_head, link(id, counter), AcqRel, Acquire)
            {
                Ok(_) => return,
                Err(actual) => free_head = actual,
            }
        }
    }
}

impl<T> Drop for SlotArena<T> {
    fn drop(&mut self) {
        for (segment, slot_ptr) in self.segments.iter().enumerate() {
            let ptr = slot_ptr.load(Relaxed);
            if !ptr.is_null() {
                let len = (SEGMENT_0_LEN as usize) << segment;
                drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
            }
        }
    }
}

/// A position in the deque: a link and the slot it resolved to.
struct Pos<'d, T> {
    link: Link,
    slot: &'d Slot<T>,
}

impl<T> Clone for Pos<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Pos<'_, T> {}

/// The lock-free deque.
///
/// `head` and `tail` are approximate entry points: the true first and last nodes are always
/// reachable from them, but the fields themselves may lag and are repaired opportunistically.
/// Slot zero is a permanent sentinel that is never claimable, which keeps the head side
/// anchored: a stale `head` or `tail` word can always be repaired by pointing it back at the
/// sentinel.
pub(crate) struct Deque<T: 'static> {
    head: AtomicU64,
    tail: AtomicU64,
    arena: SlotArena<T>,
}

impl<T: 'static> Deque<T> {
    pub(crate) fn new() -> Self {
        let arena = SlotArena::new();
        let (id, generation) = arena.allocate();
        debug_assert_eq!(id, 0);
        let sentinel = link(id, generation);
        Self {
            head: AtomicU64::new(sentinel),
            tail: AtomicU64::new(sentinel),
            arena,
        }
    }

    /// The sentinel link: slot zero never changes generation.
    #[inline]
    const fn sentinel() -> Link {
        link(0, 0)
    }

    #[inline]
    fn resolve(&self, target: Link) -> Resolved<'_, T> {
        if link_id(target) == NIL {
            return Resolved::Null;
        }
        let slot = self.arena.slot(link_id(target));
        if slot.generation.load(Acquire) == link_generation(target) {
            Resolved::Live(slot)
        } else {
            Resolved::Stale
        }
    }

    /// Links the item as the last element and returns a handle to the new node.
    pub(crate) fn link_last(&self, item: Shared<T>, _guard: &Guard) -> NodeRef {
        let (id, generation) = self.arena.allocate();
        let slot = self.arena.slot(id);
        let _ = slot.item.swap((Some(item), Tag::None), Relaxed);
        let node = link(id, generation);

        'restart: loop {
            let t = self.tail.load(Acquire);
            let Resolved::Live(tail_slot) = self.resolve(t) else {
                self.repair_tail(t);
                continue;
            };
            let mut p = Pos {
                link: t,
                slot: tail_slot,
            };
            let mut hops = 0_usize;
            loop {
                let q = p.slot.next.load(Acquire);
                if link_id(q) == link_id(p.link) {
                    // The node went off the list.
                    continue 'restart;
                }
                match self.resolve(q) {
                    Resolved::Live(next_slot) => {
                        // Check for tail updates every other hop.
                        hops += 1;
                        if hops % 2 == 0 && self.tail.load(Acquire) != t {
                            continue 'restart;
                        }
                        p = Pos {
                            link: q,
                            slot: next_slot,
                        };
                    }
                    Resolved::Stale => continue 'restart,
                    Resolved::Null => {
                        // `p` is the last node.
                        slot.prev.store(p.link, Relaxed);
                        if p.slot
                            .next
                            .compare_exchange(NIL_LINK, node, AcqRel, Acquire)
                            .is_ok()
                        {
                            // A successful CAS is the linearization point for the node to
                            // become live.
                            if p.link != t {
                                let _ = self.tail.compare_exchange(t, node, AcqRel, Acquire);
                            }
                            return NodeRef(node);
                        }
                        // Lost the CAS race; re-read the successor.
                    }
                }
            }
        }
    }

    /// Claims the item of the referenced node and unlinks it.
    ///
    /// Returns `false` if the node was already claimed, repositioned, or recycled, making
    /// concurrent removals of the same node idempotent.
    pub(crate) fn claim_unlink(&self, node: NodeRef, guard: &Guard) -> bool {
        let Resolved::Live(slot) = self.resolve(node.0) else {
            return false;
        };
        let item_ptr = slot.item.load(Acquire, guard);
        if item_ptr.is_null() {
            return false;
        }
        if slot
            .item
            .compare_exchange(item_ptr, (None, Tag::None), AcqRel, Acquire, guard)
            .is_ok()
        {
            self.unlink(Pos { link: node.0, slot });
            return true;
        }
        false
    }

    /// Claims and unlinks the first node, returning its handle and item.
    pub(crate) fn poll_first_node(&self, guard: &Guard) -> Option<(NodeRef, Shared<T>)> {
        'restart: loop {
            let mut p = self.first()?;
            loop {
                let item_ptr = p.slot.item.load(Acquire, guard);
                if !item_ptr.is_null() {
                    if let Ok((taken, _)) = p.slot.item.compare_exchange(
                        item_ptr,
                        (None, Tag::None),
                        AcqRel,
                        Acquire,
                        guard,
                    ) {
                        let item = unsafe { taken.unwrap_unchecked() };
                        self.unlink(p);
                        return Some((NodeRef(p.link), item));
                    }
                    // Lost the claim race.
                    continue 'restart;
                }
                let q = p.slot.next.load(Acquire);
                if link_id(q) == link_id(p.link) {
                    continue 'restart;
                }
                match self.resolve(q) {
                    Resolved::Null => return None,
                    Resolved::Stale => continue 'restart,
                    Resolved::Live(slot) => p = Pos { link: q, slot },
                }
            }
        }
    }

    /// Returns the first node, repairing `head` on the way.
    ///
    /// The returned node may be logically deleted; `None` is only returned if the deque was
    /// concurrently torn into an unrecoverable state, which the sentinel prevents in practice.
    fn first(&self) -> Option<Pos<'_, T>> {
        'restart: loop {
            let h = self.head.load(Acquire);
            let Resolved::Live(head_slot) = self.resolve(h) else {
                self.repair_head(h);
                continue;
            };
            let mut p = Pos {
                link: h,
                slot: head_slot,
            };
            let mut hops = 0_usize;
            loop {
                let q = p.slot.prev.load(Acquire);
                if link_id(q) == link_id(p.link) {
                    continue 'restart;
                }
                match self.resolve(q) {
                    Resolved::Null => {
                        if p.link == h
                            || self.head.compare_exchange(h, p.link, AcqRel, Acquire).is_ok()
                        {
                            return Some(p);
                        }
                        continue 'restart;
                    }
                    Resolved::Stale => continue 'restart,
                    Resolved::Live(prev_slot) => {
                        hops += 1;
                        if hops % 2 == 0 && self.head.load(Acquire) != h {
                            continue 'restart;
                        }
                        p = Pos {
                            link: q,
                            slot: prev_slot,
                        };
                    }
                }
            }
        }
    }

    /// Points a stale `head` back at the permanent sentinel.
    fn repair_head(&self, stale: Link) {
        let _ = self
            .head
            .compare_exchange(stale, Self::sentinel(), AcqRel, Acquire);
    }

    /// Points a stale `tail` back at the permanent sentinel; the next `link_last` walks
    /// forward from there.
    fn repair_tail(&self, stale: Link) {
        let _ = self
            .tail
            .compare_exchange(stale, Self::sentinel(), AcqRel, Acquire);
    }

    /// Moves `head` to the current first node.
    fn update_head(&self) {
        let _ = self.first();
    }

    /// Moves `tail` to the current last node.
    fn update_tail(&self) {
        'restart: loop {
            let t = self.tail.load(Acquire);
            let Resolved::Live(tail_slot) = self.resolve(t) else {
                self.repair_tail(t);
                continue;
            };
            let mut p = Pos {
                link: t,
                slot: tail_slot,
            };
            let mut hops = 0_usize;
            loop {
                let q = p.slot.next.load(Acquire);
                if link_id(q) == link_id(p.link) {
                    continue 'restart;
                }
                match self.resolve(q) {
                    Resolved::Null => {
                        if p.link == t
                            || self.tail.compare_exchange(t, p.link, AcqRel, Acquire).is_ok()
                        {
                            return;
                        }
                        continue 'restart;
                    }
                    Resolved::Stale => continue 'restart,
                    Resolved::Live(next_slot) => {
                        hops += 1;
                        if hops % 2 == 0 && self.tail.load(Acquire) != t {
                            continue 'restart;
                        }
                        p = Pos {
                            link: q,
                            slot: next_slot,
                        };
                    }
                }
            }
        }
    }

    /// Unlinks a node whose item was claimed by the caller.
    ///
    /// The strategy follows the original stripped deque: find the unique active predecessor
    /// and successor of the node, fix their links to point at each other, and, once the
    /// adjacency is re-verified so no active node can reach the dead run anymore, recycle the
    /// dead slots. An unverifiable squeeze leaves the slots dark; a later unlink sweeping the
    /// same region recycles them.
    fn unlink(&self, x: Pos<'_, T>) {
        let prev = x.slot.prev.load(Acquire);
        let next = x.slot.next.load(Acquire);
        match (self.resolve(prev), self.resolve(next)) {
            (Resolved::Null, _) => {
                // Only the sentinel has a null predecessor, and it is never claimed.
            }
            (Resolved::Live(prev_slot), Resolved::Null) => {
                self.unlink_last(
                    x,
                    Pos {
                        link: prev,
                        slot: prev_slot,
                    },
                );
            }
            (Resolved::Stale, _) | (_, Resolved::Stale) => {
                // Another thread already swept the region.
            }
            (Resolved::Live(_), Resolved::Live(_)) => self.unlink_interior(x, prev, next),
        }
    }

    /// Unlinks an interior node.
    fn unlink_interior(&self, x: Pos<'_, T>, prev: Link, next: Link) {
        let mut dead: Vec<Link> = Vec::new();
        let mut hops = 1_usize;

        // Find the active predecessor.
        let mut is_first = false;
        let active_pred;
        let mut p = prev;
        loop {
            let Resolved::Live(slot) = self.resolve(p) else {
                return;
            };
            if !slot.item.is_null(Acquire) {
                active_pred = Pos { link: p, slot };
                break;
            }
            let q = slot.prev.load(Acquire);
            if link_id(q) == NIL {
                if link_id(slot.next.load(Acquire)) == link_id(p) {
                    return;
                }
                active_pred = Pos { link: p, slot };
                is_first = true;
                break;
            }
            if link_id(q) == link_id(p) {
                return;
            }
            dead.push(p);
            p = q;
            hops += 1;
        }

        // Find the active successor.
        let mut is_last = false;
        let active_succ;
        let mut p = next;
        loop {
            let Resolved::Live(slot) = self.resolve(p) else {
                return;
            };
            if !slot.item.is_null(Acquire) {
                active_succ = Pos { link: p, slot };
                break;
            }
            let q = slot.next.load(Acquire);
            if link_id(q) == NIL {
                if link_id(slot.prev.load(Acquire)) == link_id(p) {
                    return;
                }
                active_succ = Pos { link: p, slot };
                is_last = true;
                break;
            }
            if link_id(q) == link_id(p) {
                return;
            }
            dead.push(p);
            p = q;
            hops += 1;
        }

        if hops < HOPS && (is_first || is_last) {
            // Nodes this close to an end are swept by a later removal.
            return;
        }

        // Squeeze out the dead run between the active pair, including `x`.
        self.skip_deleted_successors(active_pred);
        self.skip_deleted_predecessors(active_succ);

        // Recheck the expected state of the pair; only then is the dead run unreachable from
        // any active node and safe to recycle.
        if active_pred.slot.next.load(Acquire) == active_succ.link
            && active_succ.slot.prev.load(Acquire) == active_pred.link
            && if is_first {
                link_id(active_pred.slot.prev.load(Acquire)) == NIL
            } else {
                !active_pred.slot.item.is_null(Acquire)
            }
            && if is_last {
                link_id(active_succ.slot.next.load(Acquire)) == NIL
            } else {
                !active_succ.slot.item.is_null(Acquire)
            }
        {
            self.update_head();
            self.update_tail();
            for d in dead {
                self.arena.free(d);
            }
            self.arena.free(x.link);
        }
    }

    /// Unlinks the last node; the node itself is retained as the tail-side skeleton and is
    /// recycled once later appends make it an interior node.
    fn unlink_last(&self, last: Pos<'_, T>, prev: Pos<'_, T>) {
        let mut dead: Vec<Link> = Vec::new();
        let mut p = prev;
        loop {
            if !p.slot.item.is_null(Acquire) || link_id(p.slot.prev.load(Acquire)) == NIL {
                break;
            }
            let q = p.slot.prev.load(Acquire);
            if link_id(q) == link_id(p.link) {
                return;
            }
            let Resolved::Live(slot) = self.resolve(q) else {
                return;
            };
            dead.push(p.link);
            p = Pos { link: q, slot };
        }
        if dead.is_empty() {
            return;
        }
        if last
            .slot
            .prev
            .compare_exchange(prev.link, p.link, AcqRel, Acquire)
            .is_ok()
        {
            self.skip_deleted_successors(p);
            if link_id(last.slot.next.load(Acquire)) == NIL
                && (link_id(p.slot.prev.load(Acquire)) == NIL || !p.slot.item.is_null(Acquire))
                && p.slot.next.load(Acquire) == last.link
            {
                self.update_head();
                self.update_tail();
                for d in dead {
                    self.arena.free(d);
                }
            }
        }
    }

    /// Repoints `x.prev` past deleted predecessors.
    fn skip_deleted_predecessors(&self, x: Pos<'_, T>) {
        'while_active: loop {
            let prev = x.slot.prev.load(Acquire);
            if link_id(prev) == NIL {
                return;
            }
            let mut p = prev;
            let target = loop {
                let Resolved::Live(slot) = self.resolve(p) else {
                    continue 'while_active;
                };
                if !slot.item.is_null(Acquire) {
                    break p;
                }
                let q = slot.prev.load(Acquire);
                if link_id(q) == NIL {
                    if link_id(slot.next.load(Acquire)) == link_id(p) {
                        continue 'while_active;
                    }
                    break p;
                }
                if link_id(q) == link_id(p) {
                    continue 'while_active;
                }
                p = q;
            };

            if prev == target
                || x.slot
                    .prev
                    .compare_exchange(prev, target, AcqRel, Acquire)
                    .is_ok()
            {
                return;
            }
            if x.slot.item.is_null(Acquire) && link_id(x.slot.next.load(Acquire)) != NIL {
                return;
            }
        }
    }

    /// Repoints `x.next` past deleted successors.
    fn skip_deleted_successors(&self, x: Pos<'_, T>) {
        'while_active: loop {
            let next = x.slot.next.load(Acquire);
            if link_id(next) == NIL {
                return;
            }
            let mut p = next;
            let target = loop {
                let Resolved::Live(slot) = self.resolve(p) else {
                    continue 'while_active;
                };
                if !slot.item.is_null(Acquire) {
                    break p;
                }
                let q = slot.next.load(Acquire);
                if link_id(q) == NIL {
                    if link_id(slot.prev.load(Acquire)) == link_id(p) {
                        continue 'while_active;
                    }
                    break p;
                }
                if link_id(q) == link_id(p) {
                    continue 'while_active;
                }
                p = q;
            };

            if next == target
                || x.slot
                    .next
                    .compare_exchange(next, target, AcqRel, Acquire)
                    .is_ok()
            {
                return;
            }
            if x.slot.item.is_null(Acquire) && link_id(x.slot.prev.load(Acquire)) != NIL {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::{Arc, Barrier};

    #[test]
    fn link_poll_fifo() {
        let deque: Deque<usize> = Deque::new();
        let guard = Guard::new();
        for i in 0..64 {
            deque.link_last(Shared::new(i), &guard);
        }
        for i in 0..64 {
            let (_, item) = deque.poll_first_node(&guard).unwrap();
            assert_eq!(*item, i);
        }
        assert!(deque.poll_first_node(&guard).is_none());
    }

    #[test]
    fn claim_unlink_is_idempotent() {
        let deque: Deque<usize> = Deque::new();
        let guard = Guard::new();
        let first = deque.link_last(Shared::new(1), &guard);
        let second = deque.link_last(Shared::new(2), &guard);
        let third = deque.link_last(Shared::new(3), &guard);

        assert!(deque.claim_unlink(second, &guard));
        assert!(!deque.claim_unlink(second, &guard));
        assert!(deque.claim_unlink(first, &guard));
        assert!(deque.claim_unlink(third, &guard));
        assert!(deque.poll_first_node(&guard).is_none());
    }

    #[test]
    fn relink_changes_handle() {
        let deque: Deque<usize> = Deque::new();
        let guard = Guard::new();
        let node = deque.link_last(Shared::new(7), &guard);
        assert!(deque.claim_unlink(node, &guard));
        let relinked = deque.link_last(Shared::new(7), &guard);
        assert_ne!(node, relinked);
    }

    #[test]
    fn concurrent_link_poll() {
        let deque: Arc<Deque<usize>> = Arc::new(Deque::new());
        let num_threads = 4;
        let per_thread = 1024;
        let polled = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(num_threads * 2));
        let mut handles = Vec::new();
        for t in 0..num_threads {
            let deque_clone = deque.clone();
            let barrier_clone = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier_clone.wait();
                let guard = Guard::new();
                for i in 0..per_thread {
                    deque_clone.link_last(Shared::new(t * per_thread + i), &guard);
                }
            }));
            let deque_clone = deque.clone();
            let barrier_clone = barrier.clone();
            let polled_clone = polled.clone();
            handles.push(std::thread::spawn(move || {
                barrier_clone.wait();
                let guard = Guard::new();
                let mut taken = 0;
                while taken < per_thread {
                    if deque_clone.poll_first_node(&guard).is_some() {
                        taken += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                polled_clone.fetch_add(taken, Relaxed);
            }));
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(polled.load(Relaxed), num_threads * per_thread);
        let guard = Guard::new();
        assert!(deque.poll_first_node(&guard).is_none());
    }
}
