//! A red-black tree index over an overflow bin.
//!
//! When a bin's chain grows past the treeify threshold, the chain is indexed by a red-black
//! tree ordered by hash with an address tie-break. The chain itself stays intact: lock-free
//! readers and iterators keep walking it, and a reader that finds the tree write-locked falls
//! back to a linear chain scan instead of blocking. Structural mutation happens under the
//! owning bin's lock; rotations additionally take the root latch to exclude in-flight tree
//! readers.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU32};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::bin::Node;
use crate::wait_queue::WaitQueue;
use crate::Equivalent;

/// A node of the red-black tree, referencing one entry of the bin's chain.
pub(crate) struct TreeNode<K, V> {
    entry: Shared<Node<K, V>>,
    parent: AtomicShared<TreeNode<K, V>>,
    left: AtomicShared<TreeNode<K, V>>,
    right: AtomicShared<TreeNode<K, V>>,
    red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    fn new(entry: Shared<Node<K, V>>) -> Self {
        Self {
            entry,
            parent: AtomicShared::null(),
            left: AtomicShared::null(),
            right: AtomicShared::null(),
            red: AtomicBool::new(true),
        }
    }

    #[inline]
    fn entry_ref(&self) -> &Node<K, V> {
        &self.entry
    }

    /// The address-based tie-break for entries sharing a hash value.
    #[inline]
    fn order_key(&self) -> usize {
        self.entry.as_ptr() as usize
    }

    #[inline]
    fn parent_shared(&self, guard: &Guard) -> Option<Shared<TreeNode<K, V>>> {
        self.parent.get_shared(Relaxed, guard)
    }

    #[inline]
    fn left_shared(&self, guard: &Guard) -> Option<Shared<TreeNode<K, V>>> {
        self.left.get_shared(Relaxed, guard)
    }

    #[inline]
    fn right_shared(&self, guard: &Guard) -> Option<Shared<TreeNode<K, V>>> {
        self.right.get_shared(Relaxed, guard)
    }

    #[inline]
    fn set_parent(&self, node: Option<Shared<TreeNode<K, V>>>) {
        let _ = self.parent.swap((node, Tag::None), Release);
    }

    #[inline]
    fn set_left(&self, node: Option<Shared<TreeNode<K, V>>>) {
        let _ = self.left.swap((node, Tag::None), Release);
    }

    #[inline]
    fn set_right(&self, node: Option<Shared<TreeNode<K, V>>>) {
        let _ = self.right.swap((node, Tag::None), Release);
    }

    #[inline]
    fn is_red(&self) -> bool {
        self.red.load(Relaxed)
    }

    #[inline]
    fn set_red(&self, red: bool) {
        self.red.store(red, Relaxed);
    }
}

/// Values of the root latch.
const WRITER: u32 = 1;
const WAITER: u32 = 2;
const READER: u32 = 4;

/// The tree index of an overflow bin.
pub(crate) struct TreeBin<K, V> {
    root: AtomicShared<TreeNode<K, V>>,
    lock_state: AtomicU32,
    wait_queue: WaitQueue,
}

fn ptr_eq<K, V>(a: &Option<Shared<TreeNode<K, V>>>, b: &Option<Shared<TreeNode<K, V>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::eq(a.as_ptr(), b.as_ptr()),
        _ => false,
    }
}

fn node_eq<K, V>(a: &Option<Shared<TreeNode<K, V>>>, b: &TreeNode<K, V>) -> bool {
    a.as_ref().is_some_and(|a| std::ptr::eq(a.as_ptr(), b as *const _))
}

impl<K: 'static, V: 'static> TreeBin<K, V> {
    /// Builds a tree over the given chain entries.
    ///
    /// The bin is not yet published, so no latching is required.
    pub(crate) fn new(chain: &[Shared<Node<K, V>>], guard: &Guard) -> Self {
        let tree = Self {
            root: AtomicShared::null(),
            lock_state: AtomicU32::new(0),
            wait_queue: WaitQueue::default(),
        };
        for entry in chain {
            tree.insert_internal(entry.clone(), guard);
        }
        tree
    }

    /// Inserts an entry into the tree.
    ///
    /// The owning bin's lock must be held, and the entry must not already be present.
    pub(crate) fn insert(&self, entry: Shared<Node<K, V>>, guard: &Guard) {
        self.insert_internal(entry, guard);
    }

    fn insert_internal(&self, entry: Shared<Node<K, V>>, guard: &Guard) {
        let node = Shared::new(TreeNode::new(entry));
        let hash = node.entry_ref().hash();
        let order = node.order_key();

        let Some(mut current) = self.root.get_shared(Relaxed, guard) else {
            node.set_red(false);
            let _ = self.root.swap((Some(node), Tag::None), Release);
            return;
        };
        loop {
            let current_hash = current.entry_ref().hash();
            let go_left = if hash != current_hash {
                hash < current_hash
            } else {
                order < current.order_key()
            };
            let child = if go_left {
                current.left_shared(guard)
            } else {
                current.right_shared(guard)
            };
            if let Some(child) = child {
                current = child;
            } else {
                node.set_parent(Some(current.clone()));
                if go_left {
                    current.set_left(Some(node.clone()));
                } else {
                    current.set_right(Some(node.clone()));
                }
                self.lock_root();
                self.balance_insertion(node, guard);
                self.unlock_root();
                return;
            }
        }
    }

    /// Searches the tree without the bin lock.
    ///
    /// Returns `Err` if a writer holds or awaits the root latch; the caller scans the chain
    /// linearly instead.
    pub(crate) fn find_optimistic<Q>(
        &self,
        hash: u64,
        key: &Q,
        guard: &Guard,
    ) -> Result<Option<Shared<Node<K, V>>>, ()>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let mut state = self.lock_state.load(Acquire);
        loop {
            if state & (WRITER | WAITER) != 0 {
                return Err(());
            }
            match self
                .lock_state
                .compare_exchange(state, state + READER, Acquire, Relaxed)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        let result = self.find_locked(hash, key, guard);
        if self.lock_state.fetch_sub(READER, AcqRel) == (READER | WAITER) {
            self.wait_queue.signal();
        }
        Ok(result)
    }

    /// Searches the tree with the owning bin's lock held.
    pub(crate) fn find_locked<Q>(
        &self,
        hash: u64,
        key: &Q,
        guard: &Guard,
    ) -> Option<Shared<Node<K, V>>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        Self::find_in(self.root.load(Relaxed, guard), hash, key, guard)
    }

    fn find_in<'g, Q>(
        node: Ptr<'g, TreeNode<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Option<Shared<Node<K, V>>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let mut current = node;
        while let Some(tree_node) = current.as_ref() {
            let entry = tree_node.entry_ref();
            if hash < entry.hash() {
                current = tree_node.left.load(Relaxed, guard);
            } else if hash > entry.hash() {
                current = tree_node.right.load(Relaxed, guard);
            } else if key.equivalent(entry.key()) {
                return Some(tree_node.entry.clone());
            } else {
                // Hash collision: the address tie-break cannot direct the search, so descend
                // into both subtrees.
                let right = tree_node.right.load(Relaxed, guard);
                if let Some(found) = Self::find_in(right, hash, key, guard) {
                    return Some(found);
                }
                current = tree_node.left.load(Relaxed, guard);
            }
        }
        None
    }

    /// Finds the tree node referencing exactly the given entry.
    fn find_tree_node(
        &self,
        entry: &Node<K, V>,
        guard: &Guard,
    ) -> Option<Shared<TreeNode<K, V>>> {
        let mut stack = vec![self.root.get_shared(Relaxed, guard)];
        let hash = entry.hash();
        while let Some(candidate) = stack.pop() {
            let Some(tree_node) = candidate else { continue };
            let current = tree_node.entry_ref();
            if std::ptr::eq(current as *const _, entry as *const _) {
                return Some(tree_node);
            }
            let current_hash = current.hash();
            if hash < current_hash {
                stack.push(tree_node.left_shared(guard));
            } else if hash > current_hash {
                stack.push(tree_node.right_shared(guard));
            } else {
                stack.push(tree_node.left_shared(guard));
                stack.push(tree_node.right_shared(guard));
            }
        }
        None
    }

    /// Removes the tree node referencing the given entry.
    ///
    /// The owning bin's lock must be held. Returns `true` if the tree became small enough for
    /// the caller to drop the index and fall back to a plain chain.
    pub(crate) fn remove(&self, entry: &Node<K, V>, guard: &Guard) -> bool {
        let Some(p) = self.find_tree_node(entry, guard) else {
            return self.is_too_small(guard);
        };

        // The pre-removal shape check mirrors the original: a tree this small is cheaper as a
        // plain chain.
        if self.is_too_small(guard) {
            return true;
        }

        self.lock_root();
        let pl = p.left_shared(guard);
        let pr = p.right_shared(guard);
        let replacement;
        if let (Some(_), Some(pr_node)) = (pl.clone(), pr.clone()) {
            // Two children: swap with the in-order successor.
            let mut s = pr_node.clone();
            while let Some(sl) = s.left_shared(guard) {
                s = sl;
            }
            let color = s.is_red();
            s.set_red(p.is_red());
            p.set_red(color);
            let sr = s.right_shared(guard);
            let pp = p.parent_shared(guard);
            if std::ptr::eq(s.as_ptr(), pr_node.as_ptr()) {
                p.set_parent(Some(s.clone()));
                s.set_right(Some(p.clone()));
            } else {
                let sp = s.parent_shared(guard);
                p.set_parent(sp.clone());
                if let Some(sp) = sp {
                    if node_eq(&sp.left_shared(guard), &s) {
                        sp.set_left(Some(p.clone()));
                    } else {
                        sp.set_right(Some(p.clone()));
                    }
                }
                s.set_right(pr.clone());
                pr_node.set_parent(Some(s.clone()));
            }
            p.set_left(None);
            p.set_right(sr.clone());
            if let Some(sr) = sr.clone() {
                sr.set_parent(Some(p.clone()));
            }
            s.set_left(pl.clone());
            if let Some(pl) = pl {
                pl.set_parent(Some(s.clone()));
            }
            s.set_parent(pp.clone());
            if let Some(pp) = pp {
                if node_eq(&pp.left_shared(guard), &p) {
                    pp.set_left(Some(s.clone()));
                } else {
                    pp.set_right(Some(s.clone()));
                }
            } else {
                let _ = self.root.swap((Some(s.clone()), Tag::None), Release);
            }
            replacement = sr.unwrap_or_else(|| p.clone());
        } else if let Some(pl) = pl {
            replacement = pl;
        } else if let Some(pr) = pr {
            replacement = pr;
        } else {
            replacement = p.clone();
        }

        if !std::ptr::eq(replacement.as_ptr(), p.as_ptr()) {
            let pp = p.parent_shared(guard);
            replacement.set_parent(pp.clone());
            if let Some(pp) = pp {
                if node_eq(&pp.left_shared(guard), &p) {
                    pp.set_left(Some(replacement.clone()));
                } else {
                    pp.set_right(Some(replacement.clone()));
                }
            } else {
                let _ = self
                    .root
                    .swap((Some(replacement.clone()), Tag::None), Release);
            }
            p.set_left(None);
            p.set_right(None);
            p.set_parent(None);
        }

        if !p.is_red() {
            self.balance_deletion(replacement.clone(), guard);
        }

        if std::ptr::eq(replacement.as_ptr(), p.as_ptr()) {
            // Detach a childless node from its parent.
            let pp = p.parent_shared(guard);
            if let Some(pp) = pp {
                if node_eq(&pp.left_shared(guard), &p) {
                    pp.set_left(None);
                } else if node_eq(&pp.right_shared(guard), &p) {
                    pp.set_right(None);
                }
                p.set_parent(None);
            } else {
                let _ = self.root.swap((None, Tag::None), Release);
            }
        }
        self.unlock_root();
        self.is_too_small(guard)
    }

    fn is_too_small(&self, guard: &Guard) -> bool {
        let Some(root) = self.root.load(Relaxed, guard).as_ref() else {
            return true;
        };
        let Some(left) = root.left.load(Relaxed, guard).as_ref() else {
            return true;
        };
        root.right.load(Relaxed, guard).is_null() || left.left.load(Relaxed, guard).is_null()
    }

    fn lock_root(&self) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Acquire, Relaxed)
            .is_err()
        {
            self.contended_lock_root();
        }
    }

    fn contended_lock_root(&self) {
        loop {
            let state = self.lock_state.load(Relaxed);
            if state & !WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Acquire, Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & WAITER == 0 {
                let _ =
                    self.lock_state
                        .compare_exchange(state, state | WAITER, Relaxed, Relaxed);
            } else {
                let _ = self.wait_queue.wait_sync(|| {
                    if self.lock_state.load(Relaxed) & !WAITER == 0 {
                        Ok(())
                    } else {
                        Err(())
                    }
                });
            }
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(0, Release);
    }

    fn rotate_left(&self, p: &Shared<TreeNode<K, V>>, guard: &Guard) {
        let Some(r) = p.right_shared(guard) else {
            return;
        };
        let rl = r.left_shared(guard);
        p.set_right(rl.clone());
        if let Some(rl) = rl {
            rl.set_parent(Some(p.clone()));
        }
        let pp = p.parent_shared(guard);
        r.set_parent(pp.clone());
        if let Some(pp) = pp {
            if node_eq(&pp.left_shared(guard), p) {
                pp.set_left(Some(r.clone()));
            } else {
                pp.set_right(Some(r.clone()));
            }
        } else {
            r.set_red(false);
            let _ = self.root.swap((Some(r.clone()), Tag::None), Release);
        }
        r.set_left(Some(p.clone()));
        p.set_parent(Some(r));
    }

    fn rotate_right(&self, p: &Shared<TreeNode<K, V>>, guard: &Guard) {
        let Some(l) = p.left_shared(guard) else {
            return;
        };
        let lr = l.right_shared(guard);
        p.set_left(lr.clone());
        if let Some(lr) = lr {
            lr.set_parent(Some(p.clone()));
        }
        let pp = p.parent_shared(guard);
        l.set_parent(pp.clone());
        if let Some(pp) = pp {
            if node_eq(&pp.right_shared(guard), p) {
                pp.set_right(Some(l.clone()));
            } else {
                pp.set_left(Some(l.clone()));
            }
        } else {
            l.set_red(false);
            let _ = self.root.swap((Some(l.clone()), Tag::None), Release);
        }
        l.set_right(Some(p.clone()));
        p.set_parent(Some(l));
    }

    fn balance_insertion(&self, mut x: Shared<TreeNode<K, V>>, guard: &Guard) {
        x.set_red(true);
        loop {
            let Some(xp) = x.parent_shared(guard) else {
                x.set_red(false);
                let _ = self.root.swap((Some(x), Tag::None), Release);
                return;
            };
            if !xp.is_red() {
                return;
            }
            let Some(xpp) = xp.parent_shared(guard) else {
                return;
            };
            let xppl = xpp.left_shared(guard);
            if ptr_eq(&xppl, &Some(xp.clone())) {
                let xppr = xpp.right_shared(guard);
                if let Some(uncle) = xppr.filter(|u| u.is_red()) {
                    uncle.set_red(false);
                    xp.set_red(false);
                    xpp.set_red(true);
                    x = xpp;
                } else {
                    if node_eq(&xp.right_shared(guard), &x) {
                        self.rotate_left(&xp, guard);
                        x = xp.clone();
                    }
                    let Some(xp) = x.parent_shared(guard) else { return };
                    xp.set_red(false);
                    if let Some(xpp) = xp.parent_shared(guard) {
                        xpp.set_red(true);
                        self.rotate_right(&xpp, guard);
                    }
                }
            } else if let Some(uncle) = xppl.filter(|u| u.is_red()) {
                uncle.set_red(false);
                xp.set_red(false);
                xpp.set_red(true);
                x = xpp;
            } else {
                if node_eq(&xp.left_shared(guard), &x) {
                    self.rotate_right(&xp, guard);
                    x = xp.clone();
                }
                let Some(xp) = x.parent_shared(guard) else { return };
                xp.set_red(false);
                if let Some(xpp) = xp.parent_shared(guard) {
                    xpp.set_red(true);
                    self.rotate_left(&xpp, guard);
                }
            }
        }
    }

    fn balance_deletion(&self, mut x: Shared<TreeNode<K, V>>, guard: &Guard) {
        loop {
            let root = self.root.get_shared(Relaxed, guard);
            if root.is_none() || ptr_eq(&root, &Some(x.clone())) {
                return;
            }
            let Some(xp) = x.parent_shared(guard) else {
                x.set_red(false);
                return;
            };
            if x.is_red() {
                x.set_red(false);
                return;
            }
            if node_eq(&xp.left_shared(guard), &x) {
                if let Some(mut xpr) = xp.right_shared(guard) {
                    if xpr.is_red() {
                        xpr.set_red(false);
                        xp.set_red(true);
                        self.rotate_left(&xp, guard);
                        let Some(xp) = x.parent_shared(guard) else { return };
                        let Some(r) = xp.right_shared(guard) else {
                            x = xp;
                            continue;
                        };
                        xpr = r;
                    }
                    let sl = xpr.left_shared(guard);
                    let sr = xpr.right_shared(guard);
                    let sl_red = sl.as_ref().is_some_and(|n| n.is_red());
                    let sr_red = sr.as_ref().is_some_and(|n| n.is_red());
                    if !sl_red && !sr_red {
                        xpr.set_red(true);
                        x = xp;
                    } else {
                        if !sr_red {
                            if let Some(sl) = sl {
                                sl.set_red(false);
                            }
                            xpr.set_red(true);
                            self.rotate_right(&xpr, guard);
                            let Some(reread) = x
                                .parent_shared(guard)
                                .and_then(|xp| xp.right_shared(guard))
                            else {
                                return;
                            };
                            xpr = reread;
                        }
                        let Some(xp) = x.parent_shared(guard) else { return };
                        xpr.set_red(xp.is_red());
                        xp.set_red(false);
                        if let Some(sr) = xpr.right_shared(guard) {
                            sr.set_red(false);
                        }
                        self.rotate_left(&xp, guard);
                        if let Some(root) = self.root.get_shared(Relaxed, guard) {
                            x = root;
                        }
                    }
                } else {
                    x = xp;
                }
            } else if let Some(mut xpl) = xp.left_shared(guard) {
                // Symmetric to the left-child case.
                if xpl.is_red() {
                    xpl.set_red(false);
                    xp.set_red(true);
                    self.rotate_right(&xp, guard);
                    let Some(xp) = x.parent_shared(guard) else { return };
                    let Some(l) = xp.left_shared(guard) else {
                        x = xp;
                        continue;
                    };
                    xpl = l;
                }
                let sl = xpl.left_shared(guard);
                let sr = xpl.right_shared(guard);
                let sl_red = sl.as_ref().is_some_and(|n| n.is_red());
                let sr_red = sr.as_ref().is_some_and(|n| n.is_red());
                if !sl_red && !sr_red {
                    xpl.set_red(true);
                    x = xp;
                } else {
                    if !sl_red {
                        if let Some(sr) = sr {
                            sr.set_red(false);
                        }
                        xpl.set_red(true);
                        self.rotate_left(&xpl, guard);
                        let Some(reread) = x
                            .parent_shared(guard)
                            .and_then(|xp| xp.left_shared(guard))
                        else {
                            return;
                        };
                        xpl = reread;
                    }
                    let Some(xp) = x.parent_shared(guard) else { return };
                    xpl.set_red(xp.is_red());
                    xp.set_red(false);
                    if let Some(sl) = xpl.left_shared(guard) {
                        sl.set_red(false);
                    }
                    self.rotate_right(&xp, guard);
                    if let Some(root) = self.root.get_shared(Relaxed, guard) {
                        x = root;
                    }
                }
            } else {
                x = xp;
            }
        }
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // Break parent back-references so no reference cycle outlives the tree.
        let guard = Guard::new();
        let mut stack = vec![self.root.swap((None, Tag::None), Relaxed).0];
        while let Some(candidate) = stack.pop() {
            let Some(node) = candidate else { continue };
            node.set_parent(None);
            stack.push(node.left.swap((None, Tag::None), Relaxed).0);
            stack.push(node.right.swap((None, Tag::None), Relaxed).0);
        }
        drop(guard);
    }
}
