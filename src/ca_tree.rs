//! The contention-adaptive tree (CA-tree): CAPQ's backing structure.
//!
//! Ported from `lib/capq/ca_tree.c` / `ca_tree.h`. A CA-tree is a binary
//! search tree of two node kinds:
//!
//! - route nodes hold a split key and two children, each behind a
//!   [`crate::spinlock::FasLock`] (the original's TATAS lock) so a
//!   split/join can swap a child pointer out safely;
//! - base nodes hold an actual key range's data in a
//!   [`crate::skiplist::FatSkiplist`], guarded by a
//!   [`crate::delegation_lock::DelegationLock`] so a hot base node
//!   drains contending operations instead of serializing them one
//!   spin-lock acquisition at a time.
//!
//! Each base node tracks a running contention counter (`CT-stat` in the
//! original): every uncontended lock acquisition nudges it down,
//! every contended one nudges it up. Crossing the high threshold
//! splits the node in two; crossing the low threshold (and having a
//! sibling) joins it back with that sibling. This keeps the tree's
//! granularity matched to the actual access pattern -- coarse while
//! idle, fine while hot -- without any fixed parameter the caller has
//! to tune.
//!
//! This port's join is intentionally narrower than the original's: it
//! only merges a base node with the *sibling* under its immediate
//! parent route node (requiring that sibling also be a base node),
//! never a deeper cousin. CAPQ's workload (uniform key arrivals via
//! the adaptive put buffer) splits and joins symmetric pairs almost
//! exclusively in practice, so the wider case the original handles is
//! rare; see DESIGN.md.

use crate::delegation_lock::DelegationLock;
use crate::skiplist::FatSkiplist;
use crate::spinlock::FasLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Applied to a base node's contention counter after an uncontended
/// lock acquisition. Matches the original's `-1`.
pub const SUCCESS_CONTENTION_DELTA: i64 = -1;
/// Applied after a contended acquisition. Matches the original's `250`.
pub const FAILURE_CONTENTION_DELTA: i64 = 250;
/// Crossing this (upward) triggers a split. Matches the original's `1000`.
pub const SPLIT_CONTENTION_THRESHOLD: i64 = 1000;
/// Crossing this (downward) triggers a join with a sibling. Matches the
/// original's `-1000`.
pub const JOIN_CONTENTION_THRESHOLD: i64 = -1000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

struct ParentLink<K, V> {
    route: Arc<RouteNode<K, V>>,
    side: Side,
}

impl<K, V> Clone for ParentLink<K, V> {
    fn clone(&self) -> Self {
        Self {
            route: Arc::clone(&self.route),
            side: self.side,
        }
    }
}

/// Either kind of CA-tree node.
pub enum Child<K, V> {
    Route(Arc<RouteNode<K, V>>),
    Base(Arc<BaseNode<K, V>>),
}

impl<K, V> Clone for Child<K, V> {
    fn clone(&self) -> Self {
        match self {
            Child::Route(r) => Child::Route(Arc::clone(r)),
            Child::Base(b) => Child::Base(Arc::clone(b)),
        }
    }
}

/// A route node: a split key plus two locked children.
pub struct RouteNode<K, V> {
    key: K,
    left: FasLock<Child<K, V>>,
    right: FasLock<Child<K, V>>,
    parent: Mutex<Option<ParentLink<K, V>>>,
}

/// A base node: the actual payload for one key range.
pub struct BaseNode<K, V> {
    skiplist: DelegationLock<FatSkiplist<K, V>>,
    /// Cleared once this node has been spliced out by a split or join;
    /// a stale reference found via a racing traversal should be
    /// discarded and the search restarted from the root.
    valid: AtomicBool,
    contention: AtomicI64,
    parent: Mutex<Option<ParentLink<K, V>>>,
}

impl<K, V> BaseNode<K, V> {
    fn new(skiplist: FatSkiplist<K, V>) -> Arc<Self> {
        Arc::new(Self {
            skiplist: DelegationLock::new(skiplist),
            valid: AtomicBool::new(true),
            contention: AtomicI64::new(0),
            parent: Mutex::new(None),
        })
    }

    fn record_success(&self) {
        self.contention.fetch_add(SUCCESS_CONTENTION_DELTA, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.contention.fetch_add(FAILURE_CONTENTION_DELTA, Ordering::Relaxed);
    }

    /// Current contention reading (exposed for CAPQ's adaptive buffer
    /// sizing, which shares the same statistic).
    pub fn contention(&self) -> i64 {
        self.contention.load(Ordering::Relaxed)
    }
}

/// A contention-adaptive tree over keys `K` mapping to values `V`.
pub struct CaTree<K, V> {
    root: FasLock<Child<K, V>>,
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static> CaTree<K, V> {
    /// A tree holding a single empty base node.
    pub fn new() -> Self {
        Self {
            root: FasLock::new(Child::Base(BaseNode::new(FatSkiplist::new()))),
        }
    }

    fn locate(&self, key: &K) -> Arc<BaseNode<K, V>> {
        loop {
            let mut current = self.root.lock().clone();
            loop {
                match current {
                    Child::Base(b) => {
                        if b.valid.load(Ordering::Acquire) {
                            return b;
                        }
                        break;
                    }
                    Child::Route(r) => {
                        current = if *key <= r.key {
                            r.left.lock().clone()
                        } else {
                            r.right.lock().clone()
                        };
                    }
                }
            }
            // Landed on an invalidated base node (a split/join raced
            // with this traversal); restart from the root.
        }
    }

    fn first_nonempty(child: &Child<K, V>) -> Option<Arc<BaseNode<K, V>>> {
        match child {
            Child::Base(b) => {
                if b.valid.load(Ordering::Acquire) && !b.skiplist.lock().is_empty() {
                    Some(Arc::clone(b))
                } else {
                    None
                }
            }
            Child::Route(r) => {
                let left = r.left.lock().clone();
                Self::first_nonempty(&left).or_else(|| {
                    let right = r.right.lock().clone();
                    Self::first_nonempty(&right)
                })
            }
        }
    }

    fn leftmost_nonempty(&self) -> Option<Arc<BaseNode<K, V>>> {
        let root = self.root.lock().clone();
        Self::first_nonempty(&root)
    }

    /// Insert a key/value pair, adapting the tree's granularity
    /// afterward based on whether the base node's lock was contended.
    pub fn insert(&self, key: K, value: V) {
        self.insert_reporting_contention(key, value);
    }

    /// As [`CaTree::insert`], additionally reporting whether the
    /// base-node lock was contended (for CAPQ's own per-thread
    /// contention counters, which are tracked independently of the
    /// base node's split/join statistic).
    pub fn insert_reporting_contention(&self, key: K, value: V) -> bool {
        let base = self.locate(&key);
        let contended = match base.skiplist.try_lock() {
            Some(mut g) => {
                g.put(key, value);
                false
            }
            None => {
                let mut g = base.skiplist.lock();
                g.put(key, value);
                true
            }
        };
        if contended {
            base.record_failure();
        } else {
            base.record_success();
        }
        self.maybe_adapt(&base);
        contended
    }

    /// Remove and return some minimum-valued entry, or `None` if the
    /// tree holds nothing. "Some minimum" rather than "the" minimum:
    /// concurrent inserts below the node this call settles on are not
    /// reflected once the search has committed to it.
    pub fn delete_min(&self) -> Option<(K, V)> {
        self.delete_min_reporting_contention().0
    }

    /// As [`CaTree::delete_min`], additionally reporting whether the
    /// base-node lock was contended.
    pub fn delete_min_reporting_contention(&self) -> (Option<(K, V)>, bool) {
        loop {
            let Some(base) = self.leftmost_nonempty() else {
                return (None, false);
            };
            let (result, contended) = match base.skiplist.try_lock() {
                Some(mut g) => (g.remove_min(), false),
                None => {
                    let mut g = base.skiplist.lock();
                    (g.remove_min(), true)
                }
            };
            if contended {
                base.record_failure();
            } else {
                base.record_success();
            }
            self.maybe_adapt(&base);
            if let Some(kv) = result {
                return (Some(kv), contended);
            }
            // Another thread drained this node between our check and
            // our lock; retry from the top.
        }
    }

    /// Peek at some minimum-valued key without removing it.
    pub fn find_min(&self) -> Option<K> {
        let base = self.leftmost_nonempty()?;
        base.skiplist.lock().peek_min().map(|(k, _)| k)
    }

    /// Detach the leftmost `count` skiplist nodes beneath some base
    /// node, for CAPQ's bulk relaxed delete-min path.
    pub fn remove_head_nodes(&self, count: usize) -> Option<FatSkiplist<K, V>> {
        self.remove_head_nodes_reporting_contention(count).0
    }

    /// As [`CaTree::remove_head_nodes`], additionally reporting whether
    /// the base-node lock was contended.
    pub fn remove_head_nodes_reporting_contention(&self, count: usize) -> (Option<FatSkiplist<K, V>>, bool) {
        let Some(base) = self.leftmost_nonempty() else {
            return (None, false);
        };
        let (run, contended) = match base.skiplist.try_lock() {
            Some(mut g) => (g.remove_head_nodes(count), false),
            None => {
                let mut g = base.skiplist.lock();
                (g.remove_head_nodes(count), true)
            }
        };
        if contended {
            base.record_failure();
        } else {
            base.record_success();
        }
        self.maybe_adapt(&base);
        (Some(run), contended)
    }

    fn maybe_adapt(&self, base: &Arc<BaseNode<K, V>>) {
        let c = base.contention();
        if c >= SPLIT_CONTENTION_THRESHOLD {
            self.try_split(base);
        } else if c <= JOIN_CONTENTION_THRESHOLD {
            self.try_join(base);
        }
    }

    fn try_split(&self, base: &Arc<BaseNode<K, V>>) {
        if !base.valid.load(Ordering::Acquire) {
            return;
        }
        let mut guard = base.skiplist.lock();
        if !guard.more_than_one_key() {
            return;
        }
        let taken = std::mem::replace(&mut *guard, FatSkiplist::new());
        drop(guard);
        let (left_sl, right_sl, split_key) = taken.split();

        let left_base = BaseNode::new(left_sl);
        let right_base = BaseNode::new(right_sl);
        let route = Arc::new(RouteNode {
            key: split_key,
            left: FasLock::new(Child::Base(Arc::clone(&left_base))),
            right: FasLock::new(Child::Base(Arc::clone(&right_base))),
            parent: Mutex::new(None),
        });
        *left_base.parent.lock().unwrap() = Some(ParentLink {
            route: Arc::clone(&route),
            side: Side::Left,
        });
        *right_base.parent.lock().unwrap() = Some(ParentLink {
            route: Arc::clone(&route),
            side: Side::Right,
        });

        let parent_link = base.parent.lock().unwrap().clone();
        *route.parent.lock().unwrap() = parent_link.clone();
        base.valid.store(false, Ordering::Release);

        match parent_link {
            None => {
                *self.root.lock() = Child::Route(route);
            }
            Some(link) => {
                let slot = match link.side {
                    Side::Left => &link.route.left,
                    Side::Right => &link.route.right,
                };
                *slot.lock() = Child::Route(route);
            }
        }
    }

    fn try_join(&self, base: &Arc<BaseNode<K, V>>) {
        if !base.valid.load(Ordering::Acquire) {
            return;
        }
        let Some(link) = base.parent.lock().unwrap().clone() else {
            return;
        };
        let sibling_slot = match link.side {
            Side::Left => &link.route.right,
            Side::Right => &link.route.left,
        };
        let sibling_child = sibling_slot.lock().clone();
        let Child::Base(sibling) = sibling_child else {
            // Sibling is itself a subtree; the narrower join this port
            // implements only handles a base-node sibling.
            return;
        };
        if !sibling.valid.load(Ordering::Acquire) {
            return;
        }

        // Lock both base nodes in address order to avoid deadlocking
        // against a concurrent join attempt starting from the sibling.
        let (first, second, first_is_left) = if Arc::as_ptr(base) < Arc::as_ptr(&sibling) {
            (base, &sibling, link.side == Side::Left)
        } else {
            (&sibling, base, link.side == Side::Right)
        };
        let mut g1 = first.skiplist.lock();
        let mut g2 = second.skiplist.lock();
        let lhs = std::mem::replace(&mut *g1, FatSkiplist::new());
        let rhs = std::mem::replace(&mut *g2, FatSkiplist::new());
        drop(g1);
        drop(g2);

        let joined = if first_is_left {
            FatSkiplist::join(lhs, rhs)
        } else {
            FatSkiplist::join(rhs, lhs)
        };
        let joined_base = BaseNode::new(joined);

        base.valid.store(false, Ordering::Release);
        sibling.valid.store(false, Ordering::Release);

        let grandparent = link.route.parent.lock().unwrap().clone();
        *joined_base.parent.lock().unwrap() = grandparent.clone();

        match grandparent {
            None => {
                *self.root.lock() = Child::Base(joined_base);
            }
            Some(gp) => {
                let slot = match gp.side {
                    Side::Left => &gp.route.left,
                    Side::Right => &gp.route.right,
                };
                *slot.lock() = Child::Base(joined_base);
            }
        }
    }
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static> Default for CaTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_delete_min_is_sorted() {
        let tree: CaTree<u32, u32> = CaTree::new();
        for k in [5, 1, 4, 2, 3] {
            tree.insert(k, k * 10);
        }
        let mut out = Vec::new();
        while let Some((k, _)) = tree.delete_min() {
            out.push(k);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_find_min_does_not_remove() {
        let tree: CaTree<u32, u32> = CaTree::new();
        tree.insert(7, 70);
        tree.insert(3, 30);
        assert_eq!(tree.find_min(), Some(3));
        assert_eq!(tree.find_min(), Some(3));
    }

    #[test]
    fn test_split_then_join_round_trip_preserves_all_keys() {
        let tree: CaTree<u32, u32> = CaTree::new();
        for k in 0..200u32 {
            tree.insert(k, k);
        }
        // Manufacture contention manually rather than via real threads
        // racing the spinlocks, to make the split deterministic here.
        let base = tree.locate(&0);
        for _ in 0..(SPLIT_CONTENTION_THRESHOLD + 1) {
            base.record_failure();
        }
        tree.maybe_adapt(&base);
        assert!(matches!(*tree.root.lock(), Child::Route(_)));

        let mut seen = Vec::new();
        while let Some((k, _)) = tree.delete_min() {
            seen.push(k);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    fn assert_base_node_invariant(node: &Child<u32, u32>, low: Option<u32>, high: Option<u32>) {
        match node {
            Child::Base(b) => {
                assert!(b.valid.load(Ordering::Acquire), "reachable base node must be valid");
                let mut g = b.skiplist.lock();
                if let Some((min_k, _)) = g.peek_min() {
                    if let Some(lo) = low {
                        assert!(min_k > lo, "key {min_k} below ancestor lower bound {lo}");
                    }
                    if let Some(hi) = high {
                        assert!(min_k <= hi, "key {min_k} above ancestor upper bound {hi}");
                    }
                }
                if let Some(max_k) = g.max_key() {
                    if let Some(hi) = high {
                        assert!(max_k <= hi, "key {max_k} above ancestor upper bound {hi}");
                    }
                }
            }
            Child::Route(r) => {
                let left = r.left.lock().clone();
                assert_base_node_invariant(&left, low, Some(r.key));
                let right = r.right.lock().clone();
                assert_base_node_invariant(&right, Some(r.key), high);
            }
        }
    }

    #[test]
    fn test_base_node_invariant_holds_after_repeated_splits() {
        // P6: every reachable base node stays valid and its keys stay
        // within the range its ancestor route-node split keys carve out,
        // across several forced splits.
        let tree: CaTree<u32, u32> = CaTree::new();
        for k in 0..400u32 {
            tree.insert(k, k);
        }
        for probe in [0u32, 100, 200, 300] {
            let base = tree.locate(&probe);
            if base.valid.load(Ordering::Acquire) {
                for _ in 0..(SPLIT_CONTENTION_THRESHOLD + 1) {
                    base.record_failure();
                }
                tree.maybe_adapt(&base);
            }
        }
        assert!(matches!(*tree.root.lock(), Child::Route(_)));

        let root = tree.root.lock().clone();
        assert_base_node_invariant(&root, None, None);
    }

    #[test]
    fn test_concurrent_inserts_all_present() {
        use std::sync::Arc as StdArc;
        let tree = StdArc::new(CaTree::<u32, u32>::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let tree = StdArc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    let k = t * 100 + i;
                    tree.insert(k, k);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some((k, _)) = tree.delete_min() {
            seen.push(k);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<_>>());
    }
}
