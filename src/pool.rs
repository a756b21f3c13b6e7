//! The item pool: a per-thread circular free-list of [`Item`] cells.
//!
//! Ported from the original's `item_allocator<T, ReuseCheck>`
//! (`util/mm.h`), Wimmer's wait-free memory management scheme: a circular
//! singly-linked list with a `head`/`tail` pair. `acquire` walks forward
//! from `head` looking for a reusable cell; if it reaches `tail` without
//! finding one, it splices a fresh node in just before `tail` and advances
//! `tail` past it. This bounds how far a warm pool has to scan, unlike an
//! unbounded free-list rescan.
//!
//! A pool is owned by exactly one thread for its entire lifetime: only
//! that thread calls [`ItemPool::acquire`]. Other threads may still hold
//! raw references to the cells it owns (via a block's `item_ref`), since
//! cell addresses never move once allocated.

use crate::item::Item;
use std::cell::Cell;
use std::ptr;

struct Node<K, V> {
    item: Item<K, V>,
    next: Cell<*mut Node<K, V>>,
}

/// A per-thread pool of reusable [`Item`] cells.
pub struct ItemPool<K, V> {
    head: Cell<*mut Node<K, V>>,
    tail: Cell<*mut Node<K, V>>,
}

// SAFETY: mutation of `head`/`tail` and the `next` links only ever
// happens from the pool's single owning thread (via `acquire`); other
// threads only read `Item` cells through stable raw pointers obtained
// from blocks, never through the pool's own linked-list structure.
unsafe impl<K: Send, V: Send> Send for ItemPool<K, V> {}
unsafe impl<K: Send, V: Send> Sync for ItemPool<K, V> {}

impl<K, V> ItemPool<K, V> {
    /// Create an empty pool. The first call to [`ItemPool::acquire`]
    /// allocates the initial single-node ring.
    pub fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    fn bootstrap(&self) {
        let node = Box::into_raw(Box::new(Node {
            item: Item::new(),
            next: Cell::new(ptr::null_mut()),
        }));
        // A ring of one: the node points to itself.
        unsafe {
            (*node).next.set(node);
        }
        self.head.set(node);
        self.tail.set(node);
    }

    /// Acquire a cell: either a reusable (even-version) existing cell, or
    /// a newly allocated one spliced into the ring.
    ///
    /// Returns a stable reference to the cell's [`Item`]. The caller must
    /// call [`Item::initialize`] on it before the cell is considered
    /// live and before any pointer to it is published into a block.
    pub fn acquire(&self) -> &Item<K, V> {
        if self.head.get().is_null() {
            self.bootstrap();
        }

        let start = self.head.get();
        let mut cursor = start;
        loop {
            // SAFETY: `cursor` is always a live node in this pool's ring.
            let node = unsafe { &*cursor };
            if node.item.is_reusable() {
                self.head.set(node.next.get());
                return &node.item;
            }

            if cursor == self.tail.get() {
                break;
            }
            cursor = node.next.get();
        }

        // No reusable cell found up to `tail`: splice a fresh node in
        // just before `tail` and hand it out.
        let tail = self.tail.get();
        // SAFETY: `tail` is a live node in this pool's ring.
        let tail_next = unsafe { (*tail).next.get() };

        let new_node = Box::into_raw(Box::new(Node {
            item: Item::new(),
            next: Cell::new(tail_next),
        }));
        unsafe {
            (*tail).next.set(new_node);
        }
        self.tail.set(new_node);
        self.head.set(tail_next);

        unsafe { &(*new_node).item }
    }
}

impl<K, V> Default for ItemPool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for ItemPool<K, V> {
    fn drop(&mut self) {
        let head = self.head.get();
        if head.is_null() {
            return;
        }
        let mut cursor = head;
        loop {
            // SAFETY: single-owner teardown; the ring is walked exactly
            // once and each node freed exactly once.
            let next = unsafe { (*cursor).next.get() };
            unsafe {
                drop(Box::from_raw(cursor));
            }
            if next == head {
                break;
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_fresh_is_reusable() {
        let pool: ItemPool<u32, u32> = ItemPool::new();
        let item = pool.acquire();
        assert!(item.is_reusable());
    }

    #[test]
    fn test_acquire_reuses_after_take() {
        let pool: ItemPool<u32, u32> = ItemPool::new();
        let a = pool.acquire() as *const _;
        let v = unsafe { &*a }.initialize(1, 1);
        unsafe { &*a }.take(v).unwrap();

        // with a single live node, the next acquire should find it reusable
        // and return the same address.
        let b = pool.acquire() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn test_acquire_grows_when_all_live() {
        let pool: ItemPool<u32, u32> = ItemPool::new();
        let mut addrs = Vec::new();
        for i in 0..5u32 {
            let item = pool.acquire();
            item.initialize(i, i);
            addrs.push(item as *const _);
        }
        // all five cells are distinct addresses since none were ever freed
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 5);
    }

    #[test]
    fn test_pool_recycles_after_full_round_trip() {
        let pool: ItemPool<u32, u32> = ItemPool::new();
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let item = pool.acquire();
            let v = item.initialize(i, i);
            handles.push((item as *const Item<u32, u32>, v));
        }
        for (item, v) in &handles {
            unsafe { &**item }.take(*v).unwrap();
        }

        // pool is now all-reusable; next 4 acquires should reuse the ring
        // rather than growing it further.
        let mut addrs = Vec::new();
        for _ in 0..4 {
            addrs.push(pool.acquire() as *const _);
        }
        let mut existing: Vec<_> = handles.iter().map(|(p, _)| *p).collect();
        existing.sort();
        addrs.sort();
        assert_eq!(addrs, existing);
    }
}
