//! Blocks: fixed-capacity sorted windows of `(key, item, expected_version)`.
//!
//! Ported from `components/block.h` / `block_inl.h`. A block's capacity is
//! a power of two fixed at construction. Ownership of a slot is confirmed
//! lazily: an entry is "owned by the block" iff the referenced item's
//! current version still equals the `expected_version` recorded at
//! insertion time (invariant BK1). `first`/`last` bound the live window;
//! only the block's owner thread may prune them past dead entries — a
//! non-owner's `peek` is read-only.

use crate::item::Item;
use crate::thread::current_tid;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One sorted entry: a key, a pointer to its backing item cell, and the
/// version that cell had when this entry was inserted.
#[derive(Clone, Copy)]
struct Entry<K, V> {
    key: K,
    item: *const Item<K, V>,
    expected_version: u32,
}

/// A fixed-capacity sorted window of entries.
pub struct Block<K, V> {
    power: u32,
    owner_tid: u32,
    first: AtomicUsize,
    last: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<Entry<K, V>>>]>,
}

unsafe impl<K: Send, V: Send> Send for Block<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Block<K, V> {}

/// The result of a successful `peek`: key, backing item pointer, the
/// entry's absolute index within the block, and its expected version.
pub type PeekResult<K, V> = (K, *const Item<K, V>, usize, u32);

impl<K: Ord + Copy, V: Copy> Block<K, V> {
    /// Create an empty block of capacity `2^power`, owned by the calling
    /// thread.
    pub fn new(power: u32) -> Self {
        let capacity = 1usize << power;
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            power,
            owner_tid: current_tid(),
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
            slots,
        }
    }

    /// The block's power (`capacity = 2^power`).
    #[inline]
    pub fn power(&self) -> u32 {
        self.power
    }

    /// The block's fixed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The thread id that constructed this block.
    #[inline]
    pub fn owner_tid(&self) -> u32 {
        self.owner_tid
    }

    #[inline]
    fn first_ix(&self) -> usize {
        self.first.load(Ordering::Relaxed)
    }

    #[inline]
    fn last_ix(&self) -> usize {
        self.last.load(Ordering::Relaxed)
    }

    /// Raw index-range size, `last - first`. Not all entries in this
    /// range are necessarily still owned.
    #[inline]
    pub fn len(&self) -> usize {
        self.last_ix().saturating_sub(self.first_ix())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn entry_at(&self, i: usize) -> Entry<K, V> {
        // SAFETY: `i` is within `[0, last)`, and every slot below `last`
        // has been written by a prior `insert`.
        unsafe { (*self.slots[i].get()).assume_init() }
    }

    fn is_owned(entry: &Entry<K, V>) -> bool {
        // SAFETY: `entry.item` is a stable pointer into some thread's item
        // pool for the lifetime of this block.
        unsafe { (*entry.item).version() == entry.expected_version }
    }

    /// Append an entry at `last`. Only valid while the block is in its
    /// owner-only, local (unpublished) construction phase.
    pub fn insert(&self, key: K, item: *const Item<K, V>, expected_version: u32) {
        let last = self.last_ix();
        debug_assert!(last < self.capacity());
        let entry = Entry {
            key,
            item,
            expected_version,
        };
        // SAFETY: single-writer (owner), local phase only.
        unsafe {
            (*self.slots[last].get()).write(entry);
        }
        self.last.store(last + 1, Ordering::Relaxed);
    }

    /// Return the first owned entry, or `None` if the window holds no
    /// owned entries. When called by the owner thread, advances `first`
    /// past any dead prefix so future calls are cheaper.
    pub fn peek(&self) -> Option<PeekResult<K, V>> {
        let is_owner = current_tid() == self.owner_tid;
        let last = self.last_ix();
        let mut i = self.first_ix();

        while i < last {
            let entry = self.entry_at(i);
            if Self::is_owned(&entry) {
                if is_owner {
                    self.first.store(i, Ordering::Relaxed);
                }
                return Some((entry.key, entry.item, i, entry.expected_version));
            }
            i += 1;
        }

        if is_owner {
            self.first.store(last, Ordering::Relaxed);
        }
        None
    }

    /// Return the entry at absolute index `n`, if it lies within the live
    /// window and is still owned. Does not prune.
    pub fn peek_nth(&self, n: usize) -> Option<PeekResult<K, V>> {
        if n < self.first_ix() || n >= self.last_ix() {
            return None;
        }
        let entry = self.entry_at(n);
        if Self::is_owned(&entry) {
            Some((entry.key, entry.item, n, entry.expected_version))
        } else {
            None
        }
    }

    /// Return the key of the last owned entry, scanning backward from
    /// `last`. When called by the owner, prunes the dead suffix.
    pub fn peek_tail(&self) -> Option<K> {
        let is_owner = current_tid() == self.owner_tid;
        let first = self.first_ix();
        let mut i = self.last_ix();

        while i > first {
            let entry = self.entry_at(i - 1);
            if Self::is_owned(&entry) {
                if is_owner {
                    self.last.store(i, Ordering::Relaxed);
                }
                return Some(entry.key);
            }
            i -= 1;
        }

        if is_owner {
            self.last.store(first, Ordering::Relaxed);
        }
        None
    }

    /// Claim the entry at index `i`, if it is still owned.
    pub fn take_at(&self, i: usize) -> Option<(K, V)> {
        if i < self.first_ix() || i >= self.last_ix() {
            return None;
        }
        let entry = self.entry_at(i);
        // SAFETY: stable pointer, see `is_owned`.
        unsafe { (*entry.item).take(entry.expected_version) }
    }

    /// A read-only iterator over every slot index in `[first, last)`,
    /// including entries that may no longer be owned. Used by spying,
    /// which never mutates the victim block.
    pub fn iter_weak(&self) -> impl Iterator<Item = PeekResult<K, V>> + '_ {
        let first = self.first_ix();
        let last = self.last_ix();
        (first..last).filter_map(move |i| {
            let entry = self.entry_at(i);
            if Self::is_owned(&entry) {
                Some((entry.key, entry.item, i, entry.expected_version))
            } else {
                None
            }
        })
    }

    /// Compact the owned entries of `src` into a fresh block of the given
    /// power, owned by the calling thread (used for block shrinking).
    pub fn copy_from(src: &Block<K, V>, power: u32) -> Self {
        let fresh = Self::new(power);
        for (key, item, _, version) in src.iter_weak() {
            if fresh.last_ix() >= fresh.capacity() {
                break;
            }
            fresh.insert(key, item, version);
        }
        fresh
    }

    /// Linear merge of two sorted blocks' owned entries into a fresh
    /// block of the given power, skipping unowned entries in either side.
    pub fn merge(lhs: &Block<K, V>, rhs: &Block<K, V>, power: u32) -> Self {
        let dest = Self::new(power);
        let mut li = lhs.iter_weak().peekable();
        let mut ri = rhs.iter_weak().peekable();

        loop {
            if dest.last_ix() >= dest.capacity() {
                break;
            }
            match (li.peek(), ri.peek()) {
                (Some(&(lk, ..)), Some(&(rk, ..))) => {
                    if lk <= rk {
                        let (k, item, _, v) = li.next().unwrap();
                        dest.insert(k, item, v);
                    } else {
                        let (k, item, _, v) = ri.next().unwrap();
                        dest.insert(k, item, v);
                    }
                }
                (Some(_), None) => {
                    let (k, item, _, v) = li.next().unwrap();
                    dest.insert(k, item, v);
                }
                (None, Some(_)) => {
                    let (k, item, _, v) = ri.next().unwrap();
                    dest.insert(k, item, v);
                }
                (None, None) => break,
            }
        }
        dest
    }

    /// Count of owned entries in the live window (an O(capacity) scan;
    /// used by block-array compaction to decide whether to shrink).
    pub fn owned_len(&self) -> usize {
        self.iter_weak().count()
    }

    /// Reset the live window to empty, so a recycled block (handed back
    /// out of a block pool) can be filled by fresh `insert` calls.
    pub(crate) fn reset(&self) {
        self.first.store(0, Ordering::Relaxed);
        self.last.store(0, Ordering::Relaxed);
    }

    /// The absolute start index of the live window.
    #[inline]
    pub fn first_index(&self) -> usize {
        self.first_ix()
    }

    /// The absolute (exclusive) end index of the live window.
    #[inline]
    pub fn last_index(&self) -> usize {
        self.last_ix()
    }

    /// The key stored at absolute index `i`, regardless of whether that
    /// entry is still owned. Per invariant BK1, keys are non-decreasing
    /// by absolute index independent of liveness, so this is safe to use
    /// for key-space bisection (block pivots).
    pub fn key_at(&self, i: usize) -> K {
        self.entry_at(i).key
    }

    /// The first absolute index `i` in `[first, last)` whose key exceeds
    /// `pivot`, or `last` if none does. Binary search over BK1's
    /// non-decreasing key order.
    pub fn upper_bound_index(&self, pivot: K) -> usize {
        let mut lo = self.first_ix();
        let mut hi = self.last_ix();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) <= pivot {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ItemPool;

    fn make_item(pool: &ItemPool<u32, u32>, key: u32) -> (*const Item<u32, u32>, u32) {
        let item = pool.acquire();
        let v = item.initialize(key, key * 10);
        (item as *const _, v)
    }

    #[test]
    fn test_insert_and_peek() {
        let pool = ItemPool::new();
        let block: Block<u32, u32> = Block::new(2);
        let (p, v) = make_item(&pool, 5);
        block.insert(5, p, v);

        let (k, _, idx, _) = block.peek().unwrap();
        assert_eq!(k, 5);
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_peek_skips_taken_entries() {
        let pool = ItemPool::new();
        let block: Block<u32, u32> = Block::new(2);
        let (p1, v1) = make_item(&pool, 1);
        let (p2, v2) = make_item(&pool, 2);
        block.insert(1, p1, v1);
        block.insert(2, p2, v2);

        unsafe { &*p1 }.take(v1).unwrap();

        let (k, _, idx, _) = block.peek().unwrap();
        assert_eq!(k, 2);
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_peek_tail_skips_taken_suffix() {
        let pool = ItemPool::new();
        let block: Block<u32, u32> = Block::new(2);
        let (p1, v1) = make_item(&pool, 1);
        let (p2, v2) = make_item(&pool, 2);
        block.insert(1, p1, v1);
        block.insert(2, p2, v2);

        unsafe { &*p2 }.take(v2).unwrap();

        assert_eq!(block.peek_tail(), Some(1));
    }

    #[test]
    fn test_merge_two_sorted_blocks() {
        let pool = ItemPool::new();
        let lhs: Block<u32, u32> = Block::new(1);
        let rhs: Block<u32, u32> = Block::new(1);

        let (p1, v1) = make_item(&pool, 1);
        let (p3, v3) = make_item(&pool, 3);
        lhs.insert(1, p1, v1);
        lhs.insert(3, p3, v3);

        let (p2, v2) = make_item(&pool, 2);
        let (p4, v4) = make_item(&pool, 4);
        rhs.insert(2, p2, v2);
        rhs.insert(4, p4, v4);

        let merged = Block::merge(&lhs, &rhs, 2);
        let keys: Vec<u32> = merged.iter_weak().map(|(k, ..)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_copy_from_compacts_owned_only() {
        let pool = ItemPool::new();
        let src: Block<u32, u32> = Block::new(2);
        let (p1, v1) = make_item(&pool, 1);
        let (p2, v2) = make_item(&pool, 2);
        let (p3, v3) = make_item(&pool, 3);
        src.insert(1, p1, v1);
        src.insert(2, p2, v2);
        src.insert(3, p3, v3);
        unsafe { &*p2 }.take(v2).unwrap();

        let dest = Block::copy_from(&src, 1);
        let keys: Vec<u32> = dest.iter_weak().map(|(k, ..)| k).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_take_at_then_peek_advances() {
        let pool = ItemPool::new();
        let block: Block<u32, u32> = Block::new(1);
        let (p1, v1) = make_item(&pool, 1);
        let (p2, v2) = make_item(&pool, 2);
        block.insert(1, p1, v1);
        block.insert(2, p2, v2);

        let (_, _, idx, _) = block.peek().unwrap();
        assert_eq!(block.take_at(idx), Some((1, 10)));

        let (k, ..) = block.peek().unwrap();
        assert_eq!(k, 2);
    }
}
