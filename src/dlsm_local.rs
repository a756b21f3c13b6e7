//! DLSM local: one thread's own distributed log-structured merge run of blocks.
//!
//! Ported from `dist_lsm/dist_lsm_local.h`/`_inl.h`. A thread's blocks
//! form a strictly size-descending list (head = largest, tail =
//! smallest): every insert allocates a capacity-1 block and merges it
//! into the tail while the tail's power matches, which keeps at most one
//! block per power -- the same binary-counter discipline used when
//! inserting produces a new block (`power + 1`) as `block_array.rs`'s own
//! `insert` does. Blocks here are plain, independently heap-allocated and
//! never freed, like the queue's items: unlike the shared `block_pool`,
//! nothing ever needs to confirm these blocks' visibility to another
//! thread, because the only other reader is `spy`, which only ever takes
//! a private shallow copy.
//!
//! `delete_min` remembers the last winning candidate (`cached_best`) so a
//! thread hammering its own queue skips the walk entirely as long as that
//! candidate is still live.

use crate::block::Block;
use crate::item::Item;
use crate::pool::ItemPool;
use crate::random::XorShift96;
use crate::thread::current_tid;
use std::cell::{Cell, RefCell};

/// A single thread's private, size-descending list of blocks.
pub struct DlsmLocal<K, V> {
    item_pool: ItemPool<K, V>,
    blocks: RefCell<Vec<*const Block<K, V>>>,
    spied: Cell<Option<*const Block<K, V>>>,
    cached_best: Cell<Option<(*const Item<K, V>, u32, K)>>,
    rng: Cell<Option<XorShift96>>,
}

unsafe impl<K: Send, V: Send> Send for DlsmLocal<K, V> {}
unsafe impl<K: Send, V: Send> Sync for DlsmLocal<K, V> {}

impl<K, V> Default for DlsmLocal<K, V> {
    fn default() -> Self {
        Self {
            item_pool: ItemPool::new(),
            blocks: RefCell::new(Vec::new()),
            spied: Cell::new(None),
            cached_best: Cell::new(None),
            rng: Cell::new(None),
        }
    }
}

impl<K: Ord + Copy, V: Copy> DlsmLocal<K, V> {
    /// Insert `key`/`value`, wrapped in a fresh single-item item cell and
    /// capacity-1 block, merging it up through the tail. If the final
    /// merged block's live size reaches `handoff_threshold`, it is handed
    /// to `handoff` instead of rejoining the local list (the KLSM
    /// composition rule, section 4.13): it never becomes part of `self`.
    pub fn insert(
        &self,
        key: K,
        value: V,
        handoff_threshold: usize,
        mut handoff: impl FnMut(*const Block<K, V>),
    ) {
        let item = self.item_pool.acquire();
        let version = item.initialize(key, value);
        let mut block_ptr: *const Block<K, V> = Box::into_raw(Box::new(Block::new(0)));
        unsafe { (*block_ptr).insert(key, item as *const _, version) };

        let mut blocks = self.blocks.borrow_mut();
        loop {
            let tail_matches = blocks
                .last()
                .map(|&b| unsafe { &*b }.power() == unsafe { &*block_ptr }.power())
                .unwrap_or(false);
            if !tail_matches {
                break;
            }
            let old = blocks.pop().unwrap();
            let merged_power = unsafe { &*old }.power() + 1;
            let merged = Box::into_raw(Box::new(Block::merge(
                unsafe { &*old },
                unsafe { &*block_ptr },
                merged_power,
            )));
            block_ptr = merged;
        }

        if unsafe { &*block_ptr }.owned_len() >= handoff_threshold {
            handoff(block_ptr);
        } else {
            blocks.push(block_ptr);
        }
    }

    fn scan_best(&self) -> Option<(K, *const Item<K, V>, u32)> {
        let mut blocks = self.blocks.borrow_mut();
        let mut best: Option<(K, *const Item<K, V>, u32)> = None;

        let mut i = 0;
        while i < blocks.len() {
            let ptr = blocks[i];
            let b = unsafe { &*ptr };
            match b.peek() {
                Some((k, item, _, v)) => {
                    if best.map(|(bk, ..)| k < bk).unwrap_or(true) {
                        best = Some((k, item, v));
                    }
                    // Half-empty, shrinkable blocks are replaced in place;
                    // unlike `block_array`'s shared compaction, adjacent
                    // blocks here are never re-merged after shrinking (see
                    // DESIGN.md).
                    if b.power() > 0 && b.owned_len() * 2 < b.capacity() {
                        blocks[i] = Box::into_raw(Box::new(Block::copy_from(b, b.power() - 1)));
                    }
                    i += 1;
                }
                None => {
                    blocks.remove(i);
                }
            }
        }
        drop(blocks);

        if best.is_none() {
            if let Some(sp) = self.spied.get() {
                let b = unsafe { &*sp };
                match b.peek() {
                    Some((k, item, _, v)) => best = Some((k, item, v)),
                    None => self.spied.set(None),
                }
            }
        }

        if let Some((k, item, v)) = best {
            self.cached_best.set(Some((item, v, k)));
        }
        best
    }

    /// Remove and return this thread's approximately-minimal key/value
    /// pair, or `None` if the local list and spied slot are both
    /// exhausted. Does not itself spy; the caller (`dlsm.rs`) retries
    /// through `spy` first, since only it has access to sibling locals.
    pub fn try_delete_min_local(&self) -> Option<(K, V)>
    where
        V: Copy,
    {
        loop {
            let candidate = match self.cached_best.get() {
                Some((item, version, key)) if unsafe { &*item }.version() == version => {
                    (key, item, version)
                }
                _ => {
                    self.cached_best.set(None);
                    match self.scan_best() {
                        Some(x) => x,
                        None => return None,
                    }
                }
            };
            let (_, item, version) = candidate;
            self.cached_best.set(None);
            if let Some((k, v)) = unsafe { &*item }.take(version) {
                return Some((k, v));
            }
            // Lost the race to another taker (our own retry, or a spy
            // elsewhere that raced us on a shared item); scan again.
        }
    }

    /// Peek this thread's approximately-minimal key without removing it.
    pub fn find_min(&self) -> Option<K> {
        if let Some((item, version, key)) = self.cached_best.get() {
            if unsafe { &*item }.version() == version {
                return Some(key);
            }
        }
        let blocks = self.blocks.borrow();
        let mut best: Option<K> = None;
        for &ptr in blocks.iter() {
            if let Some((k, ..)) = unsafe { &*ptr }.peek() {
                if best.map(|bk| k < bk).unwrap_or(true) {
                    best = Some(k);
                }
            }
        }
        best
    }

    /// Attempt to steal `victim`'s head (largest) block into this
    /// thread's dedicated spied slot, as a private shallow copy. Aborts
    /// (returning `false`) if this thread still has local blocks or an
    /// unconsumed spied block, since spying is only useful once this
    /// thread is otherwise empty.
    pub fn spy(&self, victim: &DlsmLocal<K, V>) -> bool {
        if !self.blocks.borrow().is_empty() {
            return false;
        }
        if let Some(sp) = self.spied.get() {
            if unsafe { &*sp }.owned_len() > 0 {
                return false;
            }
        }
        let victim_blocks = victim.blocks.borrow();
        let head = match victim_blocks.first() {
            Some(&h) => h,
            None => return false,
        };
        let head_block = unsafe { &*head };
        if head_block.is_empty() {
            return false;
        }
        let copy = Block::copy_from(head_block, head_block.power());
        if copy.is_empty() {
            return false;
        }
        self.spied.set(Some(Box::into_raw(Box::new(copy))));
        true
    }

    /// Pick a random thread index other than this one, for `spy`'s victim
    /// selection. `bound` must be at least 2 (the caller should skip
    /// spying entirely with fewer threads registered).
    pub fn random_victim(&self, bound: usize) -> usize {
        let mut rng = self
            .rng
            .get()
            .unwrap_or_else(|| XorShift96::seeded_from_tid(current_tid()));
        let v = rng.next_other_than(bound, current_tid() as usize);
        self.rng.set(Some(rng));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_delete_min_drains_sorted() {
        let local: DlsmLocal<u32, u32> = DlsmLocal::default();
        for k in [5u32, 1, 4, 2, 3] {
            local.insert(k, k * 10, usize::MAX, |_| {});
        }
        let mut out = Vec::new();
        while let Some((k, _)) = local.try_delete_min_local() {
            out.push(k);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_merges_follow_binary_counter_powers() {
        let local: DlsmLocal<u32, u32> = DlsmLocal::default();
        for k in 0..4u32 {
            local.insert(k, k, usize::MAX, |_| {});
        }
        let blocks = local.blocks.borrow();
        assert_eq!(blocks.len(), 1);
        assert_eq!(unsafe { &*blocks[0] }.power(), 2);
    }

    #[test]
    fn test_handoff_triggers_above_threshold() {
        let local: DlsmLocal<u32, u32> = DlsmLocal::default();
        let handed_off: RefCell<Vec<u32>> = RefCell::new(Vec::new());
        local.insert(1, 1, 1, |block| {
            let b = unsafe { &*block };
            for (k, ..) in b.iter_weak() {
                handed_off.borrow_mut().push(k);
            }
        });
        assert_eq!(*handed_off.borrow(), vec![1]);
        assert!(local.blocks.borrow().is_empty());
    }

    #[test]
    fn test_find_min_does_not_remove() {
        let local: DlsmLocal<u32, u32> = DlsmLocal::default();
        local.insert(7, 70, usize::MAX, |_| {});
        assert_eq!(local.find_min(), Some(7));
        assert_eq!(local.find_min(), Some(7));
        assert_eq!(local.try_delete_min_local(), Some((7, 70)));
        assert_eq!(local.try_delete_min_local(), None);
    }

    #[test]
    fn test_spy_copies_victim_head_block() {
        let victim: DlsmLocal<u32, u32> = DlsmLocal::default();
        victim.insert(9, 90, usize::MAX, |_| {});

        let thief: DlsmLocal<u32, u32> = DlsmLocal::default();
        assert!(thief.spy(&victim));
        assert_eq!(thief.try_delete_min_local(), Some((9, 90)));
    }

    #[test]
    fn test_spy_fails_when_locally_nonempty() {
        let victim: DlsmLocal<u32, u32> = DlsmLocal::default();
        victim.insert(1, 1, usize::MAX, |_| {});

        let thief: DlsmLocal<u32, u32> = DlsmLocal::default();
        thief.insert(2, 2, usize::MAX, |_| {});
        assert!(!thief.spy(&victim));
    }
}
