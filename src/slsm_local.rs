//! SLSM local: one thread's staging area for publishing into the shared
//! block array.
//!
//! Ported from `shared_lsm/shared_lsm_local.h`/`_inl.h`. Each thread owns
//! its own item pool and block pool (so its own allocations never
//! contend with another thread's), a plain working copy of the last
//! observed global array, and two `ALIGN`-aligned swap arrays that
//! alternate as the next published candidate -- the double buffer
//! [`crate::versioned_ptr::VersionedArrayPtr`] is built for. Publishing
//! is the original's five-step dance: refresh the local copy under a
//! before/after version check, merge the new block into a swap copy,
//! bump that copy's version, then race everyone else to `compare_exchange`
//! the global pointer onto it.

use crate::block::Block;
use crate::block_array::BlockArray;
use crate::block_pool::BlockPool;
use crate::bounded::Bounded;
use crate::item::Item;
use crate::pool::ItemPool;
use crate::spinlock::FasLock;
use crate::thread::current_tid;
use crate::versioned_ptr::{alloc_aligned, VersionedArrayPtr, DEFAULT_ALIGNMENT};
use std::cell::Cell;

/// A versioned pointer to a [`BlockArray`], aligned the way the shared
/// global referent and every thread's swap arrays must be.
pub type GlobalPtr<K, V, const R: usize> = VersionedArrayPtr<BlockArray<K, V, R>, DEFAULT_ALIGNMENT>;

pub struct SlsmLocal<K, V, const R: usize> {
    item_pool: ItemPool<K, V>,
    block_pool: BlockPool<K, V>,
    local: BlockArray<K, V, R>,
    swap: [*mut BlockArray<K, V, R>; 2],
    next_swap: Cell<usize>,
    cached_best: Cell<Option<(*const Item<K, V>, u32, K)>>,
    seeded: Cell<bool>,
}

unsafe impl<K: Send, V: Send, const R: usize> Send for SlsmLocal<K, V, R> {}
unsafe impl<K: Send, V: Send, const R: usize> Sync for SlsmLocal<K, V, R> {}

impl<K: Bounded, V: Copy, const R: usize> Default for SlsmLocal<K, V, R> {
    fn default() -> Self {
        Self {
            item_pool: ItemPool::new(),
            block_pool: BlockPool::new(),
            local: BlockArray::new(),
            swap: [
                alloc_aligned(DEFAULT_ALIGNMENT, BlockArray::new),
                alloc_aligned(DEFAULT_ALIGNMENT, BlockArray::new),
            ],
            next_swap: Cell::new(0),
            cached_best: Cell::new(None),
            seeded: Cell::new(false),
        }
    }
}

impl<K: Bounded, V: Copy, const R: usize> SlsmLocal<K, V, R> {
    /// Reseed every relaxed-selection generator this thread owns (its
    /// local working copy and both swap candidates), once, the first time
    /// this thread touches its slot.
    fn ensure_seeded(&self) {
        if self.seeded.get() {
            return;
        }
        let tid = current_tid();
        self.local.seed_rng(tid);
        // SAFETY: both swap arrays are exclusively owned by this thread
        // until published; no concurrent access is possible here.
        unsafe {
            (*self.swap[0]).seed_rng(tid);
            (*self.swap[1]).seed_rng(tid);
        }
        self.seeded.set(true);
    }

    fn refresh_local(&self, global: &GlobalPtr<K, V, R>, guard: &FasLock<()>) -> usize {
        loop {
            let before = global.load_packed();
            let ptr = GlobalPtr::<K, V, R>::unpack(before);
            {
                let _g = guard.lock();
                // SAFETY: `ptr` targets either the initial referent or a
                // swap array some thread already published; both are
                // never freed for the lifetime of the queue.
                self.local.copy_from(unsafe { &*ptr });
            }
            let after = global.load_packed();
            if before == after {
                return before;
            }
        }
    }

    fn publish_block(&self, block: *const Block<K, V>, global: &GlobalPtr<K, V, R>, guard: &FasLock<()>) {
        self.ensure_seeded();
        loop {
            let observed = self.refresh_local(global, guard);
            let swap_idx = self.next_swap.get();
            // SAFETY: this thread is the only one that ever mutates its
            // own swap arrays, until the moment they are CAS'd in below.
            let swap = unsafe { &*self.swap[swap_idx] };
            swap.copy_from(&self.local);
            swap.insert(block, &self.block_pool);
            swap.increment_version();
            let new_version = swap.version();

            match global.compare_exchange(observed, self.swap[swap_idx], new_version) {
                Ok(_) => {
                    self.next_swap.set(1 - swap_idx);
                    self.block_pool.publish(&swap.block_ptrs(), new_version);
                    self.block_pool.free_local();
                    return;
                }
                Err(_) => {
                    self.block_pool.free_local_except(block);
                    // loop: try again against whatever is now published
                }
            }
        }
    }

    /// Build a fresh item and capacity-1 block for `key`/`value`, then
    /// publish it.
    pub fn insert(&self, key: K, value: V, global: &GlobalPtr<K, V, R>, guard: &FasLock<()>) {
        let item = self.item_pool.acquire();
        let version = item.initialize(key, value);
        let block = self.block_pool.get_block(0);
        // SAFETY: `block` was just acquired from this thread's own pool
        // and is not yet visible to anyone else.
        unsafe { (*block).insert(key, item as *const _, version) };
        self.publish_block(block, global, guard);
    }

    /// Publish a block this thread did not allocate itself (a DLSM
    /// handoff, section 4.13): its contents are merged into the shared
    /// array exactly as a freshly built block would be.
    pub fn adopt(&self, block: *const Block<K, V>, global: &GlobalPtr<K, V, R>, guard: &FasLock<()>) {
        self.publish_block(block, global, guard);
    }

    /// The version of this thread's most recently refreshed local copy
    /// of the global array (P5: observed only to increase across this
    /// thread's successive operations).
    pub fn local_version(&self) -> u32 {
        self.local.version()
    }

    /// Peek the approximately-minimal key across the shared array without
    /// removing it, short-circuiting through a cached candidate when it
    /// is still live.
    pub fn peek(&self, global: &GlobalPtr<K, V, R>, guard: &FasLock<()>) -> Option<K> {
        self.ensure_seeded();
        if let Some((item, version, key)) = self.cached_best.get() {
            // SAFETY: stable pointer into some thread's item pool.
            if unsafe { &*item }.version() == version {
                return Some(key);
            }
        }
        loop {
            let before = global.load_packed();
            let ptr = GlobalPtr::<K, V, R>::unpack(before);
            let result = {
                let _g = guard.lock();
                // SAFETY: see `refresh_local`.
                unsafe { &*ptr }.peek()
            };
            let after = global.load_packed();
            if before == after {
                return result.map(|(k, item, _, v)| {
                    self.cached_best.set(Some((item, v, k)));
                    k
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_global() -> GlobalPtr<u32, u32, 8> {
        GlobalPtr::new(alloc_aligned(DEFAULT_ALIGNMENT, BlockArray::<u32, u32, 8>::new), 0)
    }

    #[test]
    fn test_insert_then_peek_reports_min() {
        let global = fresh_global();
        let guard = FasLock::new(());
        let local: SlsmLocal<u32, u32, 8> = SlsmLocal::default();

        local.insert(5, 50, &global, &guard);
        local.insert(2, 20, &global, &guard);

        assert_eq!(local.peek(&global, &guard), Some(2));
    }

    #[test]
    fn test_cached_best_short_circuits_until_stale() {
        let global = fresh_global();
        let guard = FasLock::new(());
        let local: SlsmLocal<u32, u32, 8> = SlsmLocal::default();

        local.insert(4, 40, &global, &guard);
        assert_eq!(local.peek(&global, &guard), Some(4));
        // Re-peeking hits the cache and still reports the same key.
        assert_eq!(local.peek(&global, &guard), Some(4));
    }

    #[test]
    fn test_adopt_merges_handed_off_block() {
        let global = fresh_global();
        let guard = FasLock::new(());
        let local: SlsmLocal<u32, u32, 8> = SlsmLocal::default();

        let other_pool: ItemPool<u32, u32> = ItemPool::new();
        let block: *const Block<u32, u32> = Box::into_raw(Box::new(Block::new(1)));
        for k in [7u32, 1] {
            let item = other_pool.acquire();
            let v = item.initialize(k, k);
            unsafe { (*block).insert(k, item as *const _, v) };
        }

        local.adopt(block, &global, &guard);
        assert_eq!(local.peek(&global, &guard), Some(1));
    }

    #[test]
    fn test_local_refresh_version_is_monotone() {
        // P5: this thread's observed local-copy version never regresses
        // across a sequence of its own operations, even while another
        // thread is concurrently publishing.
        let global = fresh_global();
        let guard = FasLock::new(());
        let local: SlsmLocal<u32, u32, 8> = SlsmLocal::default();
        let other: SlsmLocal<u32, u32, 8> = SlsmLocal::default();

        let mut last = local.local_version();
        for k in 0..20u32 {
            if k % 2 == 0 {
                local.insert(k, k, &global, &guard);
            } else {
                other.insert(k, k, &global, &guard);
            }
            local.peek(&global, &guard);
            let now = local.local_version();
            assert!(now >= last, "local version regressed: {now} < {last}");
            last = now;
        }
    }
}
