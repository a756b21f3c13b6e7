//! The shared block array: SLSM's globally published collection of
//! blocks.
//!
//! Ported from `shared_lsm/block_array.h`/`_inl.h`. Blocks are kept
//! largest-to-smallest with at most one block per capacity while the
//! array is visible to other threads (mirroring `dist_lsm_local`'s own
//! invariant). `insert` merges equal-capacity neighbors on the way in;
//! `compact` additionally shrinks half-empty blocks and merges
//! mis-ordered neighbors afterward. `delete_min` is the one place this
//! port goes beyond the original: rather than a linear scan (left as a
//! `TODO: Uniformly random relaxed deletion using pivots` in the
//! source), it samples uniformly from the [`BlockPivots`] window, per
//! this crate's relaxed `delete_min` contract.

use crate::block::Block;
use crate::block_pool::BlockPool;
use crate::bounded::Bounded;
use crate::pivots::BlockPivots;
use crate::random::XorShift96;
use std::cell::Cell;

/// Matches `block_array::MAX_BLOCKS`.
pub const MAX_BLOCKS: usize = 32;

/// A published, size-ordered collection of blocks with a pivot-bounded
/// relaxed `delete_min`.
pub struct BlockArray<K, V, const R: usize> {
    blocks: [Cell<Option<*const Block<K, V>>>; MAX_BLOCKS],
    size: Cell<usize>,
    pivots: Cell<BlockPivots<K>>,
    version: Cell<u32>,
    rng: Cell<XorShift96>,
}

unsafe impl<K: Send, V: Send, const R: usize> Send for BlockArray<K, V, R> {}
unsafe impl<K: Send, V: Send, const R: usize> Sync for BlockArray<K, V, R> {}

impl<K: Bounded, V: Copy, const R: usize> BlockArray<K, V, R> {
    /// An empty array at version 0, seeded with a fixed generator (real
    /// instances are always reached through a per-thread pool whose
    /// owner reseeds lazily via [`crate::random::XorShift96::seeded_from_tid`]
    /// on first use; see `slsm.rs`).
    pub fn new() -> Self {
        Self {
            blocks: std::array::from_fn(|_| Cell::new(None)),
            size: Cell::new(0),
            pivots: Cell::new(BlockPivots::new()),
            version: Cell::new(0),
            rng: Cell::new(XorShift96::seeded_from_tid(0)),
        }
    }

    /// Reseed this array's relaxed-selection generator (called once by
    /// the owning SLSM local right after construction).
    pub fn seed_rng(&self, tid: u32) {
        self.rng.set(XorShift96::seeded_from_tid(tid));
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.get()
    }

    #[inline]
    pub fn increment_version(&self) {
        self.version.set(self.version.get().wrapping_add(1));
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.get()
    }

    fn block_at(&self, i: usize) -> Option<&Block<K, V>> {
        // SAFETY: every stored pointer targets a block kept alive by some
        // thread's `BlockPool` for the lifetime of the queue.
        self.blocks[i].get().map(|p| unsafe { &*p })
    }

    /// Insert `new_block` (allocated via `pool`), preserving the
    /// strictly-descending-capacity invariant by merging equal-capacity
    /// neighbors, then compact.
    pub fn insert(&self, new_block: *const Block<K, V>, pool: &BlockPool<K, V>) {
        let size = self.size.get();
        let new_cap = unsafe { (*new_block).capacity() };

        let mut i = 0;
        while i < size {
            let cap = self.block_at(i).map(|b| b.capacity()).unwrap_or(0);
            if cap < new_cap {
                break;
            }
            i += 1;
        }

        let mut insert_block = new_block;
        let mut j = i;
        while j > 0 {
            let other = self.blocks[j - 1].get();
            match other {
                None => {
                    j -= 1;
                    continue;
                }
                Some(other_ptr) => {
                    let other_cap = unsafe { (*other_ptr).capacity() };
                    let insert_cap = unsafe { (*insert_block).capacity() };
                    if other_cap > insert_cap {
                        break;
                    }
                    let merged_power = unsafe { (*insert_block).power() } + 1;
                    let merged = pool.get_block(merged_power);
                    let merged_block = unsafe { &*merged };
                    let (lhs, rhs) = unsafe { (&*insert_block, &*other_ptr) };
                    for (k, it, _, v) in lhs.iter_weak().chain(rhs.iter_weak()) {
                        merged_block.insert(k, it, v);
                    }
                    insert_block = merged;
                    self.blocks[j - 1].set(None);
                    j -= 1;
                }
            }
        }

        for slot in (j..size).rev() {
            let moved = self.blocks[slot].get();
            self.blocks[slot + 1].set(moved);
        }
        self.blocks[j].set(Some(insert_block));
        self.size.set(size + 1);

        self.compact(pool);
        self.recompute_pivots();
    }

    fn compact(&self, pool: &BlockPool<K, V>) {
        self.remove_null_blocks();
        let size = self.size.get();

        for i in 0..size {
            if let Some(b) = self.block_at(i) {
                if b.owned_len() < b.capacity() / 2 && b.power() > 0 {
                    let shrunk = pool.get_block(b.power() - 1);
                    let shrunk_block = unsafe { &*shrunk };
                    for (k, it, _, v) in b.iter_weak() {
                        shrunk_block.insert(k, it, v);
                    }
                    self.blocks[i].set(Some(shrunk));
                }
            }
        }

        if size >= 2 {
            for i in (0..size - 1).rev() {
                let big = self.block_at(i);
                let small = self.block_at(i + 1);
                if let (Some(big_b), Some(small_b)) = (big, small) {
                    if big_b.power() > small_b.power() {
                        continue;
                    }
                    let mut merge_pow = big_b.power().max(small_b.power());
                    if big_b.owned_len() + small_b.owned_len() > (1usize << merge_pow) {
                        merge_pow += 1;
                    }
                    let merged = pool.get_block(merge_pow);
                    let merged_block = unsafe { &*merged };
                    for (k, it, _, v) in big_b.iter_weak().chain(small_b.iter_weak()) {
                        merged_block.insert(k, it, v);
                    }
                    self.blocks[i + 1].set(None);
                    self.blocks[i].set(Some(merged));
                }
            }
        }

        self.remove_null_blocks();
    }

    fn remove_null_blocks(&self) {
        let size = self.size.get();
        let mut dst = 0;
        for src in 0..size {
            if let Some(b) = self.blocks[src].get() {
                self.blocks[dst].set(Some(b));
                dst += 1;
            }
        }
        for slot in dst..size {
            self.blocks[slot].set(None);
        }
        self.size.set(dst);
    }

    fn recompute_pivots(&self) {
        let size = self.size.get();
        let mut owned: Vec<&Block<K, V>> = Vec::with_capacity(size);
        for i in 0..size {
            if let Some(b) = self.block_at(i) {
                owned.push(b);
            }
        }
        let target_low = (R + 1) / 2;
        let target_high = R + 1;
        let mut pivots = self.pivots.take();
        pivots.shrink_refs(&owned, target_low, target_high);
        self.pivots.set(pivots);
    }

    /// Non-consuming query for the overall minimum (used by `find_min`);
    /// a plain linear scan, matching the original's own `peek()`.
    pub fn peek(&self) -> Option<(K, *const crate::item::Item<K, V>, usize, u32)> {
        let size = self.size.get();
        let mut best: Option<(K, *const crate::item::Item<K, V>, usize, u32)> = None;
        for i in 0..size {
            if let Some(b) = self.block_at(i) {
                if let Some(candidate) = b.peek() {
                    if best.is_none() || candidate.0 < best.unwrap().0 {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }

    /// Relaxed `delete_min`: sample uniformly within the pivot window and
    /// translate the sample to a `(block, index)` pair via cumulative
    /// `count_in`. Retries on a lost race (the sampled slot already
    /// taken by someone else) up to the number of candidates currently
    /// windowed, then falls back to `peek`'s linear scan.
    pub fn delete_min(&self) -> Option<(K, V)> {
        let total = self.pivots.get().count();
        if total > 0 {
            for _ in 0..total {
                let pivots = self.pivots.get();
                let sample = {
                    let mut rng = self.rng.get();
                    let s = rng.next_below(pivots.count());
                    self.rng.set(rng);
                    s
                };
                let mut remaining = sample;
                let size = self.size.get();
                for i in 0..size {
                    let in_i = pivots.count_in(i);
                    if remaining < in_i {
                        let (lower, _) = pivots.bounds_of(i);
                        let abs = lower + remaining;
                        if let Some(b) = self.block_at(i) {
                            if let Some((k, v)) = b.take_at(abs) {
                                let mut p = self.pivots.get();
                                p.mark_first_taken_in(i);
                                self.pivots.set(p);
                                return Some((k, v));
                            }
                        }
                        break;
                    }
                    remaining -= in_i;
                }
                self.recompute_pivots();
            }
        }

        let (k, item, _, v) = self.peek()?;
        unsafe { (*item).take(v) }.map(|(_, val)| (k, val))
    }

    /// Every currently-owned block pointer, in largest-to-smallest
    /// order (used by SLSM to stamp a freshly published array's blocks
    /// `Global` in the block pool).
    pub fn block_ptrs(&self) -> Vec<*const Block<K, V>> {
        let size = self.size.get();
        (0..size).filter_map(|i| self.blocks[i].get()).collect()
    }

    /// Shallow-copy `that`'s block pointers into `self`.
    pub fn copy_from(&self, that: &BlockArray<K, V, R>) {
        self.version.set(that.version.get());
        let size = that.size.get();
        for i in 0..size {
            self.blocks[i].set(that.blocks[i].get());
        }
        for i in size..MAX_BLOCKS {
            self.blocks[i].set(None);
        }
        self.size.set(size);
        self.pivots.set(that.pivots.get());
    }
}

impl<K: Bounded, V: Copy, const R: usize> Default for BlockArray<K, V, R> {
    fn default() -> Self {
        Self::new()
    }
}
