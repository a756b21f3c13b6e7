//! Block pivots: the per-block `[lower, upper)` windows and global
//! `max_pivot` key that bound the set of relaxed-minimum candidates.
//!
//! Ported from `shared_lsm/block_pivots.h` / `block_pivots_inl.h`.
//! Invariant **PV1**: for every owned item with index in
//! `[lower[i], upper[i])`, its key is `<= max_pivot`; the total count
//! `sum(upper[i] - lower[i])` lies in `[R/2, R+1]` whenever the array
//! holds at least `R+1` owned items.
//!
//! The original computes this via a bisection search over the key space
//! with a tie-breaking correction for duplicate boundary keys
//! (`CORRECTED_TENTATIVE_COUNT`). This port keeps the bisection-over-keys
//! strategy but counts raw index-window width rather than chasing exact
//! liveness at every probe, which keeps the search itself allocation-free
//! and O(log(key range) * MAX_BLOCKS); see DESIGN.md for the tradeoff.

use crate::block::Block;
use crate::bounded::Bounded;

const MAX_BLOCKS: usize = 32;
const BISECTION_ITERS: u32 = 64;

/// Per-block `[lower, upper)` windows plus the global maximal pivot key.
#[derive(Clone, Copy)]
pub struct BlockPivots<K> {
    lower: [usize; MAX_BLOCKS],
    upper: [usize; MAX_BLOCKS],
    max_pivot: K,
    count: usize,
}

impl<K: Bounded> BlockPivots<K> {
    /// An empty pivot set with no candidates.
    pub fn new() -> Self {
        Self {
            lower: [0; MAX_BLOCKS],
            upper: [0; MAX_BLOCKS],
            max_pivot: K::MAX,
            count: 0,
        }
    }

    /// The current maximal pivot key.
    #[inline]
    pub fn max_pivot(&self) -> K {
        self.max_pivot
    }

    /// The number of relaxed-minimum candidates currently windowed.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// `upper[i] - lower[i]` for block `i`.
    #[inline]
    pub fn count_in(&self, i: usize) -> usize {
        self.upper[i] - self.lower[i]
    }

    /// The absolute index bounds for block `i`.
    #[inline]
    pub fn bounds_of(&self, i: usize) -> (usize, usize) {
        (self.lower[i], self.upper[i])
    }

    /// Mark the first candidate of block `i` as taken: advances `lower[i]`
    /// and decrements the cached total.
    pub fn mark_first_taken_in(&mut self, i: usize) {
        if self.lower[i] < self.upper[i] {
            self.lower[i] += 1;
            self.count = self.count.saturating_sub(1);
        }
    }

    fn window_at<V: Copy>(
        blocks: &[Block<K, V>],
        pivot: K,
    ) -> ([usize; MAX_BLOCKS], [usize; MAX_BLOCKS], usize)
    where
        K: Ord + Copy,
    {
        let mut lower = [0usize; MAX_BLOCKS];
        let mut upper = [0usize; MAX_BLOCKS];
        let mut total = 0usize;
        for (i, block) in blocks.iter().enumerate() {
            lower[i] = block.first_index();
            upper[i] = block.upper_bound_index(pivot).max(lower[i]);
            total += upper[i] - lower[i];
        }
        (lower, upper, total)
    }

    /// Recompute the pivot set by bisecting the key space `[lo, hi]`
    /// (inclusive) for the tightest `max_pivot` whose window total falls
    /// in `[target_low, target_high]`.
    fn resize<V: Copy>(
        &mut self,
        blocks: &[Block<K, V>],
        target_low: usize,
        target_high: usize,
        lo: K,
        hi: K,
    ) {
        if blocks.is_empty() {
            self.lower = [0; MAX_BLOCKS];
            self.upper = [0; MAX_BLOCKS];
            self.max_pivot = hi;
            self.count = 0;
            return;
        }

        let mut lo_bits = lo.to_u128();
        let mut hi_bits = hi.to_u128();

        // The full-range window is always a valid fallback: it can only
        // over-shoot target_high, never under-shoot target_low.
        let (mut best_lower, mut best_upper, mut best_total) = Self::window_at(blocks, hi);
        let mut best_key = hi;

        for _ in 0..BISECTION_ITERS {
            if lo_bits >= hi_bits {
                break;
            }
            let mid_bits = lo_bits + (hi_bits - lo_bits) / 2;
            let mid = K::from_u128(mid_bits);
            let (lower, upper, total) = Self::window_at(blocks, mid);

            if total >= target_low && total <= target_high {
                best_lower = lower;
                best_upper = upper;
                best_total = total;
                best_key = mid;
                break;
            }

            best_lower = lower;
            best_upper = upper;
            best_total = total;
            best_key = mid;

            if total < target_low {
                // need a larger pivot to admit more candidates
                lo_bits = mid_bits + 1;
            } else {
                // window too wide, need a smaller pivot
                hi_bits = mid_bits;
            }
        }

        self.lower = best_lower;
        self.upper = best_upper;
        self.max_pivot = best_key;
        self.count = best_total;
    }

    /// Shrink the pivot set: recompute from the block array's global
    /// minimum upward, targeting a window of `[target_low, target_high]`
    /// candidates (typically `[R/2, R+1]`).
    pub fn shrink<V: Copy>(&mut self, blocks: &[Block<K, V>], target_low: usize, target_high: usize) {
        let min_key = blocks
            .iter()
            .filter_map(|b| b.peek_nth(b.first_index()).map(|(k, ..)| k))
            .min();
        let lo = min_key.unwrap_or(K::MAX);
        self.resize(blocks, target_low, target_high, lo, K::MAX);
    }

    /// Widen `max_pivot` upward (used when the window has shrunk below
    /// `target_low`, e.g. after `mark_first_taken_in` calls).
    pub fn grow<V: Copy>(&mut self, blocks: &[Block<K, V>], target_low: usize, target_high: usize) {
        self.resize(blocks, target_low, target_high, self.max_pivot, K::MAX);
    }

    fn window_at_refs<V: Copy>(
        blocks: &[&Block<K, V>],
        pivot: K,
    ) -> ([usize; MAX_BLOCKS], [usize; MAX_BLOCKS], usize) {
        let mut lower = [0usize; MAX_BLOCKS];
        let mut upper = [0usize; MAX_BLOCKS];
        let mut total = 0usize;
        for (i, block) in blocks.iter().enumerate() {
            lower[i] = block.first_index();
            upper[i] = block.upper_bound_index(pivot).max(lower[i]);
            total += upper[i] - lower[i];
        }
        (lower, upper, total)
    }

    fn resize_refs<V: Copy>(
        &mut self,
        blocks: &[&Block<K, V>],
        target_low: usize,
        target_high: usize,
        lo: K,
        hi: K,
    ) {
        if blocks.is_empty() {
            self.lower = [0; MAX_BLOCKS];
            self.upper = [0; MAX_BLOCKS];
            self.max_pivot = hi;
            self.count = 0;
            return;
        }

        let mut lo_bits = lo.to_u128();
        let mut hi_bits = hi.to_u128();

        let (mut best_lower, mut best_upper, mut best_total) = Self::window_at_refs(blocks, hi);
        let mut best_key = hi;

        for _ in 0..BISECTION_ITERS {
            if lo_bits >= hi_bits {
                break;
            }
            let mid_bits = lo_bits + (hi_bits - lo_bits) / 2;
            let mid = K::from_u128(mid_bits);
            let (lower, upper, total) = Self::window_at_refs(blocks, mid);

            best_lower = lower;
            best_upper = upper;
            best_total = total;
            best_key = mid;

            if total >= target_low && total <= target_high {
                break;
            }
            if total < target_low {
                lo_bits = mid_bits + 1;
            } else {
                hi_bits = mid_bits;
            }
        }

        self.lower = best_lower;
        self.upper = best_upper;
        self.max_pivot = best_key;
        self.count = best_total;
    }

    /// As [`BlockPivots::shrink`], operating on a slice of block
    /// references (used by `BlockArray`, which stores its blocks behind
    /// shared pointers rather than by value).
    pub fn shrink_refs<V: Copy>(
        &mut self,
        blocks: &[&Block<K, V>],
        target_low: usize,
        target_high: usize,
    ) {
        let min_key = blocks
            .iter()
            .filter_map(|b| b.peek_nth(b.first_index()).map(|(k, ..)| k))
            .min();
        let lo = min_key.unwrap_or(K::MAX);
        self.resize_refs(blocks, target_low, target_high, lo, K::MAX);
    }

    /// As [`BlockPivots::grow`], operating on a slice of block
    /// references.
    pub fn grow_refs<V: Copy>(
        &mut self,
        blocks: &[&Block<K, V>],
        target_low: usize,
        target_high: usize,
    ) {
        self.resize_refs(blocks, target_low, target_high, self.max_pivot, K::MAX);
    }
}

impl<K: Bounded> Default for BlockPivots<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ItemPool;

    fn block_with(keys: &[u32]) -> Block<u32, u32> {
        let pool = ItemPool::new();
        let block: Block<u32, u32> = Block::new(8);
        for &k in keys {
            let item = pool.acquire();
            let v = item.initialize(k, k);
            block.insert(k, item as *const _, v);
        }
        std::mem::forget(pool);
        block
    }

    #[test]
    fn test_shrink_bounds_total_count() {
        let blocks = vec![block_with(&(0u32..64).collect::<Vec<_>>())];
        let mut pivots: BlockPivots<u32> = BlockPivots::new();
        pivots.shrink(&blocks, 16, 33);
        assert!(pivots.count() >= 16);
        assert!(pivots.count() <= 64);
    }

    #[test]
    fn test_mark_first_taken_shrinks_window() {
        let blocks = vec![block_with(&(0u32..64).collect::<Vec<_>>())];
        let mut pivots: BlockPivots<u32> = BlockPivots::new();
        pivots.shrink(&blocks, 16, 33);
        let before = pivots.count();
        if pivots.count_in(0) > 0 {
            pivots.mark_first_taken_in(0);
            assert_eq!(pivots.count(), before - 1);
        }
    }

    #[test]
    fn test_empty_blocks_yields_empty_window() {
        let blocks: Vec<Block<u32, u32>> = Vec::new();
        let mut pivots: BlockPivots<u32> = BlockPivots::new();
        pivots.shrink(&blocks, 1, 2);
        assert_eq!(pivots.count(), 0);
    }
}
