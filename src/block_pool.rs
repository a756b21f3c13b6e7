//! The per-thread block pool.
//!
//! Ported from `shared_lsm/block_pool.h`: four slots per power of two, up
//! to `MAX_POWER_OF_2` powers, each slot tagged `Free`, `Local`, or
//! `Global(version)`. `get_block` prefers a free slot; failing that, it
//! reclaims the oldest global slot at that power that does not hold the
//! *most recent* global version (invariant BP1: the newest global version
//! at a power is never reused out from under a reader). A block pool is
//! owned by exactly one thread; all bookkeeping is plain (non-atomic)
//! interior mutability.

use crate::block::Block;
use std::cell::Cell;

/// Four slots per power of two, matching the original's
/// `BLOCKS_PER_LEVEL`.
const BLOCKS_PER_LEVEL: usize = 4;

/// Matches the original's `MAX_POWER_OF_2`.
const MAX_POWER_OF_2: u32 = 48;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Free,
    Local,
    Global,
}

struct Slot<K, V> {
    status: Cell<Status>,
    version: Cell<u32>,
    block: Cell<Option<*mut Block<K, V>>>,
}

impl<K, V> Default for Slot<K, V> {
    fn default() -> Self {
        Self {
            status: Cell::new(Status::Free),
            version: Cell::new(0),
            block: Cell::new(None),
        }
    }
}

/// A per-thread pool of pre-sized blocks.
pub struct BlockPool<K, V> {
    levels: Box<[[Slot<K, V>; BLOCKS_PER_LEVEL]]>,
}

unsafe impl<K: Send, V: Send> Send for BlockPool<K, V> {}
unsafe impl<K: Send, V: Send> Sync for BlockPool<K, V> {}

impl<K: Ord + Copy, V: Copy> BlockPool<K, V> {
    /// Create an empty pool. No blocks are allocated until first use.
    pub fn new() -> Self {
        let levels = (0..MAX_POWER_OF_2)
            .map(|_| std::array::from_fn(|_| Slot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { levels }
    }

    fn max_global_version(&self, power: u32) -> Option<u32> {
        self.levels[power as usize]
            .iter()
            .filter(|s| s.status.get() == Status::Global)
            .map(|s| s.version.get())
            .max()
    }

    /// Acquire a block of the given power, marking it `Local`. Panics if
    /// every slot at that power is the current maximum global version
    /// (pool exhaustion is a fatal programming error per the error
    /// handling design).
    pub fn get_block(&self, power: u32) -> *const Block<K, V> {
        assert!(power < MAX_POWER_OF_2, "relaxed_pq: block power out of range");
        let slots = &self.levels[power as usize];

        if let Some(slot) = slots.iter().find(|s| s.status.get() == Status::Free) {
            return self.hand_out(slot, power);
        }

        let max_v = self.max_global_version(power);
        let reclaimable = slots
            .iter()
            .filter(|s| s.status.get() == Status::Global && Some(s.version.get()) != max_v)
            .min_by_key(|s| s.version.get());

        match reclaimable {
            Some(slot) => self.hand_out(slot, power),
            None => panic!(
                "relaxed_pq: block pool exhausted at power {power}: all {BLOCKS_PER_LEVEL} slots hold the newest global version"
            ),
        }
    }

    fn hand_out(&self, slot: &Slot<K, V>, power: u32) -> *const Block<K, V> {
        let ptr = match slot.block.get() {
            Some(ptr) => ptr,
            None => {
                let boxed = Box::into_raw(Box::new(Block::new(power)));
                slot.block.set(Some(boxed));
                boxed
            }
        };
        // SAFETY: `ptr` is owned exclusively by this pool and only ever
        // reset here, while `Local` (i.e. not concurrently readable).
        unsafe { (*ptr).reset() };
        slot.status.set(Status::Local);
        ptr as *const _
    }

    fn find_slot(&self, block: *const Block<K, V>) -> Option<&Slot<K, V>> {
        for level in self.levels.iter() {
            for slot in level.iter() {
                if slot.block.get() == Some(block as *mut _) {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Transition every listed, currently-`Local` block to `Global`,
    /// stamped with `version`.
    pub fn publish(&self, blocks: &[*const Block<K, V>], version: u32) {
        for &block in blocks {
            if let Some(slot) = self.find_slot(block) {
                slot.status.set(Status::Global);
                slot.version.set(version);
            }
        }
    }

    /// Demote every `Local` slot back to `Free`.
    pub fn free_local(&self) {
        for level in self.levels.iter() {
            for slot in level.iter() {
                if slot.status.get() == Status::Local {
                    slot.status.set(Status::Free);
                }
            }
        }
    }

    /// Demote a single block back to `Free`, regardless of its current
    /// status (used when a block is retired from a local structure, e.g.
    /// a merged-away `dlsm`/`slsm` block).
    pub fn release(&self, block: *const Block<K, V>) {
        if let Some(slot) = self.find_slot(block) {
            slot.status.set(Status::Free);
        }
    }

    /// Demote every `Local` slot back to `Free`, except the one holding
    /// `keep` (used when a failed publish attempt must retry while still
    /// holding on to the block it was trying to insert).
    pub fn free_local_except(&self, keep: *const Block<K, V>) {
        for level in self.levels.iter() {
            for slot in level.iter() {
                if slot.status.get() == Status::Local && slot.block.get() != Some(keep as *mut _) {
                    slot.status.set(Status::Free);
                }
            }
        }
    }
}

impl<K: Ord + Copy, V: Copy> Default for BlockPool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for BlockPool<K, V> {
    fn drop(&mut self) {
        for level in self.levels.iter() {
            for slot in level.iter() {
                if let Some(ptr) = slot.block.get() {
                    // SAFETY: each slot's block is allocated at most once
                    // and only freed here, once, on pool teardown.
                    unsafe {
                        drop(Box::from_raw(ptr));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_block_free_slot() {
        let pool: BlockPool<u32, u32> = BlockPool::new();
        let b = pool.get_block(3);
        assert_eq!(unsafe { &*b }.power(), 3);
    }

    #[test]
    fn test_publish_then_reacquire_distinct_until_exhausted() {
        let pool: BlockPool<u32, u32> = BlockPool::new();
        let mut acquired = Vec::new();
        for v in 0..4u32 {
            let b = pool.get_block(2);
            acquired.push(b);
            pool.publish(&[b], v);
        }
        // four distinct slots used, all global now; acquiring once more
        // must reclaim the oldest non-maximum version (version 0).
        let next = pool.get_block(2);
        assert_eq!(next, acquired[0]);
    }

    #[test]
    fn test_free_local_allows_reuse() {
        let pool: BlockPool<u32, u32> = BlockPool::new();
        let a = pool.get_block(1);
        pool.free_local();
        let b = pool.get_block(1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_free_local_except_keeps_one() {
        let pool: BlockPool<u32, u32> = BlockPool::new();
        let a = pool.get_block(1);
        let b = pool.get_block(1);
        pool.free_local_except(a);
        // b was demoted to free, a was kept local
        let c = pool.get_block(1);
        assert_eq!(c, b);
    }

    #[test]
    #[should_panic(expected = "block pool exhausted")]
    fn test_exhaustion_panics() {
        // Publish all four slots at the same version: none is reclaimable
        // since every slot ties for "the most recent global version".
        let pool: BlockPool<u32, u32> = BlockPool::new();
        for _ in 0..4u32 {
            let b = pool.get_block(0);
            pool.publish(&[b], 5);
        }
        pool.get_block(0);
    }
}
