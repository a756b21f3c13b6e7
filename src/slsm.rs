//! SLSM: the shared-array distributed log-structured merge queue.
//!
//! Ported from `shared_lsm/shared_lsm.h`. A single globally published
//! [`BlockArray`], reached through a [`VersionedArrayPtr`] so threads can
//! race to publish a new version with `compare_exchange` rather than
//! taking a lock for the whole structure.
//!
//! `BlockArray`'s own bookkeeping (`pivots`, `rng`, its block slots) is
//! plain `Cell`-based interior mutability, sound only under the
//! original's assumption that a given published array is read by many
//! threads but mutated by none until it is swapped out. `delete_min`
//! breaks that assumption: it mutates the *live* published array in
//! place. `global_guard` serializes the three operations that touch the
//! currently-published array (refreshing a thread's local copy,
//! `delete_min`, and `find_min`'s direct peek) so that assumption holds
//! again, at the cost of serializing what would otherwise be concurrent
//! reads -- a deliberate soundness-over-lock-freedom tradeoff (see
//! DESIGN.md).

use crate::block::Block;
use crate::block_array::BlockArray;
use crate::slsm_local::{GlobalPtr, SlsmLocal};
use crate::spinlock::FasLock;
use crate::thread::Tlv;
use crate::versioned_ptr::alloc_aligned;

/// A shared-array distributed log-structured merge priority queue.
pub struct Slsm<K, V, const R: usize> {
    array: GlobalPtr<K, V, R>,
    locals: Tlv<SlsmLocal<K, V, R>>,
    global_guard: FasLock<()>,
}

impl<K, V, const R: usize> Slsm<K, V, R>
where
    K: crate::bounded::Bounded,
    V: Copy,
{
    /// A fresh, empty SLSM.
    pub fn new() -> Self {
        Self {
            array: GlobalPtr::new(
                alloc_aligned(crate::versioned_ptr::DEFAULT_ALIGNMENT, BlockArray::<K, V, R>::new),
                0,
            ),
            locals: Tlv::new(),
            global_guard: FasLock::new(()),
        }
    }

    /// Register the calling thread's staging area up front.
    pub fn init_thread(&self) {
        self.locals.get_current();
    }

    /// Insert a key/value pair, built and published by the calling
    /// thread's own staging area.
    pub fn insert(&self, key: K, value: V) {
        self.locals.get_current().insert(key, value, &self.array, &self.global_guard);
    }

    /// Publish a block this thread did not build itself (a DLSM handoff,
    /// section 4.13). The calling thread's own staging area performs the
    /// publish, exactly as it would for a freshly inserted key.
    pub fn insert_block(&self, block: *const Block<K, V>) {
        self.locals.get_current().adopt(block, &self.array, &self.global_guard);
    }

    /// Remove and return some approximately-minimal key/value pair from
    /// the shared array, or `None` if it is observed empty.
    pub fn delete_min(&self) -> Option<(K, V)> {
        let _g = self.global_guard.lock();
        let ptr = GlobalPtr::<K, V, R>::unpack(self.array.load_packed());
        // SAFETY: `ptr` targets the initial referent or a published swap
        // array, neither ever freed for the lifetime of the queue; the
        // lock held above serializes this against every other touch of
        // the currently-live array.
        unsafe { &*ptr }.delete_min()
    }

    /// Peek at some approximately-minimal key without removing it.
    pub fn find_min(&self) -> Option<K> {
        self.locals.get_current().peek(&self.array, &self.global_guard)
    }
}

impl<K, V, const R: usize> Default for Slsm<K, V, R>
where
    K: crate::bounded::Bounded,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<K: Send, V: Send, const R: usize> Send for Slsm<K, V, R> {}
unsafe impl<K: Send, V: Send, const R: usize> Sync for Slsm<K, V, R> {}
