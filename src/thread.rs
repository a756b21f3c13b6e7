//! Thread registry and the lock-free per-thread slot vector.
//!
//! Every per-thread structure in this crate (item pools, block pools,
//! DLSM locals, CAPQ put/delete-min buffers) is reached through a
//! [`Tlv`] keyed by a dense, permanent thread id handed out by this
//! module. Ids are process-wide and never reused, matching the
//! original's `thread_local_ptr.h`: a real OS thread-local caches each
//! thread's id so repeat lookups cost nothing beyond the cache read.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

static NEXT_TID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CACHED_TID: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Return the calling thread's dense, permanent id, allocating one on
/// first use.
///
/// Allocation is wait-free: a single `fetch_add` on a process-wide
/// counter. Crossing `u32::MAX` is the thread-identity-overflow fatal
/// condition named in the error handling design.
#[inline]
pub fn current_tid() -> u32 {
    CACHED_TID.with(|cell| {
        if let Some(tid) = cell.get() {
            return tid;
        }
        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        if tid == u32::MAX {
            panic!("relaxed_pq: thread id counter overflowed u32");
        }
        cell.set(Some(tid));
        tid
    })
}

/// The current upper bound on allocated thread ids (i.e. the number of
/// threads that have ever called [`current_tid`]).
#[inline]
pub fn max_tid() -> u32 {
    NEXT_TID.load(Ordering::Relaxed)
}

/// A bucket-array-of-buckets-sized-`2^b` lock-free, never-shrinking
/// per-thread slot vector.
///
/// Bucket `b` holds `2^b` slots, so element `i` (0-indexed) lives in
/// bucket `floor(log2(i + 1))` at offset `i + 1 - 2^b`. A bucket is
/// allocated lazily by a single CAS on its `null` slot; a thread that
/// loses the race frees its redundant allocation. No element is ever
/// moved, so references returned by [`Tlv::get`] are stable for the
/// lifetime of the `Tlv`.
pub struct Tlv<T> {
    buckets: [AtomicPtr<T>; Tlv::<T>::NUM_BUCKETS],
}

impl<T: Default> Tlv<T> {
    const NUM_BUCKETS: usize = 32;

    /// Create an empty slot vector. No buckets are allocated yet.
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    #[inline]
    fn bucket_of(index: usize) -> (usize, usize, usize) {
        let n = index + 1;
        let bucket = usize::BITS as usize - 1 - n.leading_zeros() as usize;
        let bucket_len = 1usize << bucket;
        let offset = n - bucket_len;
        (bucket, bucket_len, offset)
    }

    /// Return a stable reference to the slot for thread id `index`,
    /// default-constructing it on first access.
    pub fn get(&self, index: usize) -> &T {
        let (bucket, bucket_len, offset) = Self::bucket_of(index);
        let slot = &self.buckets[bucket];

        let mut ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            let mut new_bucket: Vec<T> = Vec::with_capacity(bucket_len);
            for _ in 0..bucket_len {
                new_bucket.push(T::default());
            }
            let raw = Box::into_raw(new_bucket.into_boxed_slice()) as *mut T;

            match slot.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => ptr = raw,
                Err(existing) => {
                    // SAFETY: `raw` was never published, reclaim it.
                    unsafe {
                        drop(Box::from_raw(std::slice::from_raw_parts_mut(
                            raw,
                            bucket_len,
                        )));
                    }
                    ptr = existing;
                }
            }
        }

        // SAFETY: `ptr` points at a live, `bucket_len`-element array; the
        // array is never moved or freed for the lifetime of `self`.
        unsafe { &*ptr.add(offset) }
    }

    /// Return the calling thread's slot, allocating its id if necessary.
    #[inline]
    pub fn get_current(&self) -> &T {
        self.get(current_tid() as usize)
    }
}

impl<T: Default> Default for Tlv<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Tlv<T> {
    fn drop(&mut self) {
        for (bucket, slot) in self.buckets.iter().enumerate() {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                let bucket_len = 1usize << bucket;
                // SAFETY: this bucket was allocated with exactly `bucket_len`
                // elements and is only ever freed here, once, on drop.
                unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(
                        ptr,
                        bucket_len,
                    )));
                }
            }
        }
    }
}

unsafe impl<T: Send> Send for Tlv<T> {}
unsafe impl<T: Send> Sync for Tlv<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_current_tid_stable_within_thread() {
        let a = current_tid();
        let b = current_tid();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tlv_get_is_stable() {
        let tlv: Tlv<Cell<i32>> = Tlv::new();
        tlv.get(0).set(42);
        assert_eq!(tlv.get(0).get(), 42);
        // spans a bucket boundary (index 0 is bucket 0, index 1 is bucket 1)
        tlv.get(1).set(7);
        assert_eq!(tlv.get(1).get(), 7);
        assert_eq!(tlv.get(0).get(), 42);
    }

    #[test]
    fn test_tlv_many_indices() {
        let tlv: Tlv<Cell<usize>> = Tlv::new();
        for i in 0..200 {
            tlv.get(i).set(i);
        }
        for i in 0..200 {
            assert_eq!(tlv.get(i).get(), i);
        }
    }

    #[test]
    fn test_tlv_concurrent_distinct_threads_get_distinct_slots() {
        let tlv: Arc<Tlv<Cell<u32>>> = Arc::new(Tlv::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let tlv = Arc::clone(&tlv);
            handles.push(std::thread::spawn(move || {
                tlv.get(t as usize).set(t);
                tlv.get(t as usize).get()
            }));
        }
        let mut results: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_max_tid_grows() {
        let before = max_tid();
        std::thread::spawn(|| {
            current_tid();
        })
        .join()
        .unwrap();
        assert!(max_tid() > before);
    }
}
