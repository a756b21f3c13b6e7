//! The item cell: a `(key, value, version)` triple with wait-free reuse
//! detection.
//!
//! Ported from `components/item.h` / `item_inl.h`. A cell's `version` is
//! even when the cell is reusable and odd while it holds a live payload.
//! Exactly one `take` can succeed per `initialize`; that success is the
//! linearization point of the `delete_min` that observed it.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// A single reusable value cell.
///
/// `key` and `val` are only meaningful while `version` is odd; readers
/// must always read them through [`Item::take`] (never speculatively),
/// since the original marks this exact spot as a deliberately relaxed,
/// benign race: `initialize` bumps `version` before writing the payload.
pub struct Item<K, V> {
    version: AtomicU32,
    key: UnsafeCell<MaybeUninit<K>>,
    val: UnsafeCell<MaybeUninit<V>>,
}

// SAFETY: all interior mutation is gated by the version protocol:
// `initialize` is only called by the owning thread before publication,
// and `take` only reads the payload matching an `expected_version` that
// a `delete_min` observed as live.
unsafe impl<K: Send, V: Send> Send for Item<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Item<K, V> {}

impl<K, V> Item<K, V> {
    /// Construct a fresh, reusable (even-version) cell.
    pub fn new() -> Self {
        Self {
            version: AtomicU32::new(0),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            val: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The cell's current version. Even means reusable, odd means live.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// `true` if the cell is currently reusable (its version is even).
    #[inline]
    pub fn is_reusable(&self) -> bool {
        self.version() % 2 == 0
    }

    /// Publish a new payload into this cell, bumping its version into the
    /// odd (live) range.
    ///
    /// The returned version is the value a block must store as the
    /// entry's `expected_version` to later confirm ownership via
    /// [`Item::take`]. Must only be called by the cell's owning thread
    /// while the cell is reusable.
    pub fn initialize(&self, key: K, val: V) -> u32 {
        // Matches the original: bump the version first (making the slot
        // "in flight"), then store the payload.
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(version % 2 == 1);
        unsafe {
            (*self.key.get()).write(key);
            (*self.val.get()).write(val);
        }
        version
    }

    /// Attempt to claim ownership of this cell's payload.
    ///
    /// Succeeds at most once per [`Item::initialize`]: the payload is read
    /// first, then the version is atomically advanced from
    /// `expected_version` to `expected_version + 1` (odd -> even). Returns
    /// the `(key, value)` pair on success.
    pub fn take(&self, expected_version: u32) -> Option<(K, V)>
    where
        K: Copy,
        V: Copy,
    {
        // SAFETY: the caller only calls `take` with a version it observed
        // as the live version of an owned entry; the payload was written
        // by `initialize` before that version became visible.
        let key = unsafe { (*self.key.get()).assume_init() };
        let val = unsafe { (*self.val.get()).assume_init() };

        self.version
            .compare_exchange(
                expected_version,
                expected_version.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| (key, val))
    }
}

impl<K, V> Default for Item<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_reusable() {
        let item: Item<u32, u32> = Item::new();
        assert!(item.is_reusable());
        assert_eq!(item.version(), 0);
    }

    #[test]
    fn test_initialize_makes_odd_version() {
        let item: Item<u32, u32> = Item::new();
        let v = item.initialize(1, 2);
        assert_eq!(v % 2, 1);
        assert!(!item.is_reusable());
    }

    #[test]
    fn test_take_succeeds_once() {
        let item: Item<u32, u32> = Item::new();
        let v = item.initialize(10, 20);

        let first = item.take(v);
        assert_eq!(first, Some((10, 20)));
        assert!(item.is_reusable());

        let second = item.take(v);
        assert_eq!(second, None);
    }

    #[test]
    fn test_reinitialize_after_take() {
        let item: Item<u32, u32> = Item::new();
        let v1 = item.initialize(1, 1);
        item.take(v1).unwrap();

        let v2 = item.initialize(2, 2);
        assert_eq!(v2, v1 + 2);
        assert_eq!(item.take(v2), Some((2, 2)));
    }

    #[test]
    fn test_take_wrong_version_fails() {
        let item: Item<u32, u32> = Item::new();
        let v = item.initialize(5, 5);
        assert_eq!(item.take(v + 10), None);
        // the real version is untouched, so the correct take still works
        assert_eq!(item.take(v), Some((5, 5)));
    }
}
