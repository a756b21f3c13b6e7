//! KLSM: a DLSM log-structured merge queue with an attached SLSM, so
//! large blocks spill out of a thread's own local list instead of
//! growing it without bound.
//!
//! Ported from `k_lsm/k_lsm.h`: the original keeps the DLSM and SLSM as
//! two halves of one structure; here that composition is literally
//! [`Dlsm::with_slsm`] (section 4.13), and this type is a thin,
//! differently-named front door onto it so callers reach for `Klsm` by
//! name instead of remembering the `with_slsm` constructor.

use crate::dlsm::Dlsm;

/// A distributed log-structured merge queue with an attached shared
/// array for large blocks.
pub struct Klsm<K, V, const R: usize> {
    inner: Dlsm<K, V, R>,
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static, const R: usize>
    Klsm<K, V, R>
where
    K: crate::bounded::Bounded,
{
    /// A fresh KLSM: an empty DLSM over an empty attached SLSM.
    pub fn new() -> Self {
        Self {
            inner: Dlsm::with_slsm(),
        }
    }

    /// Register the calling thread's local structures up front.
    pub fn init_thread(&self) {
        self.inner.init_thread();
        if let Some(slsm) = self.inner.slsm() {
            slsm.init_thread();
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    /// Remove and return some approximately-minimal key/value pair,
    /// checking this thread's own DLSM list (including spying on a
    /// sibling) before falling back to the attached SLSM.
    pub fn delete_min(&self) -> Option<(K, V)> {
        if let Some(result) = self.inner.delete_min() {
            return Some(result);
        }
        self.inner.slsm().and_then(|slsm| slsm.delete_min())
    }

    /// Peek at some approximately-minimal key without removing it,
    /// across both halves.
    pub fn find_min(&self) -> Option<K> {
        let local_min = self.inner.find_min();
        let shared_min = self.inner.slsm().and_then(|slsm| slsm.find_min());
        match (local_min, shared_min) {
            (Some(a), Some(b)) => Some(if a <= b { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static, const R: usize> Default
    for Klsm<K, V, R>
where
    K: crate::bounded::Bounded,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_insert_delete_min_is_sorted() {
        let q: Klsm<u32, u32, 8> = Klsm::new();
        q.init_thread();
        for k in [5u32, 1, 4, 2, 3] {
            q.insert(k, k * 10);
        }
        let mut out = Vec::new();
        while let Some((k, _)) = q.delete_min() {
            out.push(k);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_large_run_spills_into_attached_slsm_and_still_drains() {
        let q: Klsm<u32, u32, 2> = Klsm::new();
        q.init_thread();
        for k in 0..40u32 {
            q.insert(k, k);
        }
        let mut out = Vec::new();
        while let Some((k, _)) = q.delete_min() {
            out.push(k);
        }
        out.sort_unstable();
        assert_eq!(out, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_find_min_reflects_minimum_across_both_halves() {
        let q: Klsm<u32, u32, 2> = Klsm::new();
        q.init_thread();
        for k in 0..10u32 {
            q.insert(k, k);
        }
        assert_eq!(q.find_min(), Some(0));
    }
}
