//! DLSM: the distributed log-structured merge queue, each thread keeping its own
//! [`DlsmLocal`] and stealing from a random sibling when its own list
//! runs dry.
//!
//! Ported from `dist_lsm/dist_lsm.h`. `const R` sets the live-size
//! threshold, `ceil((R + 1) / 2)`, above which a newly merged block is
//! handed off to an attached SLSM rather than rejoining this thread's
//! own list -- the KLSM composition rule (section 4.13). With no SLSM
//! attached every block stays local regardless of size, which is what a
//! bare DLSM (section 4.10) is.

use crate::block::Block;
use crate::dlsm_local::DlsmLocal;
use crate::slsm::Slsm;
use crate::thread::{max_tid, Tlv};

/// A distributed log-structured merge priority queue, optionally
/// spilling large blocks into an attached shared structure.
pub struct Dlsm<K, V, const R: usize> {
    locals: Tlv<DlsmLocal<K, V>>,
    slsm: Option<Slsm<K, V, R>>,
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static, const R: usize>
    Dlsm<K, V, R>
where
    K: crate::bounded::Bounded,
{
    /// A bare DLSM with no shared component: every block stays local no
    /// matter how large it grows.
    pub fn new() -> Self {
        Self {
            locals: Tlv::new(),
            slsm: None,
        }
    }

    /// A DLSM that hands large blocks off to a freshly created SLSM (the
    /// KLSM composition).
    pub fn with_slsm() -> Self {
        Self {
            locals: Tlv::new(),
            slsm: Some(Slsm::new()),
        }
    }

    /// The attached shared component, if any (used by `klsm.rs` to route
    /// `delete_min` there too).
    pub fn slsm(&self) -> Option<&Slsm<K, V, R>> {
        self.slsm.as_ref()
    }

    fn handoff_threshold(&self) -> usize {
        (R + 1).div_ceil(2)
    }

    /// Register the calling thread's local list up front.
    pub fn init_thread(&self) {
        self.locals.get_current();
    }

    pub fn insert(&self, key: K, value: V) {
        let local = self.locals.get_current();
        let threshold = self.handoff_threshold();
        match &self.slsm {
            Some(slsm) => local.insert(key, value, threshold, |block| slsm.insert_block(block)),
            None => local.insert(key, value, usize::MAX, |_: *const Block<K, V>| {}),
        }
    }

    /// Remove and return some approximately-minimal key/value pair. Only
    /// ever targets this thread's own list plus spying from a sibling;
    /// any attached SLSM is drained separately through `klsm.rs`.
    pub fn delete_min(&self) -> Option<(K, V)> {
        let local = self.locals.get_current();
        if let Some(result) = local.try_delete_min_local() {
            return Some(result);
        }

        let bound = max_tid() as usize;
        if bound >= 2 {
            let victim_idx = local.random_victim(bound);
            let victim = self.locals.get(victim_idx);
            if local.spy(victim) {
                return local.try_delete_min_local();
            }
        }
        None
    }

    pub fn find_min(&self) -> Option<K> {
        self.locals.get_current().find_min()
    }
}

impl<K: Ord + Copy + Send + Sync + 'static, V: Copy + Send + Sync + 'static, const R: usize> Default
    for Dlsm<K, V, R>
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
        let q: Dlsm<u32, u32, 8> = Dlsm::new();
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
    fn test_find_min_then_delete_min_agree() {
        let q: Dlsm<u32, u32, 8> = Dlsm::new();
        q.init_thread();
        q.insert(3, 30);
        q.insert(1, 10);
        assert_eq!(q.find_min(), Some(1));
        assert_eq!(q.delete_min(), Some((1, 10)));
    }

    #[test]
    fn test_spying_lets_consumer_steal_from_producer() {
        let q = std::sync::Arc::new(Dlsm::<u32, u32, 8>::new());
        let producer = {
            let q = std::sync::Arc::clone(&q);
            std::thread::spawn(move || {
                q.init_thread();
                for k in 0..20u32 {
                    q.insert(k, k);
                }
            })
        };
        producer.join().unwrap();

        let consumer = {
            let q = std::sync::Arc::clone(&q);
            std::thread::spawn(move || {
                q.init_thread();
                let mut out = Vec::new();
                for _ in 0..20 {
                    if let Some((k, _)) = q.delete_min() {
                        out.push(k);
                    }
                }
                out
            })
        };
        let out = consumer.join().unwrap();
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_large_blocks_hand_off_to_attached_slsm() {
        let q: Dlsm<u32, u32, 2> = Dlsm::with_slsm();
        q.init_thread();
        // threshold = ceil(3/2) = 2: each pairwise merge (power 1, 2
        // items) reaches it and hands off rather than staying local.
        for k in 0..4u32 {
            q.insert(k, k);
        }
        assert_eq!(q.delete_min(), None);

        let mut found = std::collections::HashSet::new();
        while let Some((k, _)) = q.slsm().unwrap().delete_min() {
            found.insert(k);
        }
        assert_eq!(found, (0..4u32).collect());
    }
}
