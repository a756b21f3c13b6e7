//! CAPQ: the contention-avoiding priority queue.
//!
//! Ported from `lib/capq/capq.c`. Wraps a [`crate::ca_tree::CaTree`]
//! with two per-thread adaptive buffers:
//!
//! - a bounded **put buffer** (a small binary min-heap) that absorbs
//!   inserts locally, only spilling to the tree once it is full;
//! - a **delete-min buffer** (a detached [`FatSkiplist`] run) that
//!   holds the result of an earlier bulk pop from the tree, consumed
//!   locally until empty.
//!
//! Each thread also tracks two contention counters (`put_contention`,
//! `remove_min_contention`) independent of the CA-tree's own per-base
//! split/join statistic (`crate::ca_tree`'s `contention` field): these
//! drive the put-buffer's target size and the delete-min relaxation
//! `r`, growing under detected contention and decaying otherwise.

use crate::ca_tree::CaTree;
use crate::skiplist::FatSkiplist;
use crate::thread::Tlv;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Matches `capq.c`'s `MAX_PUT_BUFFER_SIZE`.
pub const MAX_PUT_BUFFER_SIZE: usize = 500;
const PUT_BUFFER_GROW_STEP: usize = 500;
const PUT_BUFFER_SHRINK_STEP: usize = 1;
const PUT_CONTENTION_HIGH: i64 = 100;
const PUT_CONTENTION_LOW: i64 = -100;

/// Upper bound on the delete-min relaxation `r`, in skiplist *nodes*
/// detached per bulk pop. Scaled down from `capq.c`'s element-count
/// bound to this crate's node-granular `remove_head_nodes`.
pub const MAX_REMOVE_MIN_RELAXATION: usize = 1000;
const REMOVE_MIN_GROW_STEP: usize = 1;
const REMOVE_MIN_GROW_STEP_HIGH_CONTENTION: usize = 250;
const REMOVE_MIN_SHRINK_STEP: usize = 1;
const REMOVE_MIN_CONTENTION_HIGH: i64 = 1000;
const REMOVE_MIN_CONTENTION_LOW: i64 = -1000;

const SUCCESS_DELTA: i64 = -1;
const FAILURE_DELTA: i64 = 250;

struct HeapEntry<K, V> {
    key: K,
    value: V,
}

impl<K: PartialEq, V> PartialEq for HeapEntry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl<K: Eq, V> Eq for HeapEntry<K, V> {}
impl<K: Ord, V> PartialOrd for HeapEntry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: Ord, V> Ord for HeapEntry<K, V> {
    // Reversed so `BinaryHeap` (a max-heap) surfaces the smallest key.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

struct ThreadState<K, V> {
    put_buffer: RefCell<BinaryHeap<HeapEntry<K, V>>>,
    put_buffer_cap: Cell<usize>,
    put_contention: Cell<i64>,
    delete_min_buffer: RefCell<Option<FatSkiplist<K, V>>>,
    relaxation: Cell<usize>,
    remove_min_contention: Cell<i64>,
}

impl<K, V> Default for ThreadState<K, V> {
    fn default() -> Self {
        Self {
            put_buffer: RefCell::new(BinaryHeap::new()),
            put_buffer_cap: Cell::new(0),
            put_contention: Cell::new(0),
            delete_min_buffer: RefCell::new(None),
            relaxation: Cell::new(0),
            remove_min_contention: Cell::new(0),
        }
    }
}

impl<K, V> ThreadState<K, V> {
    fn record_put(&self, contended: bool) {
        let c = self.put_contention.get() + if contended { FAILURE_DELTA } else { SUCCESS_DELTA };
        self.put_contention.set(c);
        let cap = self.put_buffer_cap.get();
        if c >= PUT_CONTENTION_HIGH {
            self.put_buffer_cap.set((cap + PUT_BUFFER_GROW_STEP).min(MAX_PUT_BUFFER_SIZE));
        } else if c <= PUT_CONTENTION_LOW {
            self.put_buffer_cap.set(cap.saturating_sub(PUT_BUFFER_SHRINK_STEP));
        }
    }

    fn record_remove(&self, contended: bool) {
        let c = self.remove_min_contention.get() + if contended { FAILURE_DELTA } else { SUCCESS_DELTA };
        self.remove_min_contention.set(c);
        let r = self.relaxation.get();
        if c >= REMOVE_MIN_CONTENTION_HIGH {
            self.relaxation
                .set((r + REMOVE_MIN_GROW_STEP_HIGH_CONTENTION).min(MAX_REMOVE_MIN_RELAXATION));
        } else if contended {
            self.relaxation.set((r + REMOVE_MIN_GROW_STEP).min(MAX_REMOVE_MIN_RELAXATION));
        } else if c <= REMOVE_MIN_CONTENTION_LOW {
            self.relaxation.set(r.saturating_sub(REMOVE_MIN_SHRINK_STEP));
        }
    }
}

/// A contention-avoiding priority queue.
pub struct Capq<K, V> {
    tree: CaTree<K, V>,
    state: Tlv<ThreadState<K, V>>,
}

impl<K, V> Capq<K, V>
where
    K: Ord + Copy + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
{
    /// A fresh, empty CAPQ.
    pub fn new() -> Self {
        Self {
            tree: CaTree::new(),
            state: Tlv::new(),
        }
    }

    /// Register the calling thread's buffers. Optional: both buffers
    /// lazily materialize on first use, but calling this up front
    /// avoids paying that allocation inside a latency-sensitive first
    /// operation.
    pub fn init_thread(&self) {
        self.state.get_current();
    }

    /// Insert a key/value pair.
    pub fn insert(&self, key: K, value: V) {
        let state = self.state.get_current();
        let cap = state.put_buffer_cap.get();
        if state.put_buffer.borrow().len() < cap {
            state.put_buffer.borrow_mut().push(HeapEntry { key, value });
            return;
        }
        let contended = self.tree.insert_reporting_contention(key, value);
        state.record_put(contended);
    }

    /// Remove and return some approximately-minimal key/value pair, or
    /// `None` if the queue (including every thread's local buffers) is
    /// observed empty at the moment of the call.
    pub fn delete_min(&self) -> Option<(K, V)> {
        let state = self.state.get_current();
        loop {
            let buffer_head = state.put_buffer.borrow().peek().map(|e| e.key);
            let dmb_head = {
                let mut dmb = state.delete_min_buffer.borrow_mut();
                dmb.as_mut().and_then(|sl| sl.peek_min()).map(|(k, _)| k)
            };

            match (buffer_head, dmb_head) {
                (Some(bk), Some(dk)) if bk <= dk => return self.pop_put_buffer(state),
                (Some(_), Some(_)) => return self.pop_delete_min_buffer(state),
                (Some(_), None) => return self.pop_put_buffer(state),
                (None, Some(_)) => return self.pop_delete_min_buffer(state),
                (None, None) => {
                    let r = state.relaxation.get();
                    if r == 0 {
                        let (result, contended) = self.tree.delete_min_reporting_contention();
                        state.record_remove(contended);
                        return result;
                    }
                    let (run, contended) = self.tree.remove_head_nodes_reporting_contention(r);
                    state.record_remove(contended);
                    match run {
                        Some(run) if !run.is_empty() => {
                            *state.delete_min_buffer.borrow_mut() = Some(run);
                            // loop back around to drain it
                        }
                        _ => return None,
                    }
                }
            }
        }
    }

    fn pop_put_buffer(&self, state: &ThreadState<K, V>) -> Option<(K, V)> {
        state.put_buffer.borrow_mut().pop().map(|e| (e.key, e.value))
    }

    fn pop_delete_min_buffer(&self, state: &ThreadState<K, V>) -> Option<(K, V)> {
        let mut dmb = state.delete_min_buffer.borrow_mut();
        let result = dmb.as_mut()?.remove_min();
        if dmb.as_ref().map(|s| s.is_empty()).unwrap_or(false) {
            *dmb = None;
        }
        result
    }

    /// Peek at some approximately-minimal key without removing it.
    pub fn find_min(&self) -> Option<K> {
        let state = self.state.get_current();
        let buffer_head = state.put_buffer.borrow().peek().map(|e| e.key);
        let dmb_head = {
            let mut dmb = state.delete_min_buffer.borrow_mut();
            dmb.as_mut().and_then(|sl| sl.peek_min()).map(|(k, _)| k)
        };
        match (buffer_head, dmb_head) {
            (Some(bk), Some(dk)) => Some(if bk <= dk { bk } else { dk }),
            (Some(bk), None) => Some(bk),
            (None, Some(dk)) => Some(dk),
            (None, None) => self.tree.find_min(),
        }
    }
}

impl<K, V> Default for Capq<K, V>
where
    K: Ord + Copy + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_correctness_zero_relaxation() {
        let q: Capq<u32, u32> = Capq::new();
        q.init_thread();
        for k in [5, 1, 4, 2, 3] {
            q.insert(k, k * 10);
        }
        let mut out = Vec::new();
        while let Some((k, _)) = q.delete_min() {
            out.push(k);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_find_min_reads_put_buffer_first() {
        let q: Capq<u32, u32> = Capq::new();
        q.init_thread();
        q.insert(9, 90);
        q.insert(4, 40);
        assert_eq!(q.find_min(), Some(4));
        assert_eq!(q.delete_min(), Some((4, 40)));
        assert_eq!(q.delete_min(), Some((9, 90)));
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let q: Capq<u32, u32> = Capq::new();
        q.init_thread();
        assert_eq!(q.delete_min(), None);
        assert_eq!(q.find_min(), None);
    }

    #[test]
    fn test_relaxed_delete_min_stays_within_bound() {
        let q: Capq<u32, u32> = Capq::new();
        q.init_thread();
        for k in 0..50u32 {
            q.insert(k, k);
        }
        let state = q.state.get_current();
        state.relaxation.set(2);

        let mut out = Vec::new();
        while let Some((k, _)) = q.delete_min() {
            out.push(k);
        }
        out.sort_unstable();
        assert_eq!(out, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_insert_delete_drains_exactly_all_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let q = Arc::new(Capq::<u32, u32>::new());
        let produced = Arc::new(AtomicUsize::new(0));
        let mut producers = Vec::new();
        for t in 0..4u32 {
            let q = Arc::clone(&q);
            let produced = Arc::clone(&produced);
            producers.push(std::thread::spawn(move || {
                q.init_thread();
                for i in 0..200u32 {
                    q.insert(t * 1000 + i, i);
                }
                produced.fetch_add(200, Ordering::SeqCst);
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        q.init_thread();
        let mut drained = 0usize;
        while q.delete_min().is_some() {
            drained += 1;
        }
        assert_eq!(drained, produced.load(Ordering::SeqCst));
    }
}
