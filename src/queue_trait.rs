//! The common interface every relaxed priority queue in this crate
//! implements.
//!
//! There is no single original header this traces to -- `capq.c`,
//! `dist_lsm.h`, `shared_lsm.h`, and `k_lsm.h` each expose their own
//! free functions with the same three-operation shape. Naming that
//! shape as a trait is this port's own generalization, so every queue
//! can be driven identically by a caller (or a benchmark harness) that
//! doesn't care which relaxation scheme backs it.

/// A relaxed concurrent priority queue keyed by `K` with payload `V`.
///
/// `delete_min` and `find_min` are relaxed: depending on the
/// implementation and its configured bound, they may return a key other
/// than the strict global minimum, though never one that was never
/// present. `insert` and `delete_min` are safe to call from any number
/// of threads concurrently, provided each thread calls [`init_thread`]
/// (or simply `insert`/`delete_min`, which register lazily) before its
/// first operation.
///
/// [`init_thread`]: PriorityQueue::init_thread
pub trait PriorityQueue<K, V> {
    /// Register the calling thread's local structures up front. Optional:
    /// every implementation also registers lazily on first use, but
    /// calling this ahead of time avoids paying that allocation inside a
    /// latency-sensitive first operation.
    fn init_thread(&self);

    /// Insert a key/value pair.
    fn insert(&self, key: K, value: V);

    /// Remove and return some approximately-minimal key/value pair, or
    /// `None` if the queue is observed empty at the moment of the call.
    fn delete_min(&self) -> Option<(K, V)>;

    /// Peek at some approximately-minimal key without removing it.
    fn find_min(&self) -> Option<K>;
}

impl<K, V> PriorityQueue<K, V> for crate::capq::Capq<K, V>
where
    K: Ord + Copy + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
{
    fn init_thread(&self) {
        crate::capq::Capq::init_thread(self)
    }
    fn insert(&self, key: K, value: V) {
        crate::capq::Capq::insert(self, key, value)
    }
    fn delete_min(&self) -> Option<(K, V)> {
        crate::capq::Capq::delete_min(self)
    }
    fn find_min(&self) -> Option<K> {
        crate::capq::Capq::find_min(self)
    }
}

impl<K, V, const R: usize> PriorityQueue<K, V> for crate::dlsm::Dlsm<K, V, R>
where
    K: Ord + Copy + Send + Sync + 'static + crate::bounded::Bounded,
    V: Copy + Send + Sync + 'static,
{
    fn init_thread(&self) {
        crate::dlsm::Dlsm::init_thread(self)
    }
    fn insert(&self, key: K, value: V) {
        crate::dlsm::Dlsm::insert(self, key, value)
    }
    fn delete_min(&self) -> Option<(K, V)> {
        crate::dlsm::Dlsm::delete_min(self)
    }
    fn find_min(&self) -> Option<K> {
        crate::dlsm::Dlsm::find_min(self)
    }
}

impl<K, V, const R: usize> PriorityQueue<K, V> for crate::slsm::Slsm<K, V, R>
where
    K: crate::bounded::Bounded,
    V: Copy,
{
    fn init_thread(&self) {
        crate::slsm::Slsm::init_thread(self)
    }
    fn insert(&self, key: K, value: V) {
        crate::slsm::Slsm::insert(self, key, value)
    }
    fn delete_min(&self) -> Option<(K, V)> {
        crate::slsm::Slsm::delete_min(self)
    }
    fn find_min(&self) -> Option<K> {
        crate::slsm::Slsm::find_min(self)
    }
}

impl<K, V, const R: usize> PriorityQueue<K, V> for crate::klsm::Klsm<K, V, R>
where
    K: Ord + Copy + Send + Sync + 'static + crate::bounded::Bounded,
    V: Copy + Send + Sync + 'static,
{
    fn init_thread(&self) {
        crate::klsm::Klsm::init_thread(self)
    }
    fn insert(&self, key: K, value: V) {
        crate::klsm::Klsm::insert(self, key, value)
    }
    fn delete_min(&self) -> Option<(K, V)> {
        crate::klsm::Klsm::delete_min(self)
    }
    fn find_min(&self) -> Option<K> {
        crate::klsm::Klsm::find_min(self)
    }
}
