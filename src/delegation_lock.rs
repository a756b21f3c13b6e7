//! The queue-delegation lock (QD-lock): CAPQ's base-node lock.
//!
//! Ported from `qdlocksrc/locks/qd_lock.c` and `qd_queues/qd_queue.h`
//! (Kjell Winblad's qd_lock_lib). Under contention a writer does not
//! spin on the lock itself; it deposits its request into the current
//! holder's ring buffer and returns immediately, while the holder
//! executes every deposited request before releasing the lock. This
//! migrates the *request* to the cache line the holder already owns,
//! instead of migrating the cache line itself to each contending core.
//!
//! This port protects a value `T` directly (like [`crate::spinlock`]'s
//! lock types), and replaces the original's raw `(fn_ptr, message_ptr)`
//! ring-buffer entries with boxed `FnMut(&mut T)` closures -- the
//! "variant type per slot" alternative the design notes call out for
//! languages without raw byte aliasing. The original's separate
//! `qdq_enqueue_get_buffer` / `qdq_enqueue_close_buffer` two-step
//! (reserve a slot, then stamp it once the caller has filled it in)
//! collapses to one step here, since a closure already carries its own
//! payload instead of writing into a borrowed byte range.

use crate::backoff::Backoff;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Matches the original's default `QD_QUEUE_BUFFER_SIZE`, reinterpreted
/// as a slot count rather than a byte count (closures vary in size, so
/// there is no fixed byte budget to mirror exactly).
pub const DEFAULT_SLOTS: usize = 256;

type Op<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Slot<T> {
    ready: AtomicBool,
    closure: UnsafeCell<Option<Op<T>>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(false),
            closure: UnsafeCell::new(None),
        }
    }
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// A lock protecting a `T`, whose contenders may delegate operations to
/// the current holder instead of waiting.
pub struct DelegationLock<T> {
    locked: AtomicBool,
    /// Reservation counter for the delegation ring. While the lock is
    /// held, the holder resets this to 0 (`open_queue`); any value
    /// `>= slots.len()` behaves as the original's "buffer full or
    /// closed" sentinel, so enqueue attempts past that point simply
    /// fail and their callers retry against the lock itself.
    counter: AtomicUsize,
    slots: Box<[Slot<T>]>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for DelegationLock<T> {}
unsafe impl<T: Send> Sync for DelegationLock<T> {}

impl<T> DelegationLock<T> {
    /// Create a new, unlocked `DelegationLock` with the default
    /// delegation-ring capacity.
    pub fn new(data: T) -> Self {
        Self::with_capacity(data, DEFAULT_SLOTS)
    }

    /// As [`DelegationLock::new`], with an explicit delegation-ring
    /// slot count.
    pub fn with_capacity(data: T, slots: usize) -> Self {
        let mut v = Vec::with_capacity(slots);
        v.resize_with(slots, Slot::default);
        Self {
            locked: AtomicBool::new(false),
            // Closed: nothing can be delegated until a holder opens it.
            counter: AtomicUsize::new(slots),
            slots: v.into_boxed_slice(),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    fn try_lock_raw(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn open_queue(&self) {
        self.counter.store(0, Ordering::Release);
    }

    /// Reserve and fill one delegation slot. Fails (handing the closure
    /// back) if the ring is closed or full; the caller must retry,
    /// typically by yielding and re-attempting the whole
    /// lock-or-delegate loop.
    fn try_enqueue(&self, op: Op<T>) -> Result<(), Op<T>> {
        let idx = self.counter.fetch_add(1, Ordering::AcqRel);
        if idx >= self.slots.len() {
            return Err(op);
        }
        let slot = &self.slots[idx];
        // SAFETY: this slot was reserved exclusively by this fetch_add;
        // no other writer can address index `idx` again until the
        // holder's `flush` consumes and clears it.
        unsafe {
            *slot.closure.get() = Some(op);
        }
        slot.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Drain every deposited request in reservation order, then close
    /// the ring so that no further delegations land silently after the
    /// lock is released. Only the current holder may call this.
    fn flush(&self) {
        let mut drained = 0usize;
        loop {
            let reserved = self.counter.load(Ordering::Acquire);
            let target = reserved.min(self.slots.len());
            if drained < target {
                let slot = &self.slots[drained];
                let mut backoff = Backoff::new();
                while !slot.ready.load(Ordering::Acquire) {
                    backoff.spin();
                    std::thread::yield_now();
                }
                // SAFETY: `ready` was published with Release after the
                // unique enqueuer for this slot wrote the closure.
                let op = unsafe { (*slot.closure.get()).take() }
                    .expect("relaxed_pq: delegation slot marked ready with no closure");
                op(unsafe { &mut *self.data.get() });
                slot.ready.store(false, Ordering::Relaxed);
                drained += 1;
                continue;
            }
            if reserved >= self.slots.len() {
                // Already closed (either naturally full, or closed by a
                // previous iteration of this same loop).
                return;
            }
            // Attempt to close: nobody reserved slot `reserved` yet, so
            // claim the ring shut by bumping the counter straight to
            // "closed" (matches the original's use of the buffer size
            // itself as both capacity bound and closed sentinel).
            if self
                .counter
                .compare_exchange(reserved, self.slots.len(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // Someone reserved more slots between our load and the CAS;
            // loop and drain them too.
        }
    }

    #[inline]
    fn unlock_raw(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock unconditionally, spinning (with a yield-backed
    /// backoff) until it is free. Opens the delegation ring on entry
    /// and flushes + closes it on guard drop, so any request delegated
    /// while this guard is held still runs before the lock is released.
    pub fn lock(&self) -> DelegationGuard<'_, T> {
        let mut backoff = Backoff::new();
        while !self.try_lock_raw() {
            backoff.spin();
            std::thread::yield_now();
        }
        self.open_queue();
        DelegationGuard { lock: self }
    }

    /// As [`DelegationLock::lock`], but returns `None` instead of
    /// spinning if the lock is currently held.
    pub fn try_lock(&self) -> Option<DelegationGuard<'_, T>> {
        if self.try_lock_raw() {
            self.open_queue();
            Some(DelegationGuard { lock: self })
        } else {
            None
        }
    }

    /// `try_lock_or_delegate` (spec section 4.14): either run `op`
    /// immediately under a freshly acquired lock, or hand it to the
    /// current holder via the delegation ring. Fire-and-forget: returns
    /// as soon as `op` has been committed to run, without waiting for
    /// it to actually execute.
    pub fn try_lock_or_delegate(&self, op: impl FnOnce(&mut T) + Send + 'static) {
        let mut pending: Op<T> = Box::new(op);
        let mut backoff = Backoff::new();
        loop {
            if let Some(mut guard) = self.try_lock() {
                pending(&mut guard);
                return;
            }
            match self.try_enqueue(pending) {
                Ok(()) => return,
                Err(returned) => {
                    pending = returned;
                    backoff.spin();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// The synchronous delegation mode from the original's
    /// `qd_delegate_wait`: blocks the caller until `op` has actually
    /// run (whether inline or by a delegate), using an atomic done-flag
    /// the holder sets on completion.
    pub fn delegate_wait<R: Send + 'static>(&self, op: impl FnOnce(&mut T) -> R + Send + 'static) -> R {
        use std::sync::{Arc, Condvar, Mutex};
        let reply: Arc<(Mutex<Option<R>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let reply2 = Arc::clone(&reply);
        self.try_lock_or_delegate(move |data| {
            let result = op(data);
            let (lock, cvar) = &*reply2;
            *lock.lock().unwrap() = Some(result);
            cvar.notify_one();
        });
        let (lock, cvar) = &*reply;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        slot.take().unwrap()
    }
}

/// RAII guard returned by [`DelegationLock::lock`] / `try_lock`.
///
/// Dereferences to `&mut T`. On drop, flushes every request delegated
/// while this guard was held, then releases the lock.
pub struct DelegationGuard<'a, T> {
    lock: &'a DelegationLock<T>,
}

impl<T> std::ops::Deref for DelegationGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the lifetime of this guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for DelegationGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the lifetime of this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for DelegationGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flush();
        self.lock.unlock_raw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_lock_unlock_roundtrip() {
        let lock = DelegationLock::new(0i32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = DelegationLock::new(0i32);
        let _g = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn test_try_lock_or_delegate_runs_eventually() {
        let lock = Arc::new(DelegationLock::new(0i64));
        {
            let guard = lock.lock();
            lock.try_lock_or_delegate(|v| *v += 5);
            drop(guard); // flush happens here, running the delegated op
        }
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn test_delegate_wait_returns_result() {
        let lock = DelegationLock::new(10i32);
        let doubled = lock.delegate_wait(|v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, 20);
        assert_eq!(*lock.lock(), 20);
    }

    #[test]
    fn test_concurrent_delegations_all_observed() {
        let lock = Arc::new(DelegationLock::new(AtomicU32::new(0)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                lock.delegate_wait(|counter| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.lock().load(Ordering::SeqCst), 8);
    }
}
