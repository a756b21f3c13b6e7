//! Relaxed concurrent priority queues.
//!
//! This crate provides four priority queue designs that trade strict
//! minimum-extraction for scalability under contention:
//!
//! - [`dlsm`] - a distributed log-structured merge queue (DLSM): each
//!   thread keeps its own sorted run of blocks and steals from a random
//!   sibling when empty.
//! - [`slsm`] - a shared-array log-structured merge queue (SLSM): threads
//!   build blocks locally but publish into one shared, versioned array.
//! - [`klsm`] - a DLSM with an attached SLSM, so blocks that grow past a
//!   size threshold spill out of a thread's own list.
//! - [`capq`] - a contention-avoiding priority queue (CAPQ), a
//!   contention-adaptive tree of skip lists guarded by delegation locks.
//!
//! All four implement [`queue_trait::PriorityQueue`], so callers that
//! don't care which relaxation scheme backs a queue can be generic over
//! it.
//!
//! ## Module organization
//!
//! ### Concurrency primitives
//! - [`thread`] - thread registry and the lock-free per-thread slot vector
//! - [`pr`] - atomic primitives and memory barriers
//! - [`backoff`] - exponential backoff for contention management
//! - [`spinlock`] - spinlock variants used by the delegation lock and CA-tree
//! - [`delegation_lock`] - queue-delegation lock (QD-lock)
//!
//! ### Shared building blocks
//! - [`bounded`] - the `Bounded` trait bridging keys and bisection arithmetic
//! - [`random`] - per-thread xorshift sampling
//! - [`item`] - the reusable `(key, value, version)` cell
//! - [`pool`] - the per-thread item pool
//! - [`block`] - a fixed-capacity sorted run of entries
//! - [`block_pool`] - block allocation and Free/Local/Global lifecycle
//! - [`block_array`] - a capacity-descending sequence of blocks
//! - [`pivots`] - bisection-based windows bounding relaxed-minimum candidates
//! - [`versioned_ptr`] - an ABA-safe pointer packing a version into its low bits
//!
//! ### Queue implementations
//! - [`dlsm_local`], [`dlsm`] - the distributed log-structured merge queue
//! - [`slsm_local`], [`slsm`] - the shared-array log-structured merge queue
//! - [`klsm`] - DLSM with an attached SLSM
//! - [`skiplist`], [`ca_tree`], [`capq`] - the contention-avoiding queue
//! - [`queue_trait`] - the common `PriorityQueue` interface

#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

// =============================================================================
// Concurrency primitives
// =============================================================================

/// Atomic primitives and memory barriers.
pub mod pr;

/// Exponential backoff for contention management.
pub mod backoff;

/// Various spinlock implementations.
pub mod spinlock;

/// Thread registry and the lock-free per-thread slot vector.
pub mod thread;

/// Queue-delegation lock.
pub mod delegation_lock;

// =============================================================================
// Shared building blocks
// =============================================================================

/// The `Bounded` trait bridging keys to bisection arithmetic.
pub mod bounded;

/// Fast per-thread random sampling.
pub mod random;

/// The reusable `(key, value, version)` cell.
pub mod item;

/// The per-thread item pool.
pub mod pool;

/// A fixed-capacity sorted run of entries.
pub mod block;

/// Block allocation and Free/Local/Global lifecycle.
pub mod block_pool;

/// A capacity-descending sequence of blocks.
pub mod block_array;

/// Bisection-based windows bounding relaxed-minimum candidates.
pub mod pivots;

/// An ABA-safe pointer packing a version into its low bits.
pub mod versioned_ptr;

// =============================================================================
// Queue implementations
// =============================================================================

/// Per-thread staging area for the distributed log-structured merge queue.
pub mod dlsm_local;

/// The distributed log-structured merge queue.
pub mod dlsm;

/// Per-thread staging area for the shared-array log-structured merge queue.
pub mod slsm_local;

/// The shared-array log-structured merge queue.
pub mod slsm;

/// A distributed log-structured merge queue with an attached shared array.
pub mod klsm;

/// Bulk, node-granular skip list used by the contention-avoiding queue.
pub mod skiplist;

/// Contention-adaptive tree of skip lists.
pub mod ca_tree;

/// The contention-avoiding priority queue.
pub mod capq;

/// The common interface every relaxed priority queue implements.
pub mod queue_trait;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use bounded::Bounded;
pub use capq::Capq;
pub use dlsm::Dlsm;
pub use klsm::Klsm;
pub use queue_trait::PriorityQueue;
pub use slsm::Slsm;
