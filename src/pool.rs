//! Recycling pool for promise nodes.
//!
//! Settled nodes are returned here instead of being deallocated, and new
//! promises reuse them. Every node carries a generation counter that is
//! bumped on recycle, so a stale handle captured before recycling fails its
//! validity check instead of silently operating on the next logical promise
//! that happens to occupy the same allocation.
//!
//! The free list is a lock-free queue shared across threads; a bounded
//! capacity keeps a burst of promises from pinning memory forever.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A node that can be wiped and reused.
pub(crate) trait Recycle {
    /// Clears per-use state and bumps the node's generation counter.
    fn recycle(&self);
}

/// A bounded lock-free free-list of reusable nodes.
pub(crate) struct Pool<T> {
    free: SegQueue<Arc<T>>,
    // SegQueue::len is O(n); track an approximate count separately.
    approx_len: AtomicUsize,
    capacity: usize,
}

impl<T: Recycle> Pool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: SegQueue::new(),
            approx_len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Pops a recycled node, or builds a fresh one with `make`.
    pub(crate) fn take_or<F: FnOnce() -> T>(&self, make: F) -> Arc<T> {
        if let Some(node) = self.free.pop() {
            self.approx_len.fetch_sub(1, Ordering::Relaxed);
            tracing::trace!("reusing pooled node");
            node
        } else {
            Arc::new(make())
        }
    }

    /// Recycles a node back into the pool, or drops it if the pool is full.
    pub(crate) fn put(&self, node: Arc<T>) {
        node.recycle();
        if self.approx_len.load(Ordering::Relaxed) >= self.capacity {
            return;
        }
        self.approx_len.fetch_add(1, Ordering::Relaxed);
        self.free.push(node);
    }
}
