//! Reusable staging buffers for flat input tensors.
//!
//! A pool is owned by one worker at a time: either passed explicitly to the
//! evaluator or taken from the calling thread's scope through
//! [`with_thread_pool`]. Buffers only ever grow, so steady-state batches of
//! similar size never touch the allocator.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

#[derive(Debug, Default)]
struct ScratchBuffer {
    data: Vec<f32>,
}

impl ScratchBuffer {
    /// Grows to at least `min_len`; returns whether an allocation happened.
    fn ensure(&mut self, min_len: usize) -> bool {
        if self.data.len() >= min_len {
            return false;
        }
        // Replaced outright rather than resized; old contents are not needed.
        self.data = vec![0.0; min_len];
        true
    }
}

/// Primary and secondary staging buffers plus an allocation counter.
#[derive(Debug, Default)]
pub struct ScratchBufferPool {
    primary: ScratchBuffer,
    secondary: ScratchBuffer,
    allocations: Arc<AtomicUsize>,
}

impl ScratchBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that reports every (re)allocation to `counter`.
    pub fn with_allocation_counter(counter: Arc<AtomicUsize>) -> Self {
        Self {
            allocations: counter,
            ..Self::default()
        }
    }

    /// Pre-sizes both buffers.
    pub fn reserve(&mut self, primary_len: usize, secondary_len: usize) {
        self.grow_primary(primary_len);
        self.grow_secondary(secondary_len);
    }

    /// Returns a primary buffer of exactly `primary_len` floats and, when
    /// requested, a secondary buffer of `secondary_len` floats.
    ///
    /// Contents are whatever the previous user left behind.
    pub fn acquire(
        &mut self,
        primary_len: usize,
        secondary_len: Option<usize>,
    ) -> (&mut [f32], Option<&mut [f32]>) {
        self.grow_primary(primary_len);
        if let Some(len) = secondary_len {
            self.grow_secondary(len);
        }
        let primary = &mut self.primary.data[..primary_len];
        let secondary = secondary_len.map(|len| &mut self.secondary.data[..len]);
        (primary, secondary)
    }

    pub fn primary_capacity(&self) -> usize {
        self.primary.data.len()
    }

    pub fn secondary_capacity(&self) -> usize {
        self.secondary.data.len()
    }

    /// Number of allocations made through this pool's counter.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn grow_primary(&mut self, len: usize) {
        if self.primary.ensure(len) {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            debug!("scratch pool: primary buffer grown to {len} floats");
        }
    }

    fn grow_secondary(&mut self, len: usize) {
        if self.secondary.ensure(len) {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            debug!("scratch pool: secondary buffer grown to {len} floats");
        }
    }
}

thread_local! {
    static THREAD_POOL: RefCell<ScratchBufferPool> = RefCell::new(ScratchBufferPool::new());
}

/// Runs `f` with the calling thread's pool.
///
/// Must not be re-entered from inside `f`.
pub fn with_thread_pool<R>(f: impl FnOnce(&mut ScratchBufferPool) -> R) -> R {
    THREAD_POOL.with(|pool| f(&mut pool.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_increasing_sizes_reuse_the_buffer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ScratchBufferPool::with_allocation_counter(counter.clone());

        let (primary, secondary) = pool.acquire(1000, None);
        assert_eq!(primary.len(), 1000);
        assert!(secondary.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        pool.acquire(1000, None);
        pool.acquire(640, None);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(pool.primary_capacity(), 1000);
    }

    #[test]
    fn larger_request_reallocates_exactly_once() {
        let mut pool = ScratchBufferPool::new();
        pool.acquire(100, None);
        assert_eq!(pool.allocations(), 1);

        let (primary, _) = pool.acquire(500, None);
        assert_eq!(primary.len(), 500);
        assert_eq!(pool.allocations(), 2);

        pool.acquire(200, None);
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.primary_capacity(), 500);
    }

    #[test]
    fn secondary_buffer_is_sized_independently() {
        let mut pool = ScratchBufferPool::new();
        pool.reserve(64, 0);
        let (primary, secondary) = pool.acquire(64, Some(10));
        primary[63] = 1.0;
        assert_eq!(secondary.map(|s| s.len()), Some(10));
        assert_eq!(pool.secondary_capacity(), 10);
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn thread_pool_persists_between_calls() {
        with_thread_pool(|pool| {
            pool.acquire(256, None);
        });
        let capacity = with_thread_pool(|pool| pool.primary_capacity());
        assert!(capacity >= 256);
    }
}
