//! Thread-local allocation buffers: per-thread slot caches.
//!
//! A TLAB fronts exactly one per-CPU heap and exists to make the common case
//! (a thread allocating and freeing small objects it never shares) free of
//! locks and atomics. It is a cache, not a heap: every slot it holds still
//! belongs to a superblock owned by its heap, and ownership never moves
//! through it. Caching is bounded two ways: a per-class slot count and a
//! total byte cap across all classes.

use crate::config::{MAX_CACHED_BYTES_TOTAL, MAX_CACHED_PER_CLASS};
use crate::global_heap::GlobalHeap;
use crate::heap::HeapPool;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::superblock::{FreeSlot, Superblock, OWNER_NONE};
use crate::stat_inc;
use core::ptr;

/// Per-size-class cache of slots, linked through the slots themselves.
struct CacheList {
    head: *mut FreeSlot,
    count: u32,
}

impl CacheList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeSlot {
        let slot = self.head;
        if !slot.is_null() {
            self.head = unsafe { (*slot).next };
            self.count -= 1;
        }
        slot
    }

    #[inline]
    fn push(&mut self, slot: *mut FreeSlot) {
        unsafe { (*slot).next = self.head };
        self.head = slot;
        self.count += 1;
    }

    /// Splice a pre-linked chain of `count` slots onto the front.
    fn push_chain(&mut self, head: *mut FreeSlot, count: u32) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        for _ in 1..count {
            let next = unsafe { (*tail).next };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe { (*tail).next = self.head };
        self.head = head;
        self.count += count;
    }
}

/// One TLAB per OS thread.
pub struct Tlab {
    /// The per-CPU heap this TLAB fronts; `OWNER_NONE` until bound.
    heap_id: u32,
    lists: [CacheList; NUM_SIZE_CLASSES],
    /// Total bytes across all cached lists.
    cached_bytes: usize,
}

impl Tlab {
    /// Const-constructible for `#[thread_local]` statics; `heap_id` doubles
    /// as the "not yet bound" sentinel.
    pub const fn new() -> Self {
        Self {
            heap_id: OWNER_NONE,
            lists: [const { CacheList::new() }; NUM_SIZE_CLASSES],
            cached_bytes: 0,
        }
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.heap_id != OWNER_NONE
    }

    #[inline]
    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    /// Attach to a per-CPU heap (thread start).
    pub fn bind(&mut self, heap_id: u32) {
        debug_assert!(!self.is_bound());
        self.heap_id = heap_id;
    }

    /// Allocate one slot of `class`. Classes too large to cache are
    /// forwarded to the heap; cached classes pop locally and refill in
    /// batches on a miss.
    ///
    /// # Safety
    ///
    /// The TLAB must be bound to a heap of `pool`; `class` must be a valid
    /// size-class index.
    pub unsafe fn alloc(
        &mut self,
        class: usize,
        pool: &HeapPool,
        global: &GlobalHeap,
    ) -> *mut u8 {
        debug_assert!(self.is_bound());
        let heap = pool.heap(self.heap_id);
        if !size_class::class_is_cached(class) {
            return unsafe { heap.alloc(class, global) };
        }

        let slot = self.lists[class].pop();
        if !slot.is_null() {
            stat_inc!(tlab_hits);
            self.cached_bytes -= size_class::size_of_class(class);
            return slot as *mut u8;
        }

        stat_inc!(tlab_misses);
        let batch = size_class::class_info(class)
            .batch
            .min(MAX_CACHED_PER_CLASS as usize)
            .max(1);
        let (count, head) = unsafe { heap.alloc_batch(class, batch, global) };
        if count == 0 {
            return ptr::null_mut();
        }
        // Hand out the first slot, keep the rest
        let first = head;
        let rest = unsafe { (*head).next };
        if count > 1 {
            self.lists[class].push_chain(rest, (count - 1) as u32);
            self.cached_bytes += (count - 1) * size_class::size_of_class(class);
        }
        first as *mut u8
    }

    /// Cache a freed slot of a cached class whose superblock is owned by
    /// this TLAB's heap. `slot` must be normalized. Overflowing either cap
    /// flushes in bulk through the heap's free path.
    ///
    /// # Safety
    ///
    /// The TLAB must be bound; `slot` must be a live, normalized slot of a
    /// `class` superblock owned by `pool.heap(self.heap_id())` at routing
    /// time, not reachable by any other free.
    pub unsafe fn free_cached(
        &mut self,
        class: usize,
        slot: *mut u8,
        pool: &HeapPool,
        global: &GlobalHeap,
    ) {
        debug_assert!(self.is_bound());
        debug_assert!(size_class::class_is_cached(class));
        self.lists[class].push(slot as *mut FreeSlot);
        self.cached_bytes += size_class::size_of_class(class);

        if self.lists[class].count > MAX_CACHED_PER_CLASS {
            stat_inc!(tlab_flushes);
            unsafe { self.flush(class, MAX_CACHED_PER_CLASS / 2, pool, global) };
        } else if self.cached_bytes > MAX_CACHED_BYTES_TOTAL {
            stat_inc!(tlab_flushes);
            unsafe { self.flush(class, 0, pool, global) };
        }
    }

    /// Return cached slots of `class` to the heap until at most `keep`
    /// remain.
    unsafe fn flush(&mut self, class: usize, keep: u32, pool: &HeapPool, global: &GlobalHeap) {
        let heap = pool.heap(self.heap_id);
        let size = size_class::size_of_class(class);
        while self.lists[class].count > keep {
            let slot = self.lists[class].pop() as *mut u8;
            self.cached_bytes -= size;
            unsafe { heap.free_local(class, Superblock::of(slot), slot, global) };
        }
    }

    /// Flush every class back to the heap and drain its delayed queues
    /// (thread exit). The TLAB is unbound afterwards.
    ///
    /// # Safety
    ///
    /// Must be called at most once per binding, with no further use of the
    /// TLAB until rebound.
    pub unsafe fn clear(&mut self, pool: &HeapPool, global: &GlobalHeap) {
        if !self.is_bound() {
            return;
        }
        for class in 1..NUM_SIZE_CLASSES {
            unsafe { self.flush(class, 0, pool, global) };
        }
        debug_assert!(self.cached_bytes == 0);
        unsafe { pool.heap(self.heap_id).drain_all() };
        self.heap_id = OWNER_NONE;
    }
}

impl Default for Tlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::class_of;
    use std::boxed::Box;
    use std::vec::Vec;

    fn make_env() -> (&'static HeapPool, &'static GlobalHeap) {
        let pool = Box::leak(Box::new(HeapPool::new()));
        let global = Box::leak(Box::new(GlobalHeap::new()));
        (pool, global)
    }

    #[test]
    fn test_alloc_and_cache_round_trip() {
        let (pool, global) = make_env();
        let mut tlab = Tlab::new();
        tlab.bind(1);
        let class = class_of(64);
        unsafe {
            let p = tlab.alloc(class, pool, global);
            assert!(!p.is_null());
            tlab.free_cached(class, p, pool, global);

            // LIFO reuse straight from the cache
            let q = tlab.alloc(class, pool, global);
            assert_eq!(q, p);
            tlab.free_cached(class, q, pool, global);
            tlab.clear(pool, global);
        }
    }

    #[test]
    fn test_refill_leaves_batch_minus_one_cached() {
        let (pool, global) = make_env();
        let mut tlab = Tlab::new();
        tlab.bind(2);
        let class = class_of(16);
        let batch = size_class::class_info(class).batch;
        unsafe {
            let p = tlab.alloc(class, pool, global);
            assert!(!p.is_null());
            assert_eq!(tlab.lists[class].count as usize, batch - 1);
            // in_use covers the handed-out slot and the cached ones
            assert_eq!(pool.heap(2).stats(class).in_use() as usize, batch);
            tlab.free_cached(class, p, pool, global);
            tlab.clear(pool, global);
            assert_eq!(pool.heap(2).stats(class).in_use(), 0);
        }
    }

    #[test]
    fn test_large_classes_bypass_cache() {
        let (pool, global) = make_env();
        let mut tlab = Tlab::new();
        tlab.bind(3);
        let class = class_of(4096);
        assert!(!size_class::class_is_cached(class));
        unsafe {
            let p = tlab.alloc(class, pool, global);
            assert!(!p.is_null());
            assert_eq!(tlab.cached_bytes, 0);
            // Not cached: goes straight back through the heap
            pool.heap(3)
                .free_local(class, Superblock::of(p), p, global);
            tlab.clear(pool, global);
        }
    }

    #[test]
    fn test_count_cap_triggers_flush() {
        let (pool, global) = make_env();
        let mut tlab = Tlab::new();
        tlab.bind(4);
        let class = class_of(32);
        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..MAX_CACHED_PER_CLASS + 1 {
                let p = pool.heap(4).alloc(class, global);
                ptrs.push(p);
            }
            for p in ptrs {
                tlab.free_cached(class, p, pool, global);
            }
            // The overflow flushed down to half the cap
            assert!(tlab.lists[class].count <= MAX_CACHED_PER_CLASS / 2 + 1);
            tlab.clear(pool, global);
            assert_eq!(pool.heap(4).stats(class).in_use(), 0);
        }
    }

    #[test]
    fn test_clear_unbinds_and_drains() {
        let (pool, global) = make_env();
        let mut tlab = Tlab::new();
        tlab.bind(5);
        let class = class_of(128);
        unsafe {
            let p = tlab.alloc(class, pool, global);
            let q = tlab.alloc(class, pool, global);
            tlab.free_cached(class, p, pool, global);

            // A cross-thread free parks on the delayed queue
            let sb = Superblock::of(q);
            (*sb).push_delayed(q);

            tlab.clear(pool, global);
            assert!(!tlab.is_bound());
            // clear() flushed the cache and drained the delayed queue
            assert_eq!(pool.heap(5).stats(class).in_use(), 0);
        }
    }
}
