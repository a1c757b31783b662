//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own locks provide the
//! ordering guarantees for correctness; these counters are purely for
//! monitoring.
//!
//! Recording compiles to nothing unless the `stats` feature is enabled;
//! [`snapshot`] then returns all-zero values.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Front-end ----
    /// Total allocation requests with size > 0.
    pub alloc_count: AtomicU64,
    /// Total release requests for non-null pointers.
    pub dealloc_count: AtomicU64,
    /// Total resize requests (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes.
    pub alloc_bytes: AtomicU64,
    /// Frees of pointers the allocator does not own (silently dropped).
    pub invalid_frees: AtomicU64,

    // ---- TLAB ----
    /// Allocations served from the thread-local cache (no locks taken).
    pub tlab_hits: AtomicU64,
    /// Thread-cache misses that refilled from the per-CPU heap.
    pub tlab_misses: AtomicU64,
    /// Cache overflows flushed back to the heap in bulk.
    pub tlab_flushes: AtomicU64,

    // ---- Heap hierarchy ----
    /// Superblocks pulled from the global heap instead of the OS.
    pub global_pulls: AtomicU64,
    /// Superblocks donated to the global heap by the migration threshold.
    pub global_migrations: AtomicU64,
    /// Superblocks transferred from an abandoned owner to the freeing
    /// thread's heap.
    pub reclaims: AtomicU64,
    /// Cross-thread frees parked on a delayed queue.
    pub delayed_pushes: AtomicU64,
    /// Slots recovered by draining delayed queues.
    pub delayed_drained: AtomicU64,

    // ---- Page source ----
    /// Mappings obtained from the OS.
    pub segment_maps: AtomicU64,
    /// Bytes obtained from the OS.
    pub segment_map_bytes: AtomicU64,
    /// Mappings returned to the OS.
    pub segment_unmaps: AtomicU64,
    /// Fully-empty superblocks unmapped past the global retention cap.
    pub superblock_unmaps: AtomicU64,

    // ---- Big objects ----
    /// Big-object allocations.
    pub big_allocs: AtomicU64,
    /// Block bytes mapped for big objects.
    pub big_alloc_bytes: AtomicU64,
    /// Big allocations served from the retention cache.
    pub big_cache_hits: AtomicU64,
    /// Big blocks released to the OS over the retention budget.
    pub big_releases: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            tlab_hits: AtomicU64::new(0),
            tlab_misses: AtomicU64::new(0),
            tlab_flushes: AtomicU64::new(0),
            global_pulls: AtomicU64::new(0),
            global_migrations: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            delayed_pushes: AtomicU64::new(0),
            delayed_drained: AtomicU64::new(0),
            segment_maps: AtomicU64::new(0),
            segment_map_bytes: AtomicU64::new(0),
            segment_unmaps: AtomicU64::new(0),
            superblock_unmaps: AtomicU64::new(0),
            big_allocs: AtomicU64::new(0),
            big_alloc_bytes: AtomicU64::new(0),
            big_cache_hits: AtomicU64::new(0),
            big_releases: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between
/// loads. For monitoring purposes this is always sufficient.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub invalid_frees: u64,
    pub tlab_hits: u64,
    pub tlab_misses: u64,
    pub tlab_flushes: u64,
    pub global_pulls: u64,
    pub global_migrations: u64,
    pub reclaims: u64,
    pub delayed_pushes: u64,
    pub delayed_drained: u64,
    pub segment_maps: u64,
    pub segment_map_bytes: u64,
    pub segment_unmaps: u64,
    pub superblock_unmaps: u64,
    pub big_allocs: u64,
    pub big_alloc_bytes: u64,
    pub big_cache_hits: u64,
    pub big_releases: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        invalid_frees: s.invalid_frees.load(Ordering::Relaxed),
        tlab_hits: s.tlab_hits.load(Ordering::Relaxed),
        tlab_misses: s.tlab_misses.load(Ordering::Relaxed),
        tlab_flushes: s.tlab_flushes.load(Ordering::Relaxed),
        global_pulls: s.global_pulls.load(Ordering::Relaxed),
        global_migrations: s.global_migrations.load(Ordering::Relaxed),
        reclaims: s.reclaims.load(Ordering::Relaxed),
        delayed_pushes: s.delayed_pushes.load(Ordering::Relaxed),
        delayed_drained: s.delayed_drained.load(Ordering::Relaxed),
        segment_maps: s.segment_maps.load(Ordering::Relaxed),
        segment_map_bytes: s.segment_map_bytes.load(Ordering::Relaxed),
        segment_unmaps: s.segment_unmaps.load(Ordering::Relaxed),
        superblock_unmaps: s.superblock_unmaps.load(Ordering::Relaxed),
        big_allocs: s.big_allocs.load(Ordering::Relaxed),
        big_alloc_bytes: s.big_alloc_bytes.load(Ordering::Relaxed),
        big_cache_hits: s.big_cache_hits.load(Ordering::Relaxed),
        big_releases: s.big_releases.load(Ordering::Relaxed),
    }
}
