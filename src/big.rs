//! Big objects: requests too large for any small size class.
//!
//! Each big allocation is a dedicated page-granular mapping whose base is
//! superblock-aligned and carries the shared header with a single slot, so
//! the free path can find it with the same bit-mask lookup small objects
//! use. The pointer handed out sits immediately after the header.
//!
//! Freed blocks are not returned to the OS right away: a retention cache,
//! segregated by geometric size class (25% growth steps), keeps idle blocks
//! around for reuse as long as retained bytes stay within a fraction of
//! currently-live bytes (with a floor so small programs keep something).
//! Blocks over the threshold, and blocks too large for the class table, are
//! unmapped immediately on free.

use crate::config::{BIG_RETENTION_FLOOR_BYTES, BIG_RETENTION_PERCENT, SUPERBLOCK_SIZE};
use crate::segment::{self, round_to_pages};
use crate::size_class::SMALL_BIG_BOUNDARY;
use crate::superblock::{FreeSlot, Superblock, HEADER_SIZE, OWNER_BIG};
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::ptr;

/// Total block bytes (header included) of the smallest big class.
const FIRST_BIG_TOTAL: usize = round_to_pages(HEADER_SIZE + SMALL_BIG_BOUNDARY + 1);

/// Blocks beyond this never enter the class table (or the cache).
const MAX_BIG_TOTAL: usize = 1 << 31;

const fn next_big_total(total: usize) -> usize {
    round_to_pages(total + total / 4)
}

const fn count_big_classes() -> usize {
    let mut n = 1;
    let mut size = FIRST_BIG_TOTAL;
    while size < MAX_BIG_TOTAL {
        size = next_big_total(size);
        n += 1;
    }
    n
}

pub const NUM_BIG_CLASSES: usize = count_big_classes();

/// Block sizes per class, ascending, page-granular, ending at or above
/// `MAX_BIG_TOTAL`.
static BIG_CLASS_TOTALS: [usize; NUM_BIG_CLASSES] = const {
    let mut table = [0usize; NUM_BIG_CLASSES];
    let mut size = FIRST_BIG_TOTAL;
    let mut i = 0;
    while i < NUM_BIG_CLASSES {
        table[i] = size;
        size = next_big_total(size);
        i += 1;
    }
    table
};

/// Smallest class whose block holds `total` bytes, or None above the table.
#[inline]
fn class_of_total(total: usize) -> Option<usize> {
    if total > BIG_CLASS_TOTALS[NUM_BIG_CLASSES - 1] {
        return None;
    }
    let mut lo = 0;
    let mut hi = NUM_BIG_CLASSES - 1;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if BIG_CLASS_TOTALS[mid] < total {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Some(lo)
}

struct BigCache {
    /// Idle blocks per class, linked through their payloads.
    bins: [*mut FreeSlot; NUM_BIG_CLASSES],
    /// Bytes in live (handed-out) blocks.
    live_bytes: usize,
    /// Bytes parked in `bins`.
    retained_bytes: usize,
}

// SAFETY: only accessed under the SpinMutex; pointers reference mappings
// that outlive any thread.
unsafe impl Send for BigCache {}

impl BigCache {
    const fn new() -> Self {
        Self {
            bins: [ptr::null_mut(); NUM_BIG_CLASSES],
            live_bytes: 0,
            retained_bytes: 0,
        }
    }

    /// Retained-byte budget for the current live total.
    #[inline]
    fn retention_limit(&self) -> usize {
        let ratio = self.live_bytes / 100 * BIG_RETENTION_PERCENT;
        if ratio > BIG_RETENTION_FLOOR_BYTES {
            ratio
        } else {
            BIG_RETENTION_FLOOR_BYTES
        }
    }
}

/// The process-wide big-object heap.
pub struct BigHeap {
    cache: SpinMutex<BigCache>,
}

impl BigHeap {
    pub const fn new() -> Self {
        Self {
            cache: SpinMutex::new(BigCache::new()),
        }
    }

    pub(crate) fn lock_raw(&self) {
        self.cache.lock_raw();
    }

    pub(crate) unsafe fn unlock_raw(&self) {
        unsafe { self.cache.unlock_raw() };
    }

    /// Allocate `sz` usable bytes. Returns null on OOM.
    pub fn alloc(&self, sz: usize) -> *mut u8 {
        debug_assert!(sz > SMALL_BIG_BOUNDARY);
        stat_inc!(big_allocs);
        let need = HEADER_SIZE + sz;

        let total = match class_of_total(need) {
            Some(class) => {
                let total = BIG_CLASS_TOTALS[class];
                {
                    let mut cache = self.cache.lock();
                    let block = cache.bins[class];
                    if !block.is_null() {
                        cache.bins[class] = unsafe { (*block).next };
                        cache.retained_bytes -= total;
                        cache.live_bytes += total;
                        stat_inc!(big_cache_hits);
                        let base = unsafe { (block as *mut u8).sub(HEADER_SIZE) };
                        debug_assert!(unsafe { (*(base as *mut Superblock)).is_valid() });
                        return block as *mut u8;
                    }
                }
                total
            }
            // Off the table: map exactly, never cache.
            None => round_to_pages(need),
        };

        let chunk = segment::map(total, SUPERBLOCK_SIZE);
        if chunk.is_null() {
            return ptr::null_mut();
        }
        let sb = unsafe { Superblock::init_big(chunk, total - HEADER_SIZE) };
        unsafe { (*sb).set_owner(OWNER_BIG) };
        self.cache.lock().live_bytes += total;
        stat_add!(big_alloc_bytes, total as u64);
        unsafe { chunk.add(HEADER_SIZE) }
    }

    /// Free the block whose header is `sb` (found by mask). Retains the
    /// block for reuse when the retention budget allows, else unmaps it.
    ///
    /// # Safety
    ///
    /// `sb` must be the valid header of a live big block produced by
    /// [`BigHeap::alloc`], not freed since.
    pub unsafe fn free(&self, sb: *mut Superblock) {
        let total = round_to_pages(HEADER_SIZE + unsafe { (*sb).object_size() });
        let class = class_of_total(total);
        let cacheable = matches!(class, Some(c) if BIG_CLASS_TOTALS[c] == total);

        {
            let mut cache = self.cache.lock();
            debug_assert!(cache.live_bytes >= total);
            cache.live_bytes -= total;
            if cacheable && cache.retained_bytes + total <= cache.retention_limit() {
                let class = class.unwrap();
                let node = unsafe { (sb as *mut u8).add(HEADER_SIZE) } as *mut FreeSlot;
                unsafe { (*node).next = cache.bins[class] };
                cache.bins[class] = node;
                cache.retained_bytes += total;
                return;
            }
        }
        stat_inc!(big_releases);
        unsafe { segment::unmap(sb as *mut u8, total) };
    }
}

impl Default for BigHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use std::vec::Vec;

    #[test]
    fn test_class_table_shape() {
        assert!(FIRST_BIG_TOTAL % PAGE_SIZE == 0);
        for i in 0..NUM_BIG_CLASSES {
            assert_eq!(BIG_CLASS_TOTALS[i] % PAGE_SIZE, 0, "class {} not page granular", i);
            if i > 0 {
                assert!(BIG_CLASS_TOTALS[i] > BIG_CLASS_TOTALS[i - 1]);
                // Bounded internal fragmentation: each step grows by <= ~25%
                // plus page rounding.
                assert!(
                    BIG_CLASS_TOTALS[i]
                        <= BIG_CLASS_TOTALS[i - 1] + BIG_CLASS_TOTALS[i - 1] / 4 + PAGE_SIZE
                );
            }
        }
        assert!(BIG_CLASS_TOTALS[NUM_BIG_CLASSES - 1] >= MAX_BIG_TOTAL);
    }

    #[test]
    fn test_class_of_total() {
        assert_eq!(class_of_total(FIRST_BIG_TOTAL), Some(0));
        assert_eq!(class_of_total(1), Some(0));
        for i in 0..NUM_BIG_CLASSES {
            assert_eq!(class_of_total(BIG_CLASS_TOTALS[i]), Some(i));
        }
        assert_eq!(class_of_total(BIG_CLASS_TOTALS[NUM_BIG_CLASSES - 1] + 1), None);
    }

    #[test]
    fn test_alloc_header_and_mask() {
        let heap = BigHeap::new();
        let sz = 100 * 1024;
        let p = heap.alloc(sz);
        assert!(!p.is_null());
        unsafe {
            let sb = Superblock::of(p);
            assert_eq!(sb as usize + HEADER_SIZE, p as usize);
            assert!((*sb).is_valid());
            assert_eq!((*sb).owner(), OWNER_BIG);
            assert!((*sb).object_size() >= sz);
            assert!((*sb).usable_size(p) >= sz);
            heap.free(sb);
        }
    }

    #[test]
    fn test_retained_block_is_reused() {
        let heap = BigHeap::new();
        let sz = 256 * 1024;
        let p1 = heap.alloc(sz);
        assert!(!p1.is_null());
        unsafe { heap.free(Superblock::of(p1)) };
        // Retained (under the floor), so the same block comes back
        let p2 = heap.alloc(sz);
        assert_eq!(p2, p1);
        unsafe { heap.free(Superblock::of(p2)) };
    }

    #[test]
    fn test_over_threshold_blocks_released() {
        let heap = BigHeap::new();
        // With nothing live, the budget is exactly the floor. Free more
        // idle bytes than the floor and the excess must be unmapped.
        let sz = 900 * 1024;
        let p1 = heap.alloc(sz);
        let p2 = heap.alloc(sz);
        let p3 = heap.alloc(sz);
        assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());
        unsafe {
            heap.free(Superblock::of(p1));
            heap.free(Superblock::of(p2));
            heap.free(Superblock::of(p3));
        }
        let cache = heap.cache.lock();
        assert!(cache.retained_bytes <= BIG_RETENTION_FLOOR_BYTES);
        assert_eq!(cache.live_bytes, 0);
    }

    #[test]
    fn test_live_bytes_raise_retention_budget() {
        let heap = BigHeap::new();
        // Keep a lot live so the ratio term dominates the floor
        let live_sz = 4 * 1024 * 1024;
        let mut live = Vec::new();
        for _ in 0..8 {
            let p = heap.alloc(live_sz);
            assert!(!p.is_null());
            live.push(p);
        }
        // Now idle blocks well past the floor still get retained
        let idle_sz = 700 * 1024;
        let a = heap.alloc(idle_sz);
        let b = heap.alloc(idle_sz);
        unsafe {
            heap.free(Superblock::of(a));
            heap.free(Superblock::of(b));
        }
        {
            let cache = heap.cache.lock();
            assert!(cache.retained_bytes > BIG_RETENTION_FLOOR_BYTES);
        }
        for p in live {
            unsafe { heap.free(Superblock::of(p)) };
        }
    }

    #[test]
    fn test_different_sizes_share_class_blocks() {
        let heap = BigHeap::new();
        let p1 = heap.alloc(40 * 1024);
        let class_total = unsafe { HEADER_SIZE + (*Superblock::of(p1)).object_size() };
        unsafe { heap.free(Superblock::of(p1)) };
        // A slightly different size in the same class reuses the block
        let p2 = heap.alloc(class_total - HEADER_SIZE - 512);
        assert_eq!(p2, p1);
        unsafe { heap.free(Superblock::of(p2)) };
    }

    #[test]
    fn test_huge_block_released_over_budget() {
        let heap = BigHeap::new();
        let sz = 64 * 1024 * 1024;
        let p = heap.alloc(sz);
        assert!(!p.is_null());
        unsafe {
            *p = 1;
            *p.add(sz - 1) = 2;
            heap.free(Superblock::of(p));
        }
        let cache = heap.cache.lock();
        assert_eq!(cache.live_bytes, 0);
    }
}
