//! The global heap: process-wide broker of superblocks.
//!
//! Per-CPU heaps donate near-empty superblocks here when their migration
//! threshold fires and pull superblocks back on demand, so memory freed by
//! one thread's workload can serve another's without touching the OS. The
//! global heap is the top of the hierarchy: it never migrates outward
//! (its threshold is constantly false), and it is the only place small-object
//! superblocks are returned to the page source, via a per-class cap on
//! retained fully-empty superblocks.

use crate::config::{RETAINED_EMPTY_PER_CLASS, SUPERBLOCK_SIZE};
use crate::heap::PerHeap;
use crate::segment;
use crate::stat_inc;
use crate::superblock::{Superblock, OWNER_GLOBAL};

pub struct GlobalHeap {
    inner: PerHeap,
}

impl GlobalHeap {
    pub const fn new() -> Self {
        Self {
            inner: PerHeap::new(OWNER_GLOBAL),
        }
    }

    /// Accept a superblock from a per-CPU heap. A completely empty
    /// superblock arriving while the class already retains
    /// `RETAINED_EMPTY_PER_CLASS` empties is unmapped instead of cached.
    ///
    /// # Safety
    ///
    /// `sb` must be a valid superblock carved for `class`, currently in no
    /// bin, with no other thread treating it as owned and no live slots
    /// reachable from anywhere but its delayed queue.
    pub unsafe fn put(&self, sb: *mut Superblock, class: usize) {
        unsafe {
            {
                let bin = self.inner.bin(class).lock();
                // Whatever landed on the delayed queue in transit belongs to
                // the free count before the retention decision.
                (*sb).drain_delayed();
                if (*sb).is_empty() && bin.empty_count() >= RETAINED_EMPTY_PER_CLASS {
                    drop(bin);
                    stat_inc!(superblock_unmaps);
                    segment::unmap(sb as *mut u8, SUPERBLOCK_SIZE);
                    return;
                }
            }
            self.inner.put(sb, class);
        }
    }

    /// Hand a superblock of `class` to a requesting heap, or null when none
    /// is available.
    ///
    /// # Safety
    ///
    /// `new_owner` must be a live heap's owner tag.
    pub unsafe fn get(&self, class: usize, new_owner: u32) -> *mut Superblock {
        unsafe { self.inner.get(class, new_owner) }
    }

    /// The bin machinery, for lock-all and the reclaim path (frees into
    /// global-owned superblocks transfer the superblock to the caller).
    pub(crate) fn as_heap(&self) -> &PerHeap {
        &self.inner
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}
