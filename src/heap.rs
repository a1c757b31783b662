//! Per-CPU heaps: the middle tier that owns superblocks.
//!
//! A fixed pool of `NUM_HEAPS` heaps serves whichever threads are mapped to
//! each. A heap keeps one bin per size class (a spin-locked emptiness
//! classifier) plus two relaxed counters per class: `in_use` (live objects)
//! and `allocated` (slot capacity across owned superblocks). When frees push
//! the in-use fraction of a class below `(E-1)/E` with at least two
//! superblocks' worth of slack, the heap donates its emptiest superblock to
//! the global heap. The slack term is the hysteresis that keeps superblocks
//! from ping-ponging.

use crate::config::{EMPTINESS_BUCKETS, NUM_HEAPS, SUPERBLOCK_SIZE};
use crate::emptiness::EmptinessBins;
use crate::global_heap::GlobalHeap;
use crate::segment;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::superblock::{FreeSlot, Superblock, OWNER_GLOBAL};
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Occupancy counters for one size class. Relaxed ordering throughout: the
/// migration threshold tolerates a few in-flight operations of drift, and
/// the bin locks order everything that matters.
pub struct ClassStats {
    in_use: AtomicU32,
    allocated: AtomicU32,
}

impl ClassStats {
    const fn new() -> Self {
        Self {
            in_use: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// The migration predicate: true when in-use has dropped below (E-1)/E of
/// allocated *and* the slack is at least two superblocks of objects.
#[inline]
fn threshold_crossed(in_use: u32, allocated: u32, slot_size: usize) -> bool {
    let e = EMPTINESS_BUCKETS as u64;
    (e * in_use as u64) < (e - 1) * allocated as u64
        && (in_use as usize) + (2 * SUPERBLOCK_SIZE) / slot_size < allocated as usize
}

/// One heap of the pool.
pub struct PerHeap {
    /// Bins indexed by size class (index 0 unused).
    bins: [SpinMutex<EmptinessBins>; NUM_SIZE_CLASSES],
    stats: [ClassStats; NUM_SIZE_CLASSES],
    /// True while any live thread is mapped here. Cleared on last thread
    /// exit, which makes this heap's superblocks eligible for reclaim.
    active: AtomicBool,
    /// This heap's owner tag (`OWNER_GLOBAL` for the global heap's inner).
    id: u32,
}

impl PerHeap {
    pub const fn new(id: u32) -> Self {
        Self {
            bins: [const { SpinMutex::new(EmptinessBins::new()) }; NUM_SIZE_CLASSES],
            stats: [const { ClassStats::new() }; NUM_SIZE_CLASSES],
            active: AtomicBool::new(false),
            id,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    #[inline]
    pub fn stats(&self, class: usize) -> &ClassStats {
        &self.stats[class]
    }

    pub(crate) fn bin(&self, class: usize) -> &SpinMutex<EmptinessBins> {
        &self.bins[class]
    }

    /// Allocate one slot of `class`. Drains pending cross-thread frees for
    /// the class first, converting them into local capacity. On a miss,
    /// pulls a superblock from the global heap, else maps a fresh one, and
    /// retries. Null only when the OS is out of memory.
    ///
    /// # Safety
    ///
    /// `class` must be a valid size-class index (1..NUM_SIZE_CLASSES).
    pub unsafe fn alloc(&self, class: usize, global: &GlobalHeap) -> *mut u8 {
        loop {
            {
                let mut bin = self.bins[class].lock();
                let drained = unsafe { bin.drain_all() };
                if drained > 0 {
                    stat_add!(delayed_drained, drained as u64);
                    self.stats[class].in_use.fetch_sub(drained, Ordering::Relaxed);
                }
                let ptr = unsafe { bin.alloc() };
                if !ptr.is_null() {
                    self.stats[class].in_use.fetch_add(1, Ordering::Relaxed);
                    return ptr;
                }
            }
            if !unsafe { self.grow(class, global) } {
                return ptr::null_mut();
            }
        }
    }

    /// Allocate up to `want` slots of `class` as a singly-linked batch
    /// under one bin-lock acquisition (TLAB refill). Returns the number of
    /// slots and the list head.
    ///
    /// # Safety
    ///
    /// `class` must be a valid size-class index.
    pub unsafe fn alloc_batch(
        &self,
        class: usize,
        want: usize,
        global: &GlobalHeap,
    ) -> (usize, *mut FreeSlot) {
        loop {
            {
                let mut bin = self.bins[class].lock();
                let drained = unsafe { bin.drain_all() };
                if drained > 0 {
                    stat_add!(delayed_drained, drained as u64);
                    self.stats[class].in_use.fetch_sub(drained, Ordering::Relaxed);
                }
                let mut head: *mut FreeSlot = ptr::null_mut();
                let mut count = 0;
                while count < want {
                    let p = unsafe { bin.alloc() };
                    if p.is_null() {
                        break;
                    }
                    let node = p as *mut FreeSlot;
                    unsafe { (*node).next = head };
                    head = node;
                    count += 1;
                }
                if count > 0 {
                    self.stats[class]
                        .in_use
                        .fetch_add(count as u32, Ordering::Relaxed);
                    return (count, head);
                }
            }
            if !unsafe { self.grow(class, global) } {
                return (0, ptr::null_mut());
            }
        }
    }

    /// Slow path: obtain another superblock for `class` and put it on this
    /// heap. False only on OOM.
    unsafe fn grow(&self, class: usize, global: &GlobalHeap) -> bool {
        let mut sb = unsafe { global.get(class, self.id) };
        if sb.is_null() {
            let chunk = segment::map(SUPERBLOCK_SIZE, SUPERBLOCK_SIZE);
            if chunk.is_null() {
                return false;
            }
            sb = unsafe { Superblock::init(chunk, size_class::size_of_class(class)) };
        } else {
            stat_inc!(global_pulls);
        }
        unsafe { self.put(sb, class) };
        true
    }

    /// Free a normalized slot into a superblock this heap is believed to
    /// own, then evaluate the migration threshold. If the superblock
    /// migrated away before the bin lock was acquired, the free degrades to
    /// a delayed push, which the new owner will drain.
    ///
    /// # Safety
    ///
    /// `sb` must be a valid superblock of `class`; `slot` one of its live,
    /// normalized slot bases, not reachable by any other free.
    pub unsafe fn free_local(
        &self,
        class: usize,
        sb: *mut Superblock,
        slot: *mut u8,
        global: &GlobalHeap,
    ) {
        {
            let mut bin = self.bins[class].lock();
            // Ownership can only change under this bin lock, so the check
            // is authoritative while we hold it.
            if unsafe { (*sb).owner() } != self.id {
                drop(bin);
                stat_inc!(delayed_pushes);
                unsafe { (*sb).push_delayed(slot) };
                return;
            }
            unsafe { bin.free_slot(sb, slot) };
        }
        let u = self.stats[class].in_use.fetch_sub(1, Ordering::Relaxed) - 1;
        let a = self.stats[class].allocated.load(Ordering::Relaxed);
        if self.id != OWNER_GLOBAL
            && threshold_crossed(u, a, size_class::size_of_class(class))
        {
            unsafe { self.migrate_one(class, global) };
        }
    }

    /// Receive a superblock: take ownership, drain anything that
    /// accumulated in transit, insert, and account its occupancy.
    ///
    /// # Safety
    ///
    /// `sb` must be a valid superblock carved for `class`, currently in no
    /// bin, with no other thread treating it as owned.
    pub unsafe fn put(&self, sb: *mut Superblock, class: usize) {
        debug_assert!(unsafe { (*sb).object_size() } == size_class::size_of_class(class));
        let mut bin = self.bins[class].lock();
        unsafe {
            (*sb).lock();
            (*sb).set_owner(self.id);
            (*sb).unlock();
            (*sb).drain_delayed();
            bin.put(sb);
            let total = (*sb).total_slots();
            let used = total - (*sb).free_slots();
            self.stats[class].allocated.fetch_add(total, Ordering::Relaxed);
            self.stats[class].in_use.fetch_add(used, Ordering::Relaxed);
        }
    }

    /// Donate the emptiest superblock of `class` to `new_owner`, stripping
    /// its occupancy from this heap's stats. Null if the bin is empty.
    ///
    /// # Safety
    ///
    /// `new_owner` must be a live heap's owner tag.
    pub unsafe fn get(&self, class: usize, new_owner: u32) -> *mut Superblock {
        let mut bin = self.bins[class].lock();
        let sb = unsafe { bin.get() };
        if sb.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            let total = (*sb).total_slots();
            let used = total - (*sb).free_slots();
            self.stats[class].allocated.fetch_sub(total, Ordering::Relaxed);
            self.stats[class].in_use.fetch_sub(used, Ordering::Relaxed);
            (*sb).lock();
            (*sb).set_owner(new_owner);
            (*sb).unlock();
        }
        sb
    }

    /// Remove a specific superblock for reclaim, verifying under the bin
    /// lock that this heap still owns it. Returns false if ownership moved.
    ///
    /// # Safety
    ///
    /// `sb` must be a valid superblock of `class`.
    pub unsafe fn take_for_reclaim(
        &self,
        sb: *mut Superblock,
        class: usize,
        new_owner: u32,
    ) -> bool {
        let mut bin = self.bins[class].lock();
        if unsafe { (*sb).owner() } != self.id {
            return false;
        }
        unsafe {
            bin.remove(sb);
            let total = (*sb).total_slots();
            let used = total - (*sb).free_slots();
            self.stats[class].allocated.fetch_sub(total, Ordering::Relaxed);
            self.stats[class].in_use.fetch_sub(used, Ordering::Relaxed);
            (*sb).lock();
            (*sb).set_owner(new_owner);
            (*sb).unlock();
        }
        true
    }

    /// Pop the emptiest superblock and hand it to the global heap.
    unsafe fn migrate_one(&self, class: usize, global: &GlobalHeap) {
        let sb = unsafe { self.get(class, OWNER_GLOBAL) };
        if sb.is_null() {
            return;
        }
        stat_inc!(global_migrations);
        unsafe { global.put(sb, class) };
    }

    /// Drain every bin's delayed queues (thread exit).
    ///
    /// # Safety
    ///
    /// Callable from any thread; takes each bin lock in turn.
    pub unsafe fn drain_all(&self) {
        for class in 1..NUM_SIZE_CLASSES {
            let mut bin = self.bins[class].lock();
            let drained = unsafe { bin.drain_all() };
            if drained > 0 {
                stat_add!(delayed_drained, drained as u64);
                self.stats[class].in_use.fetch_sub(drained, Ordering::Relaxed);
            }
        }
    }
}

/// The fixed pool of per-CPU heaps.
pub struct HeapPool {
    heaps: [PerHeap; NUM_HEAPS],
}

impl HeapPool {
    pub const fn new() -> Self {
        let mut heaps = [const { PerHeap::new(0) }; NUM_HEAPS];
        let mut i = 1;
        while i < NUM_HEAPS {
            heaps[i] = PerHeap::new(i as u32);
            i += 1;
        }
        Self { heaps }
    }

    #[inline]
    pub fn heap(&self, id: u32) -> &PerHeap {
        &self.heaps[id as usize]
    }

    #[inline]
    pub fn heaps(&self) -> &[PerHeap; NUM_HEAPS] {
        &self.heaps
    }
}

impl Default for HeapPool {
    fn default() -> Self {
        Self::new()
    }
}
