//! Free-path routing and thread-to-heap lifecycle.
//!
//! Every free funnels through [`free`]: mask the address to the candidate
//! superblock, validate its header (pointers that never came from this
//! allocator are silently dropped), and dispatch by object size and
//! ownership. Frees into superblocks owned by the caller's heap complete
//! locally (through the TLAB when the class is cached); frees into an
//! abandoned owner — an inactive heap or the global heap — *reclaim* the
//! whole superblock into the caller's heap so the free, and future ones,
//! become local; everything else goes onto the superblock's lock-free
//! delayed queue for the owner to drain.
//!
//! Thread assignment keeps two tables under one manager lock: which heap a
//! thread id maps to, and how many live threads each heap carries. A thread
//! picks the first unused heap (sharing only when all are taken), and the
//! count reaching zero is what arms the reclaim path for that heap.

use crate::big::BigHeap;
use crate::config::{MAX_THREADS, NUM_HEAPS};
use crate::global_heap::GlobalHeap;
use crate::heap::{HeapPool, PerHeap};
use crate::size_class::{self, NUM_SIZE_CLASSES, SMALL_BIG_BOUNDARY};
use crate::stat_inc;
use crate::superblock::{Superblock, OWNER_GLOBAL, OWNER_NONE};
use crate::sync::SpinMutex;
use crate::tlab::Tlab;
use core::sync::atomic::{AtomicU32, Ordering};

struct RegistryInner {
    /// Heap index for each thread id (low bits).
    tid_to_heap: [u32; MAX_THREADS],
    /// Live-thread reference count per heap.
    heap_in_use: [u32; NUM_HEAPS],
    /// xorshift state for the all-heaps-taken fallback.
    seed: u32,
}

/// Thread-to-heap assignment tables, guarded by the manager lock.
pub struct ThreadRegistry {
    inner: SpinMutex<RegistryInner>,
    next_tid: AtomicU32,
}

impl ThreadRegistry {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(RegistryInner {
                tid_to_heap: [0; MAX_THREADS],
                heap_in_use: [0; NUM_HEAPS],
                seed: 0x9E37_79B9,
            }),
            next_tid: AtomicU32::new(0),
        }
    }

    /// Assign the calling thread a heap: the first with no threads mapped,
    /// or a pseudo-random one when every heap is taken. Returns
    /// `(tid, heap_id)`; the tid indexes the mapping table on release.
    pub fn assign(&self, pool: &HeapPool) -> (u32, u32) {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed) & (MAX_THREADS as u32 - 1);
        let mut inner = self.inner.lock();

        let mut heap_id = NUM_HEAPS;
        for (i, &count) in inner.heap_in_use.iter().enumerate() {
            if count == 0 {
                heap_id = i;
                break;
            }
        }
        if heap_id == NUM_HEAPS {
            let mut s = inner.seed;
            s ^= s << 13;
            s ^= s >> 17;
            s ^= s << 5;
            inner.seed = s;
            heap_id = s as usize & (NUM_HEAPS - 1);
        }

        inner.heap_in_use[heap_id] += 1;
        inner.tid_to_heap[tid as usize] = heap_id as u32;
        pool.heap(heap_id as u32).set_active(true);
        (tid, heap_id as u32)
    }

    /// Drop the calling thread's heap reference (thread exit). The count
    /// hitting zero marks the heap inactive, which lets other threads
    /// reclaim its superblocks on free.
    pub fn release(&self, tid: u32, pool: &HeapPool) {
        let mut inner = self.inner.lock();
        let heap_id = inner.tid_to_heap[tid as usize & (MAX_THREADS - 1)];
        let count = &mut inner.heap_in_use[heap_id as usize];
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            pool.heap(heap_id).set_active(false);
        }
    }

    #[cfg(test)]
    fn in_use(&self, heap_id: u32) -> u32 {
        self.inner.lock().heap_in_use[heap_id as usize]
    }

    pub(crate) fn lock_raw(&self) {
        self.inner.lock_raw();
    }

    pub(crate) unsafe fn unlock_raw(&self) {
        unsafe { self.inner.unlock_raw() };
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Route one free.
///
/// `my_heap` is the calling thread's heap id (`OWNER_NONE` if the thread has
/// none yet); `tlab` is its buffer when one exists, used to cache local
/// frees of small classes.
///
/// # Safety
///
/// `ptr` is arbitrary input; it is only dereferenced after the masked header
/// validates. A pointer previously returned by this allocator must not have
/// been freed already.
pub unsafe fn free(
    ptr: *mut u8,
    my_heap: u32,
    tlab: Option<&mut Tlab>,
    pool: &HeapPool,
    global: &GlobalHeap,
    big: &BigHeap,
) {
    if ptr.is_null() {
        return;
    }
    let sb = Superblock::of(ptr);
    if sb.is_null() || !unsafe { (*sb).is_valid() } {
        stat_inc!(invalid_frees);
        return;
    }
    let object_size = unsafe { (*sb).object_size() };
    if object_size > SMALL_BIG_BOUNDARY {
        unsafe { big.free(sb) };
        return;
    }
    if !unsafe { (*sb).in_range(ptr) } {
        stat_inc!(invalid_frees);
        return;
    }
    let slot = unsafe { (*sb).normalize(ptr) };
    let class = size_class::class_of(object_size);

    if my_heap != OWNER_NONE && unsafe { (*sb).owner() } == my_heap {
        if size_class::class_is_cached(class) {
            if let Some(tlab) = tlab {
                unsafe { tlab.free_cached(class, slot, pool, global) };
                return;
            }
        }
        unsafe { pool.heap(my_heap).free_local(class, sb, slot, global) };
        return;
    }

    unsafe { free_remote(slot, sb, class, my_heap, pool, global) };
}

/// The cross-thread tail of the free path: reclaim from an abandoned owner
/// when possible, else park on the delayed queue.
unsafe fn free_remote(
    slot: *mut u8,
    sb: *mut Superblock,
    class: usize,
    my_heap: u32,
    pool: &HeapPool,
    global: &GlobalHeap,
) {
    if my_heap != OWNER_NONE {
        let owner = unsafe { (*sb).owner() };
        let abandoned: Option<&PerHeap> = if owner == OWNER_GLOBAL {
            Some(global.as_heap())
        } else if (owner as usize) < NUM_HEAPS && !pool.heap(owner).is_active() {
            Some(pool.heap(owner))
        } else {
            None
        };
        if let Some(old_heap) = abandoned {
            // Ownership is re-verified under the old heap's bin lock; a
            // miss means someone moved it first and the delayed push below
            // stays correct.
            if unsafe { old_heap.take_for_reclaim(sb, class, my_heap) } {
                stat_inc!(reclaims);
                let mine = pool.heap(my_heap);
                unsafe {
                    mine.put(sb, class);
                    mine.free_local(class, sb, slot, global);
                }
                return;
            }
        }
    }
    stat_inc!(delayed_pushes);
    unsafe { (*sb).push_delayed(slot) };
}

/// Usable bytes behind `ptr`, 0 for anything the allocator does not own.
///
/// # Safety
///
/// As with [`free`], `ptr` is only dereferenced after its masked header
/// validates.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let sb = Superblock::of(ptr);
    if sb.is_null() || !unsafe { (*sb).is_valid() } {
        return 0;
    }
    unsafe { (*sb).usable_size(ptr) }
}

/// Acquire every lock in the process, for the host's `fork`: the manager
/// lock, every bin lock of every heap, the global heap's bins, and the
/// big-object cache.
pub fn lock_all(registry: &ThreadRegistry, pool: &HeapPool, global: &GlobalHeap, big: &BigHeap) {
    registry.lock_raw();
    for heap in pool.heaps() {
        for class in 1..NUM_SIZE_CLASSES {
            heap.bin(class).lock_raw();
        }
    }
    for class in 1..NUM_SIZE_CLASSES {
        global.as_heap().bin(class).lock_raw();
    }
    big.lock_raw();
}

/// Release everything [`lock_all`] acquired, in reverse order.
///
/// # Safety
///
/// Must pair with a preceding `lock_all` on the same structures.
pub unsafe fn unlock_all(
    registry: &ThreadRegistry,
    pool: &HeapPool,
    global: &GlobalHeap,
    big: &BigHeap,
) {
    unsafe {
        big.unlock_raw();
        for class in (1..NUM_SIZE_CLASSES).rev() {
            global.as_heap().bin(class).unlock_raw();
        }
        for heap in pool.heaps().iter().rev() {
            for class in (1..NUM_SIZE_CLASSES).rev() {
                heap.bin(class).unlock_raw();
            }
        }
        registry.unlock_raw();
    }
}
