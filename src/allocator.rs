//! Top-level allocator: ties all tiers together and implements GlobalAlloc.
//!
//! Static state lives here. The `MhMalloc` struct is zero-sized; all mutable
//! state is in module-level statics protected by spinlocks or atomics, built
//! eagerly at const-init time so no allocation path ever runs a lazy
//! constructor.
//!
//! TLAB strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read)
//! - `std` feature: `std::thread_local!` with const-init
//! - neither: per-CPU heap 0 only (locked, slowest)

use crate::big::BigHeap;
use crate::config::{ALLOC_ALIGNMENT, MAX_ALIGNMENT};
use crate::global_heap::GlobalHeap;
use crate::heap::HeapPool;
use crate::routing::{self, ThreadRegistry};
use crate::size_class;
#[cfg(any(feature = "nightly", feature = "std"))]
use crate::superblock::OWNER_NONE;
#[cfg(any(feature = "nightly", feature = "std"))]
use crate::tlab::Tlab;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub(crate) static HEAP_POOL: HeapPool = HeapPool::new();
pub(crate) static GLOBAL_HEAP: GlobalHeap = GlobalHeap::new();
pub(crate) static BIG_HEAP: BigHeap = BigHeap::new();
pub(crate) static REGISTRY: ThreadRegistry = ThreadRegistry::new();

/// Requests past this are refused outright.
const MAX_REQUEST: usize = isize::MAX as usize;

#[cfg(any(feature = "nightly", feature = "std"))]
#[derive(Clone, Copy, PartialEq)]
#[repr(u8)]
enum TlsState {
    Uninitialized = 0,
    Active = 1,
    Destroyed = 2,
}

#[cfg(any(feature = "nightly", feature = "std"))]
struct TlsSlot {
    state: TlsState,
    tid: u32,
    tlab: Tlab,
}

#[cfg(any(feature = "nightly", feature = "std"))]
impl TlsSlot {
    const fn new() -> Self {
        Self {
            state: TlsState::Uninitialized,
            tid: 0,
            tlab: Tlab::new(),
        }
    }

    /// First-allocation setup: pick a heap and bind the TLAB to it.
    #[cold]
    fn activate(&mut self) {
        let (tid, heap_id) = REGISTRY.assign(&HEAP_POOL);
        self.tid = tid;
        self.tlab.bind(heap_id);
        self.state = TlsState::Active;
    }

    /// Thread-exit teardown: flush the TLAB, drain the heap, release the
    /// heap assignment.
    #[cold]
    fn deactivate(&mut self) {
        if self.state != TlsState::Active {
            return;
        }
        self.state = TlsState::Destroyed;
        unsafe { self.tlab.clear(&HEAP_POOL, &GLOBAL_HEAP) };
        REGISTRY.release(self.tid, &HEAP_POOL);
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static mut TLS: TlsSlot = TlsSlot::new();

        /// Get a raw mutable pointer to the thread-local slot.
        #[inline(always)]
        unsafe fn tls() -> *mut TlsSlot {
            unsafe { core::ptr::addr_of_mut!(TLS) }
        }

        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> *mut u8 {
            let slot = unsafe { &mut *tls() };
            if slot.state == TlsState::Active {
                return unsafe { slot.tlab.alloc(class, &HEAP_POOL, &GLOBAL_HEAP) };
            }
            unsafe { alloc_small_slow(class) }
        }

        #[cold]
        #[inline(never)]
        unsafe fn alloc_small_slow(class: usize) -> *mut u8 {
            let slot = unsafe { &mut *tls() };
            if slot.state == TlsState::Uninitialized {
                slot.activate();
                // Set BEFORE cleanup registration — if register() triggers
                // allocation, the reentrant call sees an Active slot.
                tls_cleanup::register();
                return unsafe { slot.tlab.alloc(class, &HEAP_POOL, &GLOBAL_HEAP) };
            }
            // Destroyed: the thread is going away, serve without caching
            unsafe { HEAP_POOL.heap(0).alloc(class, &GLOBAL_HEAP) }
        }

        #[inline(always)]
        unsafe fn dealloc_ptr(ptr: *mut u8) {
            let slot = unsafe { &mut *tls() };
            if slot.state == TlsState::Active {
                let heap_id = slot.tlab.heap_id();
                unsafe {
                    routing::free(ptr, heap_id, Some(&mut slot.tlab),
                                  &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP);
                }
                return;
            }
            unsafe { routing::free(ptr, OWNER_NONE, None, &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP) };
        }

        pub(crate) fn thread_start() {
            let slot = unsafe { &mut *tls() };
            if slot.state == TlsState::Uninitialized {
                slot.activate();
                tls_cleanup::register();
            }
        }

        pub(crate) fn thread_exit() {
            let slot = unsafe { &mut *tls() };
            slot.deactivate();
        }

        // -- Cleanup: nightly + std --
        #[cfg(feature = "std")]
        mod tls_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    super::thread_exit();
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // Use try_with: if std's TLS is already destroyed (rare edge
                // case during thread shutdown), silently skip — the TLAB
                // leaks its cache until another thread reclaims.
                let _ = GUARD.try_with(|_| {});
            }
        }

        // -- Cleanup: nightly, no std --
        #[cfg(not(feature = "std"))]
        mod tls_cleanup {
            pub(super) fn register() {}
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static TLS_CELL: core::cell::UnsafeCell<TlsSlot> = const {
                core::cell::UnsafeCell::new(TlsSlot::new())
            };
        }

        // The cell's contents are dropped by the std TLS machinery at
        // thread exit; that is the flush-and-release hook.
        impl Drop for TlsSlot {
            fn drop(&mut self) {
                self.deactivate();
            }
        }

        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> *mut u8 {
            match TLS_CELL.try_with(|cell| {
                let slot = unsafe { &mut *cell.get() };
                match slot.state {
                    TlsState::Active => unsafe {
                        slot.tlab.alloc(class, &HEAP_POOL, &GLOBAL_HEAP)
                    },
                    TlsState::Uninitialized => {
                        slot.activate();
                        unsafe { slot.tlab.alloc(class, &HEAP_POOL, &GLOBAL_HEAP) }
                    }
                    TlsState::Destroyed => unsafe {
                        HEAP_POOL.heap(0).alloc(class, &GLOBAL_HEAP)
                    },
                }
            }) {
                Ok(ptr) => ptr,
                Err(_) => unsafe { HEAP_POOL.heap(0).alloc(class, &GLOBAL_HEAP) },
            }
        }

        #[inline(always)]
        unsafe fn dealloc_ptr(ptr: *mut u8) {
            if TLS_CELL
                .try_with(|cell| {
                    let slot = unsafe { &mut *cell.get() };
                    if slot.state == TlsState::Active {
                        let heap_id = slot.tlab.heap_id();
                        unsafe {
                            routing::free(ptr, heap_id, Some(&mut slot.tlab),
                                          &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP);
                        }
                    } else {
                        unsafe {
                            routing::free(ptr, OWNER_NONE, None,
                                          &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP);
                        }
                    }
                })
                .is_err()
            {
                unsafe { routing::free(ptr, OWNER_NONE, None, &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP) };
            }
        }

        pub(crate) fn thread_start() {
            let _ = TLS_CELL.try_with(|cell| {
                let slot = unsafe { &mut *cell.get() };
                if slot.state == TlsState::Uninitialized {
                    slot.activate();
                }
            });
        }

        pub(crate) fn thread_exit() {
            let _ = TLS_CELL.try_with(|cell| {
                let slot = unsafe { &mut *cell.get() };
                slot.deactivate();
            });
        }
    } else {
        // No TLS at all: every thread shares heap 0 under its bin locks.
        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> *mut u8 {
            unsafe { HEAP_POOL.heap(0).alloc(class, &GLOBAL_HEAP) }
        }

        #[inline(always)]
        unsafe fn dealloc_ptr(ptr: *mut u8) {
            unsafe { routing::free(ptr, 0, None, &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP) };
        }

        pub(crate) fn thread_start() {}

        pub(crate) fn thread_exit() {}
    }
}

/// Allocate `size` bytes aligned to [`ALLOC_ALIGNMENT`]. Zero-sized requests
/// get the minimum class, so the returned pointer is unique and releasable.
/// Null on out-of-memory.
pub fn allocate(size: usize) -> *mut u8 {
    if size > MAX_REQUEST {
        return ptr::null_mut();
    }
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    let class = size_class::class_of(size);
    if class != 0 {
        unsafe { alloc_small(class) }
    } else {
        BIG_HEAP.alloc(size)
    }
}

/// Release a pointer previously returned by any allocation entry point.
/// Null is a no-op; pointers the allocator does not own are dropped.
pub fn release(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    stat_inc!(dealloc_count);
    unsafe { dealloc_ptr(ptr) };
}

/// Allocate `count * size` zero-filled bytes. Null on overflow or OOM.
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    let ptr = allocate(total);
    if !ptr.is_null() && total > 0 {
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Resize an allocation. A pointer the allocator does not own is treated as
/// a fresh request; shrinks and same-size requests stay in place.
pub fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(new_size);
    }
    if new_size == 0 {
        release(ptr);
        return ptr::null_mut();
    }
    stat_inc!(realloc_count);

    let old_usable = unsafe { routing::usable_size(ptr) };
    if old_usable == 0 {
        return allocate(new_size);
    }
    if new_size <= old_usable {
        return ptr;
    }

    let new_ptr = allocate(new_size);
    if !new_ptr.is_null() {
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
        release(ptr);
    }
    new_ptr
}

/// Allocate `size` bytes whose address is a multiple of `align`.
///
/// `align` must be a power of two; alignments up to [`ALLOC_ALIGNMENT`] are
/// free, larger ones are carved out of an oversized allocation and the
/// interior pointer is returned (frees normalize back to the slot). Null
/// for unsupported alignments and OOM.
pub fn allocate_aligned(align: usize, size: usize) -> *mut u8 {
    if align == 0 || !align.is_power_of_two() || align > MAX_ALIGNMENT {
        return ptr::null_mut();
    }
    if align <= ALLOC_ALIGNMENT {
        return allocate(size);
    }
    let Some(padded) = size.checked_add(align) else {
        return ptr::null_mut();
    };
    let ptr = allocate(padded);
    if ptr.is_null() {
        return ptr::null_mut();
    }
    let aligned = (ptr as usize + align - 1) & !(align - 1);
    aligned as *mut u8
}

/// Usable bytes behind `ptr`; at least the requested size, 0 for null or
/// foreign pointers.
pub fn usable_size(ptr: *mut u8) -> usize {
    unsafe { routing::usable_size(ptr) }
}

/// Ensure the calling thread has a heap assignment. Invoked automatically
/// on first allocation; exposed for hosts that intercept thread creation.
pub fn on_thread_start() {
    thread_start();
}

/// Flush the calling thread's TLAB, drain its heap, and release the heap
/// assignment. Invoked automatically at thread exit where TLS destructors
/// run; exposed for hosts that intercept thread teardown.
pub fn on_thread_exit() {
    thread_exit();
}

/// Acquire every allocator lock (for the host's `fork`).
pub fn lock_all() {
    routing::lock_all(&REGISTRY, &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP);
}

/// Release every allocator lock after [`lock_all`].
///
/// # Safety
///
/// Must pair with a preceding `lock_all` on this process's allocator.
pub unsafe fn unlock_all() {
    unsafe { routing::unlock_all(&REGISTRY, &HEAP_POOL, &GLOBAL_HEAP, &BIG_HEAP) };
}

/// Scalable multi-heap allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: mhmalloc::MhMalloc = mhmalloc::MhMalloc;
/// ```
pub struct MhMalloc;

unsafe impl GlobalAlloc for MhMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() <= ALLOC_ALIGNMENT {
            allocate(size)
        } else {
            allocate_aligned(layout.align(), size)
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        release(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        // The header knows the real usable size; the caller's layout may be
        // stale after an in-place shrink returned the same pointer.
        let old_usable = unsafe { routing::usable_size(ptr) };
        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for MhMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
