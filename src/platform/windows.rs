//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

// Windows allocation granularity is 64 KiB.
const ALLOC_GRANULARITY: usize = 65536;

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;
}

/// Round up to the next multiple of `align` (must be a power of 2).
#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    let alloc_size = round_up(size, ALLOC_GRANULARITY);

    // Allocations are always 64 KiB aligned; for that and anything weaker a
    // plain VirtualAlloc suffices.
    if align <= ALLOC_GRANULARITY {
        let ptr = unsafe {
            virtual_alloc(
                core::ptr::null_mut(),
                alloc_size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        return ptr as *mut u8;
    }

    // VirtualFree cannot trim a reservation, so over-allocate to discover an
    // aligned address, release the whole range, and re-reserve exactly at
    // that address. Another thread can steal the address between the two
    // calls; retry a few times before giving up.
    for _ in 0..8 {
        let probe = unsafe {
            virtual_alloc(
                core::ptr::null_mut(),
                alloc_size + align,
                MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if probe.is_null() {
            return core::ptr::null_mut();
        }
        let aligned = round_up(probe as usize, align);
        unsafe { virtual_free(probe, 0, MEM_RELEASE) };

        let ptr = unsafe {
            virtual_alloc(
                aligned as *mut c_void,
                alloc_size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if !ptr.is_null() {
            return ptr as *mut u8;
        }
    }
    core::ptr::null_mut()
}

pub unsafe fn unmap(ptr: *mut u8) {
    // MEM_RELEASE requires dwSize = 0 (releases entire allocation)
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}
