//! Unix virtual memory implementation using mmap/munmap.

use core::ffi::c_void;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;
}

pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    // mmap only guarantees system-page alignment. For stronger alignment we
    // over-allocate by `align` and trim the leading and trailing waste back
    // to the OS, leaving an exactly-aligned range of `size` bytes.
    let raw = unsafe {
        mmap(
            core::ptr::null_mut(),
            size + align,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return core::ptr::null_mut();
    }

    let raw_addr = raw as usize;
    let aligned_addr = (raw_addr + align - 1) & !(align - 1);

    let lead = aligned_addr - raw_addr;
    if lead > 0 {
        unsafe { munmap(raw_addr as *mut c_void, lead) };
    }

    let trail = (raw_addr + size + align) - (aligned_addr + size);
    if trail > 0 {
        unsafe { munmap((aligned_addr + size) as *mut c_void, trail) };
    }

    aligned_addr as *mut u8
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}
