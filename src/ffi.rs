//! C-ABI exports for loading ahead of the platform allocator.
//!
//! Gated behind `features = ["ffi"]`. The exported names carry an `mh_`
//! prefix; an interposition shim (preload library or API hooking) maps the
//! host's `malloc` family onto them.

use crate::allocator::{
    self, allocate, allocate_aligned, allocate_zeroed, release, resize, usable_size,
};
use core::ffi::{c_char, c_int, c_void};

const ENOMEM: c_int = 12;
const EINVAL: c_int = 22;

#[unsafe(no_mangle)]
pub extern "C" fn mh_malloc(size: usize) -> *mut c_void {
    allocate(size) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_free(ptr: *mut c_void) {
    release(ptr as *mut u8)
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_calloc(count: usize, size: usize) -> *mut c_void {
    allocate_zeroed(count, size) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    resize(ptr as *mut u8, size) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_memalign(alignment: usize, size: usize) -> *mut c_void {
    allocate_aligned(alignment, size) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mh_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    // POSIX additionally requires the alignment to be a multiple of the
    // pointer size.
    if alignment == 0
        || !alignment.is_power_of_two()
        || alignment % core::mem::size_of::<*mut c_void>() != 0
    {
        return EINVAL;
    }
    let ptr = allocate_aligned(alignment, size);
    if ptr.is_null() {
        return ENOMEM;
    }
    unsafe { *memptr = ptr as *mut c_void };
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_malloc_usable_size(ptr: *mut c_void) -> usize {
    usable_size(ptr as *mut u8)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mh_strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return core::ptr::null_mut();
    }
    let mut len = 0usize;
    while unsafe { *s.add(len) } != 0 {
        len += 1;
    }
    let copy = allocate(len + 1) as *mut c_char;
    if copy.is_null() {
        return core::ptr::null_mut();
    }
    unsafe {
        core::ptr::copy_nonoverlapping(s, copy, len + 1);
    }
    copy
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_thread_start() {
    allocator::on_thread_start()
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_thread_exit() {
    allocator::on_thread_exit()
}

#[unsafe(no_mangle)]
pub extern "C" fn mh_lock_all() {
    allocator::lock_all()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mh_unlock_all() {
    unsafe { allocator::unlock_all() }
}
