//! The aligned page source: coarse, naturally-aligned chunks from the OS.
//!
//! Everything the allocator owns is carved out of ranges produced here.
//! Superblocks rely on the base-alignment guarantee: a superblock mapped with
//! `align == SUPERBLOCK_SIZE` can be recovered from any interior pointer by
//! masking off the low bits. Big-object blocks use the same guarantee with a
//! page-granular length.

use crate::config::PAGE_SIZE;
use crate::platform;
use crate::{stat_add, stat_inc};

/// Round `len` up to page granularity.
#[inline]
pub const fn round_to_pages(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Map `len` bytes (rounded up to page granularity) with the base aligned to
/// `align`. Returns null when the OS is out of memory; never panics.
pub fn map(len: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE);
    let len = round_to_pages(len);
    let ptr = unsafe { platform::map_aligned(len, align) };
    if !ptr.is_null() {
        stat_inc!(segment_maps);
        stat_add!(segment_map_bytes, len as u64);
    }
    ptr
}

/// Return a range obtained from [`map`] to the OS.
///
/// # Safety
///
/// `ptr` must come from `map` with the same (page-rounded) `len`, and no live
/// object may remain inside the range.
pub unsafe fn unmap(ptr: *mut u8, len: usize) {
    stat_inc!(segment_unmaps);
    unsafe { platform::unmap(ptr, round_to_pages(len)) };
}
