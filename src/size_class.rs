//! Size class table and lookup functions.
//!
//! Requests are bucketed into a finite set of representative sizes so that
//! every superblock holds slots of exactly one size. The table is generated
//! by `build.rs` from `mhmalloc.toml`; every size is a multiple of the
//! allocation alignment, so slot carving preserves alignment for free.

use crate::config::{ALLOC_ALIGNMENT, LARGEST_SMALL};

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of slots a TLAB pulls from its heap in one refill.
    pub batch: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Number of entries in the class table (index 0 is an unused sentinel).
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASS_TABLE.len();

/// The size class table, indexed by class.
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = SIZE_CLASS_TABLE;

/// Largest size served from superblocks. Anything bigger takes the
/// big-object path.
pub const SMALL_BIG_BOUNDARY: usize = SIZE_CLASS_TABLE[NUM_SIZE_CLASSES - 1].size;

const _: () = assert!(SIZE_CLASS_TABLE[1].size >= ALLOC_ALIGNMENT);
const _: () = assert!(LARGEST_SMALL <= SMALL_BIG_BOUNDARY);

/// Lookup table for small sizes (<= 1024 bytes).
/// Index = (size + 7) / 8, value = size class index.
const SMALL_LOOKUP_LEN: usize = 129; // ceil(1024/8) + 1

static SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = const {
    let mut table = [0u8; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        let size = if i == 0 { 0 } else { i * 8 };
        // Find the smallest size class that fits this size
        let mut cls = 1u8;
        while (cls as usize) < NUM_SIZE_CLASSES {
            if SIZE_CLASS_TABLE[cls as usize].size >= size {
                break;
            }
            cls += 1;
        }
        if (cls as usize) >= NUM_SIZE_CLASSES {
            cls = (NUM_SIZE_CLASSES - 1) as u8;
        }
        table[i] = cls;
        i += 1;
    }
    table
};

/// Map an allocation size to its size class index.
/// Returns the minimum class for size 0 (zero-sized requests still get a
/// unique, releasable slot). Returns 0 for sizes above [`SMALL_BIG_BOUNDARY`]
/// (indicating the big-object path).
#[inline]
pub fn class_of(size: usize) -> usize {
    if size > SMALL_BIG_BOUNDARY {
        return 0;
    }
    if size <= 1024 {
        let idx = size.div_ceil(8);
        return SMALL_LOOKUP[idx] as usize;
    }
    // Only a handful of classes sit above 1024; a linear scan is fast enough.
    let mut cls = SMALL_LOOKUP[SMALL_LOOKUP_LEN - 1] as usize;
    while cls < NUM_SIZE_CLASSES {
        if SIZE_CLASSES[cls].size >= size {
            return cls;
        }
        cls += 1;
    }
    0
}

/// Get the allocation size for a given size class.
#[inline]
pub fn size_of_class(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

/// Whether a class is small enough for TLABs to cache.
#[inline]
pub fn class_is_cached(cls: usize) -> bool {
    SIZE_CLASSES[cls].size <= LARGEST_SMALL
}
