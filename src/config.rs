//! Build-time configuration constants.
//!
//! The values are generated by `build.rs` from `mhmalloc.toml` (or the file
//! named by `MHMALLOC_CONFIG`). Everything here is fixed at compile time; the
//! allocator has no runtime tunables.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Every pointer returned by the allocator is aligned to this many bytes
/// (the `max_align_t` of the platforms we target).
pub const ALLOC_ALIGNMENT: usize = 16;

/// Mask that maps any address inside a superblock to the superblock's base.
pub const SUPERBLOCK_MASK: usize = !(SUPERBLOCK_SIZE - 1);

/// Largest alignment honored by `allocate_aligned`. Returned pointers must
/// stay strictly inside the first superblock-sized stretch of their block, or
/// the mask-based free lookup would land past the header.
pub const MAX_ALIGNMENT: usize = SUPERBLOCK_SIZE / 4;

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE == 1 << SUPERBLOCK_SHIFT);
const _: () = assert!(NUM_HEAPS.is_power_of_two());
const _: () = assert!(MAX_THREADS.is_power_of_two());
const _: () = assert!(EMPTINESS_BUCKETS >= 2);
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE % PAGE_SIZE == 0);
const _: () = assert!(ALLOC_ALIGNMENT.is_power_of_two());
