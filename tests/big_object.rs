//! Big-object path: retention cache reuse, release over the budget, and
//! interleaving with small allocations.

use mhmalloc::{allocate, release, resize, usable_size, MhMalloc};

#[global_allocator]
static GLOBAL: MhMalloc = MhMalloc;

#[test]
fn test_big_boundary_sizes() {
    // Just past the largest small class switches to the big path; both
    // sides of the boundary must work.
    for size in [8192, 8193, 10_000, 65536, 100_000] {
        let p = allocate(size);
        assert!(!p.is_null(), "allocate({size}) failed");
        assert!(usable_size(p) >= size);
        assert_eq!(p as usize % 16, 0);
        unsafe {
            p.write_bytes(0xCC, size);
            assert_eq!(*p, 0xCC);
            assert_eq!(*p.add(size - 1), 0xCC);
        }
        release(p);
    }
}

#[test]
fn test_big_excess_released_to_os() {
    // Freeing far more big bytes than live keeps only the retention budget
    // around; everything else is unmapped.
    let size = 2 * 1024 * 1024;
    let mut ptrs = Vec::new();
    for _ in 0..8 {
        let p = allocate(size);
        assert!(!p.is_null());
        ptrs.push(p);
    }
    for p in ptrs {
        release(p);
    }

    #[cfg(feature = "stats")]
    {
        let snap = mhmalloc::stats::snapshot();
        assert!(
            snap.big_releases >= 6,
            "idle big blocks past the budget must be released"
        );
    }

    // Fresh allocations still work
    let p = allocate(size);
    assert!(!p.is_null());
    release(p);
}

#[test]
fn test_big_contents_survive_resize() {
    let size = 300 * 1024;
    let p = allocate(size);
    assert!(!p.is_null());
    for i in (0..size).step_by(4096) {
        unsafe { *p.add(i) = (i >> 12) as u8 };
    }

    let bigger = resize(p, size * 3);
    assert!(!bigger.is_null());
    for i in (0..size).step_by(4096) {
        assert_eq!(unsafe { *bigger.add(i) }, (i >> 12) as u8);
    }

    // Shrinking keeps the prefix intact
    for i in (0..4096).step_by(512) {
        unsafe { *bigger.add(i) = 0x77 };
    }
    let small = resize(bigger, 4096);
    assert!(!small.is_null());
    for i in (0..4096).step_by(512) {
        assert_eq!(unsafe { *small.add(i) }, 0x77);
    }
    release(small);
}

#[test]
fn test_big_cross_thread_free() {
    let size = 128 * 1024;
    let addr = std::thread::spawn(move || {
        let p = allocate(size);
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x3C, size) };
        p as usize
    })
    .join()
    .unwrap();

    let p = addr as *mut u8;
    for i in (0..size).step_by(1024) {
        assert_eq!(unsafe { *p.add(i) }, 0x3C);
    }
    release(p);
}

#[test]
fn test_many_big_sizes_interleaved_with_small() {
    let mut live = Vec::new();
    for i in 0..60 {
        let big = 9_000 + i * 3_000;
        let small = 16 + (i % 32) * 16;
        let bp = allocate(big);
        let sp = allocate(small);
        assert!(!bp.is_null() && !sp.is_null());
        unsafe {
            bp.write_bytes(0xB0 | (i & 0xF) as u8, big);
            sp.write_bytes(0x50 | (i & 0xF) as u8, small);
        }
        live.push((bp, big, 0xB0 | (i & 0xF) as u8));
        live.push((sp, small, 0x50 | (i & 0xF) as u8));
    }
    for (p, len, fill) in live {
        for off in [0, len / 2, len - 1] {
            assert_eq!(unsafe { *p.add(off) }, fill);
        }
        release(p);
    }
}
