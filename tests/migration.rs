//! Superblock migration between heaps through the global heap: a heap whose
//! class empties out donates a superblock, and another thread's heap picks
//! it up instead of mapping fresh memory.

use mhmalloc::{allocate, release, MhMalloc};
use std::sync::mpsc;

#[global_allocator]
static GLOBAL: MhMalloc = MhMalloc;

#[test]
fn test_emptiness_migration_feeds_other_threads() {
    let size = 192;
    // Enough objects for several superblocks of this class
    let count = 3 * (65536 / size);

    let (donated_tx, donated_rx) = mpsc::channel::<usize>();
    let (finish_tx, finish_rx) = mpsc::channel::<()>();

    // Thread A: allocate a pile, then free all but one object. Crossing the
    // emptiness threshold donates superblocks to the global heap. A stays
    // alive (holding its heap) until B is done, so B is assigned a heap of
    // its own.
    let a = std::thread::spawn(move || {
        let mut ptrs = Vec::with_capacity(count);
        for _ in 0..count {
            let p = allocate(size);
            assert!(!p.is_null());
            unsafe { p.write_bytes(0x11, size) };
            ptrs.push(p);
        }
        let survivor = ptrs.pop().unwrap();
        for p in ptrs {
            release(p);
        }
        donated_tx.send(survivor as usize).unwrap();

        finish_rx.recv().unwrap();
        // The survivor is still intact and freeable by its owner
        for i in 0..size {
            assert_eq!(unsafe { *survivor.add(i) }, 0x11);
        }
        release(survivor);
    });

    let _survivor_addr = donated_rx.recv().unwrap();

    #[cfg(feature = "stats")]
    {
        let snap = mhmalloc::stats::snapshot();
        assert!(
            snap.global_migrations >= 1,
            "freeing nearly everything must donate a superblock"
        );
    }

    // Thread B: allocate the same class on a fresh heap; the first refill
    // pulls a donated superblock back from the global heap.
    std::thread::spawn(move || {
        let mut ptrs = Vec::new();
        for _ in 0..200 {
            let p = allocate(size);
            assert!(!p.is_null());
            unsafe { p.write_bytes(0x22, size) };
            ptrs.push(p);
        }
        for p in ptrs {
            release(p);
        }
    })
    .join()
    .unwrap();

    #[cfg(feature = "stats")]
    {
        let snap = mhmalloc::stats::snapshot();
        assert!(
            snap.global_pulls >= 1,
            "the donated superblock must be served back out"
        );
    }

    finish_tx.send(()).unwrap();
    a.join().unwrap();
}
