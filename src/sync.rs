//! Spin-based locking for the allocator's internals.
//!
//! `std::sync::Mutex` is off the table here: it can allocate, and the
//! allocator must never re-enter itself. Bin and superblock critical
//! sections are a handful of pointer writes, short enough that spinning is
//! the right trade.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A raw test-and-set spinlock with exponential backoff under contention.
pub struct SpinLock {
    held: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// One acquisition attempt. Acquire on success so the critical section
    /// cannot float above the lock.
    #[inline]
    fn grab(&self) -> bool {
        self.held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn lock(&self) {
        if !self.grab() {
            self.contend();
        }
    }

    /// Contended path: watch the flag with plain loads between attempts and
    /// widen the pause each round, capped so a long hold does not park us
    /// for ages past the release.
    #[cold]
    fn contend(&self) {
        let mut round = 0u32;
        loop {
            if !self.held.load(Ordering::Relaxed) && self.grab() {
                return;
            }
            for _ in 0..1 << round {
                core::hint::spin_loop();
            }
            if round < 6 {
                round += 1;
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// Data guarded by a [`SpinLock`]. Const-constructible, so it can sit in a
/// static; access goes through the RAII [`SpinGuard`].
pub struct SpinMutex<T> {
    raw: SpinLock,
    value: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.raw.lock();
        SpinGuard { owner: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.raw.try_lock().then(|| SpinGuard { owner: self })
    }

    /// Acquire without a guard. Used by the fork support path, which must
    /// hold every lock in the process across a guardless region. Pair with
    /// [`SpinMutex::unlock_raw`].
    #[inline]
    pub fn lock_raw(&self) {
        self.raw.lock();
    }

    /// Release a lock taken with [`SpinMutex::lock_raw`].
    ///
    /// # Safety
    ///
    /// The caller must have acquired the lock with `lock_raw` and must not
    /// hold any guard for it.
    #[inline]
    pub unsafe fn unlock_raw(&self) {
        self.raw.unlock();
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// Exclusive view of a [`SpinMutex`]'s value; releases on drop.
pub struct SpinGuard<'a, T> {
    owner: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.owner.raw.unlock();
    }
}
