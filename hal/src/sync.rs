//! Busy-wait synchronization primitives.
//!
//! These locks never allocate and never block in the kernel, so they can be
//! taken inside the dirty-memory fault handler and before any recording
//! machinery exists. They are deliberately separate from the recorded `Lock`
//! of the execution subsystem: nothing here ever records or replays.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Number of spins before a waiter yields its time slice.
const SPINS_BEFORE_YIELD: u32 = 1000;

#[inline]
fn backoff(spins: &mut u32) {
    *spins = spins.saturating_add(1);
    if *spins > SPINS_BEFORE_YIELD {
        *spins = 0;
        std::thread::yield_now();
    } else {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Spin Lock
// ============================================================================

/// Mutual exclusion by spinning, for short critical sections.
///
/// Contended waiters spin briefly and then yield, since the holder may be a
/// preempted thread rather than another CPU.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// Holds a [`SpinLock`] until dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    /// Unlocked lock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Spin until the lock is ours.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinLockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff(&mut spins);
            }
        }
    }

    /// Take the lock if it is free.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if !self.locked.swap(true, Ordering::Acquire) {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether the lock is held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// The protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Mutable access without locking; the borrow proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpinLockGuard")
    }
}

// SAFETY: the data is only reached through a guard, one at a time
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

// ============================================================================
// Read-Write Spin Lock
// ============================================================================

/// Shared readers or one writer, by spinning. New readers hold off while
/// a writer is waiting.
pub struct RwSpinLock<T> {
    /// 0: unlocked, `WRITER`: writer holds lock, otherwise the reader count
    state: AtomicU32,
    /// Writers spinning in `write`
    waiting_writers: AtomicU32,
    data: UnsafeCell<T>,
}

/// Shared access to a [`RwSpinLock`] until dropped.
pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

/// Exclusive access to a [`RwSpinLock`] until dropped.
pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> RwSpinLock<T> {
    const WRITER: u32 = u32::MAX;

    /// Unlocked lock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            waiting_writers: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Spin until no writer holds or waits for the lock, then share it.
    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            while self.waiting_writers.load(Ordering::Relaxed) > 0 || self.state.load(Ordering::Relaxed) == Self::WRITER
            {
                backoff(&mut spins);
            }

            let current = self.state.load(Ordering::Acquire);
            if current != Self::WRITER
                && self
                    .state
                    .compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwSpinReadGuard { lock: self };
            }
            backoff(&mut spins);
        }
    }

    /// Spin until the lock is exclusively ours.
    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        self.waiting_writers.fetch_add(1, Ordering::Relaxed);

        let mut spins = 0u32;
        loop {
            if self
                .state
                .compare_exchange_weak(0, Self::WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.waiting_writers.fetch_sub(1, Ordering::Relaxed);
                return RwSpinWriteGuard { lock: self };
            }
            backoff(&mut spins);
        }
    }

    /// Take the lock exclusively if nobody holds it.
    #[inline]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        if self
            .state
            .compare_exchange(0, Self::WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwSpinWriteGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwSpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: readers share the data, no writer holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard owns the lock exclusively
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

impl<T> fmt::Debug for RwSpinReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RwSpinReadGuard")
    }
}

impl<T> fmt::Debug for RwSpinWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RwSpinWriteGuard")
    }
}

// SAFETY: writers are exclusive; readers only get `&T`, hence `T: Sync`
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_excludes_concurrent_writers() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn rw_lock_allows_shared_readers() {
        let lock = RwSpinLock::new(5);
        let first = lock.read();
        let second = lock.read();
        assert_eq!(*first + *second, 10);
        assert!(lock.try_write().is_none());
        drop(first);
        drop(second);
        *lock.write() = 7;
        assert_eq!(*lock.read(), 7);
    }
}
