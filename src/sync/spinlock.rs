//! Interrupt-masking spinlock.
//!
//! On this single-CPU kernel the only source of concurrency is the timer
//! interrupt, so holding the lock also keeps interrupts disabled. The previous
//! IF state is restored when the guard drops, which makes nested use from
//! trap context (where IF is already clear) safe.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::interrupts;

/// Clears IF on creation and puts the previous state back on drop.
struct InterruptsMasked {
    were_enabled: bool,
}

impl InterruptsMasked {
    fn new() -> Self {
        let were_enabled = interrupts::are_enabled();
        interrupts::disable();
        Self { were_enabled }
    }
}

impl Drop for InterruptsMasked {
    fn drop(&mut self) {
        if self.were_enabled {
            interrupts::enable();
        }
    }
}

pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let masked = InterruptsMasked::new();
        while !self.try_acquire() {
            core::hint::spin_loop();
        }
        SpinLockGuard {
            lock: self,
            _masked: masked,
        }
    }

    /// Single acquisition attempt. IF is left as it was on failure.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let masked = InterruptsMasked::new();
        self.try_acquire().then(|| SpinLockGuard {
            lock: self,
            _masked: masked,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    // Dropped after `SpinLockGuard::drop` released the lock.
    _masked: InterruptsMasked,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // - The spinlock guarantees exclusive access while the guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // - The spinlock guarantees exclusive access while the guard lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// SAFETY:
// - Access to `data` is serialized by the lock with interrupts masked.
// - `T: Send` lets the value move between task and trap context.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}
