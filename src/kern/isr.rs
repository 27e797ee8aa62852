//! Interrupt-disable critical sections and ISR locks
//!
//! [`IsrGuard`] disables local interrupts for its lifetime and restores
//! the saved level on every exit path. [`IsrLock`] adds a spin lock on top
//! for data shared between processors: acquire disables local interrupts
//! and then spins on the lock word; release unlocks first and restores the
//! interrupt level last.

use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::kern::port::{CpuPort, IsrLevel};

/// Scoped local interrupt disable
pub struct IsrGuard {
    port: Arc<dyn CpuPort>,
    level: IsrLevel,
}

impl IsrGuard {
    /// Disable local interrupts until the guard is dropped
    pub fn new(port: Arc<dyn CpuPort>) -> Self {
        let level = port.interrupt_disable();
        Self { port, level }
    }

    /// Interrupt level saved on entry
    pub fn level(&self) -> IsrLevel {
        self.level
    }
}

impl Drop for IsrGuard {
    fn drop(&mut self) {
        self.port.interrupt_restore(self.level);
    }
}

/// Spin lock that also masks local interrupts while held
pub struct IsrLock<T> {
    inner: Mutex<T>,
}

impl<T> IsrLock<T> {
    /// Create an unlocked lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Disable interrupts, then spin until the lock is acquired
    pub fn lock(&self, port: Arc<dyn CpuPort>) -> IsrLockGuard<'_, T> {
        let isr = IsrGuard::new(port);
        IsrLockGuard {
            guard: self.inner.lock(),
            _isr: isr,
        }
    }

    /// Single acquisition attempt; interrupts are restored on failure
    pub fn try_lock(&self, port: Arc<dyn CpuPort>) -> Option<IsrLockGuard<'_, T>> {
        let isr = IsrGuard::new(port);
        let guard = self.inner.try_lock()?;
        Some(IsrLockGuard { guard, _isr: isr })
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Held ISR lock
///
/// Fields drop in declaration order: the spin lock is released before
/// interrupts are re-enabled.
pub struct IsrLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _isr: IsrGuard,
}

impl<T> Deref for IsrLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IsrLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
