//! Spin-based mutual exclusion.
//!
//! A [`SpinLock`] busy-waits instead of sleeping, so it is safe to take from
//! any context, including inside the scheduler itself. Critical sections under
//! a spin lock must stay short and must never block.

use core::ops::{Deref, DerefMut};
use thiserror::Error;

/// The operation would have to block to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation would block")]
pub struct WouldBlock;

/// A spin-based mutual exclusion primitive protecting a `T`.
///
/// The data is only reachable through the guard returned by [`lock`] and
/// [`try_lock`], so it is only ever touched with the lock held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new unlocked spin lock.
    pub const fn new(t: T) -> Self {
        Self {
            inner: spin::Mutex::new(t),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard(self.inner.lock())
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is currently held.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        self.inner.try_lock().map(SpinLockGuard).ok_or(WouldBlock)
    }

    /// Consumes the lock, returning the protected data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A scoped guard for a [`SpinLock`].
///
/// The lock can be released early with [`unlock`]; otherwise it is released
/// when the guard goes out of scope.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T>(spin::MutexGuard<'a, T>);

impl<T> SpinLockGuard<'_, T> {
    /// Releases the lock.
    pub fn unlock(self) {
        drop(self)
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_unlock() {
        let lock = SpinLock::new(41);
        let mut guard = lock.lock();
        *guard += 1;
        guard.unlock();
        assert_eq!(lock.into_inner(), 42);
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert_eq!(lock.try_lock().err(), Some(WouldBlock));
        held.unlock();
        assert!(lock.try_lock().is_ok());
    }
}
