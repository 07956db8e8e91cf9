//! # Spin Lock
//!
//! A [`spin::Mutex`] that keeps preemption disabled while held, so the owner
//! is never switched out with the lock taken. This is the lock that
//! [`wait_until`](crate::wait::wait_until) releases while its caller blocks.

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::preempt::PreemptGuard;

/// Preemption-disabling spin lock
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard of a held [`SpinLock`]
///
/// Fields drop in declaration order: the lock is released before preemption
/// is re-enabled.
pub struct SpinLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _preempt: PreemptGuard,
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    /// Create an unlocked spin lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock, disabling preemption first
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let preempt = PreemptGuard::new();
        SpinLockGuard {
            guard: self.inner.lock(),
            _preempt: preempt,
            lock: self,
        }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let preempt = PreemptGuard::new();
        let guard = self.inner.try_lock()?;
        Some(SpinLockGuard {
            guard,
            _preempt: preempt,
            lock: self,
        })
    }

    /// Whether the lock is held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the lock, returning the value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(value) => f.debug_struct("SpinLock").field("data", &*value).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard holds
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preempt::preempt_count;

    #[test]
    fn test_lock_disables_preemption() {
        let lock = SpinLock::new(1u32);
        assert_eq!(preempt_count(), 0);
        {
            let mut g = lock.lock();
            *g += 1;
            assert_eq!(preempt_count(), 1);
            assert!(lock.is_locked());
        }
        assert_eq!(preempt_count(), 0);
        assert!(!lock.is_locked());
        assert_eq!(lock.into_inner(), 2);
    }

    #[test]
    fn test_try_lock_restores_preemption_on_failure() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        assert_eq!(preempt_count(), 1);
        drop(held);
        assert!(lock.try_lock().is_some());
        assert_eq!(preempt_count(), 0);
    }
}
