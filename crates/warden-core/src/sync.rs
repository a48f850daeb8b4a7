//! Synchronization helpers for poisoned locks.

use std::sync::{Mutex, MutexGuard};

/// Extension trait for [`Mutex`] that treats poisoning as recoverable.
///
/// A poisoned lock means some thread panicked while holding the guard; the
/// panic itself is the failure worth reporting, and the guarded data here is
/// still usable. Callers that only hold plain data behind the lock can take
/// the guard regardless.
pub trait IgnoreLock<T> {
    /// Locks the mutex, clearing any poison.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnoreLock<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
