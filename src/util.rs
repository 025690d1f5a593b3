use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock an engine mutex, recovering the guard if a previous holder
/// panicked.  No critical section here leaves its map half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
