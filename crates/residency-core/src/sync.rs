//! Lock helpers.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquire a mutex, recovering the guard if a previous holder panicked.
///
/// Every structure guarded this way keeps its invariants between statements,
/// so a poisoned lock still holds consistent bookkeeping.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
