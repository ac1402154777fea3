#[cfg(feature = "parking-lot")]
pub(crate) use parking_lot::{Mutex, MutexGuard};
#[cfg(not(feature = "parking-lot"))]
pub(crate) use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning. Only guards cold-path state (worker
/// handles), which stays consistent even if a holder panicked.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    #[cfg(feature = "parking-lot")]
    {
        mutex.lock()
    }
    #[cfg(not(feature = "parking-lot"))]
    {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
