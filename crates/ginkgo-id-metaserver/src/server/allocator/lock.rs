use parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Named mutual-exclusion locks serializing allocations per biz tag.
///
/// Acquisition blocks; the lock is released when the returned guard drops.
/// A replicated deployment needs a distributed implementation here, but the
/// allocation protocol stays correct without one: the conditional update
/// still rejects writers that raced past the lock.
pub trait LockService: Send + Sync {
    type Guard;

    fn acquire(&self, name: &str) -> Self::Guard;
}

/// Process-local [`LockService`] for single-replica deployments.
///
/// Keeps one mutex per name for the lifetime of the service, which is fine
/// for the handful of biz tags a deployment serves.
#[derive(Debug, Default)]
pub struct LocalLockService {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for LocalLockService {
    type Guard = ArcMutexGuard<RawMutex, ()>;

    fn acquire(&self, name: &str) -> Self::Guard {
        let lock = {
            let mut locks = self.locks.lock();
            match locks.get(name) {
                Some(lock) => Arc::clone(lock),
                None => Arc::clone(locks.entry(name.to_owned()).or_default()),
            }
        };
        lock.lock_arc()
    }
}
