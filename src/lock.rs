//! Lock acquisition that survives poisoning.
//!
//! The maps behind these locks stay structurally valid even when a holder
//! panicked, so the guards take the data back and leave a trace of where it
//! happened. `scope` names the store and operation, e.g. `fragments.touch`.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(lock: &'a RwLock<T>, scope: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(target: "tessella::lock", scope, kind = "rwlock.read", "poisoned lock recovered");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(lock: &'a RwLock<T>, scope: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(target: "tessella::lock", scope, kind = "rwlock.write", "poisoned lock recovered");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(lock: &'a Mutex<T>, scope: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(target: "tessella::lock", scope, kind = "mutex.lock", "poisoned lock recovered");
            poisoned.into_inner()
        }
    }
}
