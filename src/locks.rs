// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The queue and the reconciler keep their state behind `std::sync` locks that
//! are never held across an `.await`. A panic inside a listener or a transfer
//! callback would otherwise poison the lock and take every later operation
//! down with it, so these helpers log the event and hand back the guard.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tvtrack::locks",
                event = "LOCK_POISONED_READ",
                "state lock poisoned during read; continuing with last written state"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tvtrack::locks",
                event = "LOCK_POISONED_WRITE",
                "state lock poisoned during write; continuing with last written state"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering the guard if the mutex is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tvtrack::locks",
                event = "LOCK_POISONED_MUTEX",
                "mutex poisoned; continuing with last written state"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_write_roundtrip() {
        let lock = RwLock::new(1);
        *resilient_write(&lock) = 7;
        assert_eq!(*resilient_read(&lock), 7);
    }

    #[test]
    fn test_poisoned_rwlock_recovers() {
        let lock = Arc::new(RwLock::new(vec![1, 2, 3]));
        let poisoner = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        resilient_write(&lock).push(4);
        assert_eq!(resilient_read(&lock).len(), 4);
    }

    #[test]
    fn test_poisoned_mutex_recovers() {
        let lock = Arc::new(Mutex::new(0u32));
        let poisoner = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        *resilient_lock(&lock) += 1;
        assert_eq!(*resilient_lock(&lock), 1);
    }
}
