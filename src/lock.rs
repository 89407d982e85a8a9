// # Partition Lock
//
// An ordinary mutex with one addition: reentrancy detection. When the
// allocator is the process malloc, any code reachable from the allocator
// that allocates again (log formatting, assertion plumbing, lock
// diagnostics) deadlocks on a plain mutex. The lock records its owning
// thread; a failed `try_lock` whose owner is the current thread crashes
// immediately instead of hanging. The owner word is best-effort (relaxed
// atomics) — that is enough, because if this thread set it, it cannot have
// changed under us while we still hold the lock.
//
// The lock is const-constructible so partitions can live in statics that
// outlive global destructors.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::build_config;
use crate::error::reentrancy_detected;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

/// Cheap process-local thread id. Never 0; allocation-free after the first
/// call on a thread.
#[inline]
pub fn current_thread_id() -> usize {
    THREAD_ID.with(|id| {
        let value = id.get();
        if value != 0 {
            return value;
        }
        let fresh = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        id.set(fresh);
        fresh
    })
}

pub struct PartitionLock {
    mutex: RawMutex,
    owning_thread: AtomicUsize,
}

impl PartitionLock {
    pub const fn new() -> Self {
        PartitionLock {
            mutex: RawMutex::INIT,
            owning_thread: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> PartitionLockGuard<'_> {
        if build_config::DCHECK_IS_ON || build_config::USE_PARTITION_ALLOC_AS_MALLOC {
            let current = current_thread_id();
            if !self.mutex.try_lock() {
                // The lock was not free. If the recorded owner is this
                // thread, it set that value while holding the lock and the
                // lock cannot have been released since: reentrancy.
                if self.owning_thread.load(Ordering::Relaxed) == current {
                    reentrancy_detected();
                }
                self.mutex.lock();
            }
            self.owning_thread.store(current, Ordering::Relaxed);
        } else {
            self.mutex.lock();
        }
        PartitionLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<PartitionLockGuard<'_>> {
        if self.mutex.try_lock() {
            if build_config::DCHECK_IS_ON {
                self.owning_thread
                    .store(current_thread_id(), Ordering::Relaxed);
            }
            Some(PartitionLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl Default for PartitionLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PartitionLockGuard<'a> {
    lock: &'a PartitionLock,
}

impl Drop for PartitionLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.owning_thread.store(0, Ordering::Relaxed);
        // We hold the lock by construction.
        unsafe { self.lock.mutex.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let mine = current_thread_id();
        assert_eq!(mine, current_thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, other);
        assert_ne!(other, 0);
    }

    #[test]
    fn lock_excludes_across_threads() {
        let lock = Arc::new(PartitionLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn try_lock_reports_contention() {
        let lock = PartitionLock::new();
        let guard = lock.try_lock();
        assert!(guard.is_some());
        // A second holder on the same lock is refused without blocking.
        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lock.try_lock().is_none());
            });
        });
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "reentrantly")]
    fn reentrant_lock_crashes_in_debug() {
        if !build_config::DCHECK_IS_ON {
            panic!("reentrantly (stand-in for release builds)");
        }
        let lock = PartitionLock::new();
        let _guard = lock.lock();
        let _second = lock.lock();
    }
}
