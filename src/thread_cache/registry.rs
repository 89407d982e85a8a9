// Process-wide registry of live thread caches: an intrusive doubly-linked
// list under its own lock (never the root lock). Cross-thread purging
// cannot touch another thread's magazines directly, so it flags them and
// lets each thread purge itself on its next visit to the hot path.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::stats::ThreadCacheStats;

use super::ThreadCache;

struct ListHead(*mut ThreadCache);

// The registry only ever dereferences caches under its lock, and a cache
// is unregistered before its thread tears it down.
unsafe impl Send for ListHead {}

pub struct ThreadCacheRegistry {
    list_head: Mutex<ListHead>,
}

static INSTANCE: Lazy<ThreadCacheRegistry> = Lazy::new(|| ThreadCacheRegistry {
    list_head: Mutex::new(ListHead(core::ptr::null_mut())),
});

impl ThreadCacheRegistry {
    pub fn instance() -> &'static ThreadCacheRegistry {
        &INSTANCE
    }

    /// # Safety
    /// `cache` must be a fully-initialized cache not yet registered.
    pub unsafe fn register(&self, cache: *mut ThreadCache) {
        let mut head = self.list_head.lock();
        (*cache).prev = core::ptr::null_mut();
        (*cache).next = head.0;
        if !head.0.is_null() {
            (*head.0).prev = cache;
        }
        head.0 = cache;
    }

    /// # Safety
    /// `cache` must be currently registered.
    pub unsafe fn unregister(&self, cache: *mut ThreadCache) {
        let mut head = self.list_head.lock();
        if !(*cache).prev.is_null() {
            (*(*cache).prev).next = (*cache).next;
        }
        if !(*cache).next.is_null() {
            (*(*cache).next).prev = (*cache).prev;
        }
        if head.0 == cache {
            head.0 = (*cache).next;
        }
    }

    /// Accumulates counters across caches (or only the caller's). Reads of
    /// other threads' counters are racy by design.
    pub fn dump_stats(&self, my_thread_only: bool, stats: &mut ThreadCacheStats) {
        *stats = ThreadCacheStats::default();
        if my_thread_only {
            if let Some(cache) = super::current_thread_cache() {
                unsafe { (*cache).accumulate_stats(stats) };
            }
            return;
        }
        let head = self.list_head.lock();
        let mut cache = head.0;
        while !cache.is_null() {
            unsafe {
                (*cache).accumulate_stats(stats);
                cache = (*cache).next;
            }
        }
    }

    /// Purges the caller's cache synchronously and asks every other thread
    /// to purge at its next convenience.
    pub fn purge_all(&self) {
        let current = super::current_thread_cache();
        {
            let head = self.list_head.lock();
            let mut cache = head.0;
            while !cache.is_null() {
                unsafe {
                    if Some(cache) != current {
                        (*cache).set_should_purge();
                    }
                    cache = (*cache).next;
                }
            }
        }
        // Not under the registry lock: purging takes the partition lock.
        if let Some(cache) = current {
            unsafe { (*cache).purge() };
        }
    }
}
