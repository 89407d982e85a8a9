// # Thread Cache
//
// A per-thread magazine layered over one root's buckets. The hot path
// touches nothing shared: hits pop a thread-local freelist, and puts push
// one. Misses batch-fill from the central allocator under a single lock
// hold; overflowing puts are rejected to the central path so a bucket never
// exceeds its limit. Exactly one root per process may own the cache (the
// TLS slot is a singleton), enforced with a compare-and-swap at init.
//
// The cache object itself is placement-allocated from the owning root's
// raw path, so creating or destroying a cache never recurses through the
// process allocator.

pub mod registry;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::bucket::sizes;
use crate::constants::{
    THREAD_CACHE_BATCH_FILL_RATIO, THREAD_CACHE_BUCKET_COUNT,
    THREAD_CACHE_MAX_COUNT_PER_BUCKET,
};
use crate::freelist::FreelistEntry;
use crate::root::{PartitionRoot, ALLOC_RETURN_NULL};
use crate::stats::ThreadCacheStats;

#[derive(Clone, Copy)]
struct TcBucket {
    freelist_head: *mut FreelistEntry,
    count: u16,
    limit: u16,
}

#[derive(Default)]
struct CacheCounters {
    alloc_count: AtomicU64,
    alloc_hits: AtomicU64,
    alloc_misses: AtomicU64,
    alloc_miss_empty: AtomicU64,
    alloc_miss_too_large: AtomicU64,
    cache_fill_count: AtomicU64,
    cache_fill_hits: AtomicU64,
    cache_fill_misses: AtomicU64,
}

#[repr(C)]
pub struct ThreadCache {
    buckets: [TcBucket; THREAD_CACHE_BUCKET_COUNT],
    stats: CacheCounters,
    root: *const PartitionRoot,
    pub(crate) prev: *mut ThreadCache,
    pub(crate) next: *mut ThreadCache,
    should_purge: AtomicBool,
}

// One PartitionRoot per process may own the TLS slot.
static TLS_OWNER: AtomicUsize = AtomicUsize::new(0);

struct TlsSlot {
    cache: *mut ThreadCache,
}

impl Drop for TlsSlot {
    fn drop(&mut self) {
        if !self.cache.is_null() {
            unsafe { ThreadCache::delete(self.cache) };
            self.cache = core::ptr::null_mut();
        }
    }
}

thread_local! {
    static TLS_CACHE: RefCell<TlsSlot> = const {
        RefCell::new(TlsSlot {
            cache: core::ptr::null_mut(),
        })
    };
}

/// Claims the process-wide TLS slot for `root`. Crashes when another root
/// already owns it.
pub fn init_for_root(root: &PartitionRoot) {
    let root_address = root as *const PartitionRoot as usize;
    let claimed = TLS_OWNER
        .compare_exchange(0, root_address, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    assert!(
        claimed,
        "only one PartitionRoot is allowed to have a thread cache"
    );
}

#[cfg(test)]
pub fn reset_tls_owner_for_testing() {
    TLS_OWNER.store(0, Ordering::SeqCst);
}

/// Fast-path allocation attempt. Returns a raw slot start on hit; `None`
/// sends the caller to the central allocator.
pub fn allocate(root: &PartitionRoot, bucket_index: usize) -> Option<usize> {
    TLS_CACHE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.cache.is_null() {
                slot.cache = ThreadCache::create(root)?;
            }
            let cache = unsafe { &mut *slot.cache };
            debug_assert_eq!(cache.root, root as *const PartitionRoot);
            cache.allocate(root, bucket_index)
        })
        .ok()
        .flatten()
}

/// Fast-path free attempt. Returns true when the slot was cached.
pub fn maybe_put_in_cache(root: &PartitionRoot, slot_start: usize, bucket_index: usize) -> bool {
    TLS_CACHE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.cache.is_null() {
                return false;
            }
            let cache = unsafe { &mut *slot.cache };
            debug_assert_eq!(cache.root, root as *const PartitionRoot);
            cache.maybe_put_in_cache(slot_start, bucket_index)
        })
        .unwrap_or(false)
}

/// Synchronously purges the calling thread's cache, if any.
pub fn purge_current_thread() {
    let _ = TLS_CACHE.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        if !slot.cache.is_null() {
            unsafe { (*slot.cache).purge() };
        }
    });
}

/// The calling thread's cache, for tests.
pub fn current_thread_cache() -> Option<*mut ThreadCache> {
    TLS_CACHE
        .try_with(|slot| {
            let cache = slot.borrow().cache;
            if cache.is_null() {
                None
            } else {
                Some(cache)
            }
        })
        .ok()
        .flatten()
}

impl ThreadCache {
    fn limit_for(slot_size: usize) -> u16 {
        // Smaller allocations are more frequent and more
        // performance-sensitive; cache more of them and fewer large ones.
        let limit: u16 = if slot_size <= 128 {
            128
        } else if slot_size <= 256 {
            64
        } else {
            32
        };
        limit.min(THREAD_CACHE_MAX_COUNT_PER_BUCKET)
    }

    /// Placement-allocates a cache from the root's raw path and registers
    /// it. Returns `None` when the central allocator is out of memory.
    fn create(root: &PartitionRoot) -> Option<*mut ThreadCache> {
        let size = core::mem::size_of::<ThreadCache>();
        let bucket_index = sizes::size_to_bucket_index(size)
            .expect("ThreadCache must fit a bucketed size");
        let slot_start = {
            let _guard = root.lock.lock();
            let inner = unsafe { root.inner_locked() };
            unsafe {
                root.alloc_from_bucket_locked(inner, bucket_index, ALLOC_RETURN_NULL, size)
            }?
        };

        let mut buckets = [TcBucket {
            freelist_head: core::ptr::null_mut(),
            count: 0,
            limit: 0,
        }; THREAD_CACHE_BUCKET_COUNT];
        for (index, bucket) in buckets.iter_mut().enumerate() {
            bucket.limit = Self::limit_for(sizes::bucket_slot_size(index));
        }

        let cache = slot_start as *mut ThreadCache;
        unsafe {
            cache.write(ThreadCache {
                buckets,
                stats: CacheCounters::default(),
                root: root as *const PartitionRoot,
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                should_purge: AtomicBool::new(false),
            });
            registry::ThreadCacheRegistry::instance().register(cache);
        }
        Some(cache)
    }

    /// Tears a cache down: unregister, return every cached slot, release
    /// the cache's own storage. Runs from the TLS destructor.
    ///
    /// # Safety
    /// `cache` must be a live cache not referenced by any other thread.
    pub(crate) unsafe fn delete(cache: *mut ThreadCache) {
        registry::ThreadCacheRegistry::instance().unregister(cache);
        (*cache).purge();
        let root = &*(*cache).root;
        let _guard = root.lock.lock();
        let inner = root.inner_locked();
        root.raw_free_locked_no_span(inner, cache as usize);
    }

    fn allocate(&mut self, root: &PartitionRoot, bucket_index: usize) -> Option<usize> {
        if self.should_purge.load(Ordering::Relaxed) {
            self.purge();
        }
        self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);

        if bucket_index >= THREAD_CACHE_BUCKET_COUNT {
            self.stats.alloc_misses.fetch_add(1, Ordering::Relaxed);
            self.stats
                .alloc_miss_too_large
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(slot) = self.try_pop(bucket_index) {
            self.stats.alloc_hits.fetch_add(1, Ordering::Relaxed);
            return Some(slot);
        }

        self.stats.alloc_misses.fetch_add(1, Ordering::Relaxed);
        self.stats.alloc_miss_empty.fetch_add(1, Ordering::Relaxed);
        self.fill_bucket(root, bucket_index);
        self.try_pop(bucket_index)
    }

    fn try_pop(&mut self, bucket_index: usize) -> Option<usize> {
        let bucket = &mut self.buckets[bucket_index];
        let head = bucket.freelist_head;
        if head.is_null() {
            debug_assert_eq!(bucket.count, 0);
            return None;
        }
        debug_assert!(bucket.count > 0);
        unsafe {
            bucket.freelist_head = (*head).get_next_for_thread_cache();
            bucket.count -= 1;
            Some((*head).clear_for_allocation() as usize)
        }
    }

    fn maybe_put_in_cache(&mut self, slot_start: usize, bucket_index: usize) -> bool {
        self.stats.cache_fill_count.fetch_add(1, Ordering::Relaxed);
        if bucket_index >= THREAD_CACHE_BUCKET_COUNT {
            self.stats.cache_fill_misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let bucket = &mut self.buckets[bucket_index];
        if bucket.count >= bucket.limit {
            self.stats.cache_fill_misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            // Magazines legitimately chain slots across super pages.
            let entry =
                FreelistEntry::init_for_thread_cache(slot_start as *mut u8, bucket.freelist_head);
            bucket.freelist_head = entry;
        }
        bucket.count += 1;
        self.stats.cache_fill_hits.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Batch-refills a bucket under one lock hold. Filling a quarter of
    /// the limit keeps the bucket neither empty nor full, avoiding
    /// fill/clear oscillation against the central allocator.
    fn fill_bucket(&mut self, root: &PartitionRoot, bucket_index: usize) {
        let limit = self.buckets[bucket_index].limit;
        let fill = (limit / THREAD_CACHE_BATCH_FILL_RATIO).max(1);
        let slot_size = sizes::bucket_slot_size(bucket_index);

        let _guard = root.lock.lock();
        let inner = unsafe { root.inner_locked() };
        for _ in 0..fill {
            // A failing under-pressure root aborts the batch; the miss is
            // surfaced by the caller's retry.
            let slot = match unsafe {
                root.alloc_from_bucket_locked(inner, bucket_index, ALLOC_RETURN_NULL, slot_size)
            } {
                Some(slot) => slot,
                None => break,
            };
            let bucket = &mut self.buckets[bucket_index];
            unsafe {
                let entry =
                    FreelistEntry::init_for_thread_cache(slot as *mut u8, bucket.freelist_head);
                bucket.freelist_head = entry;
            }
            bucket.count += 1;
        }
    }

    /// Returns cached slots to the central allocator until `limit` remain.
    fn clear_bucket(&mut self, bucket_index: usize, limit: u16) {
        if self.buckets[bucket_index].count <= limit {
            return;
        }
        let root = unsafe { &*self.root };
        let _guard = root.lock.lock();
        let inner = unsafe { root.inner_locked() };
        while self.buckets[bucket_index].count > limit {
            let bucket = &mut self.buckets[bucket_index];
            let head = bucket.freelist_head;
            debug_assert!(!head.is_null());
            unsafe {
                bucket.freelist_head = (*head).get_next_for_thread_cache();
                bucket.count -= 1;
                root.raw_free_locked_no_span(inner, head as usize);
            }
        }
    }

    /// Empties every bucket. The partition lock must not be held.
    pub fn purge(&mut self) {
        for index in 0..THREAD_CACHE_BUCKET_COUNT {
            self.clear_bucket(index, 0);
        }
        self.should_purge.store(false, Ordering::Relaxed);
    }

    /// Requests a purge from another thread; honored on that thread's next
    /// allocation.
    pub fn set_should_purge(&self) {
        self.should_purge.store(true, Ordering::Relaxed);
    }

    pub fn bucket_count_for_testing(&self, bucket_index: usize) -> usize {
        self.buckets[bucket_index].count as usize
    }

    /// Accumulates this cache's counters. Reads race mutation by design.
    pub fn accumulate_stats(&self, stats: &mut ThreadCacheStats) {
        stats.alloc_count += self.stats.alloc_count.load(Ordering::Relaxed);
        stats.alloc_hits += self.stats.alloc_hits.load(Ordering::Relaxed);
        stats.alloc_misses += self.stats.alloc_misses.load(Ordering::Relaxed);
        stats.alloc_miss_empty += self.stats.alloc_miss_empty.load(Ordering::Relaxed);
        stats.alloc_miss_too_large += self.stats.alloc_miss_too_large.load(Ordering::Relaxed);
        stats.cache_fill_count += self.stats.cache_fill_count.load(Ordering::Relaxed);
        stats.cache_fill_hits += self.stats.cache_fill_hits.load(Ordering::Relaxed);
        stats.cache_fill_misses += self.stats.cache_fill_misses.load(Ordering::Relaxed);
        for (index, bucket) in self.buckets.iter().enumerate() {
            stats.bucket_total_memory +=
                bucket.count as u64 * sizes::bucket_slot_size(index) as u64;
        }
        stats.metadata_overhead += core::mem::size_of::<ThreadCache>() as u64;
    }
}
