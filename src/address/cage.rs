// # GigaCage
//
// One-time reservation of the adjacent address pools. After `init()`:
//
// ```text
// +-------------------+ reserved_base
// |  forbidden zone   |   (inaccessible forever; keeps one-past-end
// +-------------------+    pointers of foreign allocations out of the pools)
// |   non-BRP pool    | pools_base, aligned to its own size
// +-------------------+
// |     BRP pool      | aligned to its own size
// |  ... tail super   |   last super page committed: reservation offset table
// +-------------------+
// ```
//
// The non-BRP pool must precede the BRP pool: a pointer one past the end of
// a non-cage allocation must never land in the BRP pool and trip the
// ref-count machinery. Pool membership is a single mask-and-compare against
// the cached base addresses, so the scanner's bailout and
// `is_managed_by_partition_alloc` stay branch-cheap.
//
// The configurable pool (for aligned-alloc partitions, which carry no
// extras) is a separate self-aligned reservation made on first use.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::constants::{
    BRP_POOL_SIZE, CONFIGURABLE_POOL_SIZE, FORBIDDEN_ZONE_SIZE, NON_BRP_POOL_SIZE,
    NOT_IN_DIRECT_MAP, SUPER_PAGE_SIZE,
};
use crate::page::{self, PageAccess};

use super::pool_manager::{AddressPoolManager, PoolHandle};

/// Combined size of the two cage pools (the offset table covers exactly
/// this range).
pub const CAGE_POOLS_SIZE: usize = NON_BRP_POOL_SIZE + BRP_POOL_SIZE;

// Hot-path caches; zero means "not initialized". The authoritative state
// lives behind the mutex below.
static POOLS_BASE: AtomicUsize = AtomicUsize::new(0);
static NON_BRP_BASE: AtomicUsize = AtomicUsize::new(0);
static BRP_BASE: AtomicUsize = AtomicUsize::new(0);
static CONFIGURABLE_BASE: AtomicUsize = AtomicUsize::new(0);
static TABLE_BASE: AtomicUsize = AtomicUsize::new(0);

struct CageInner {
    reserved_base: usize,
    reserved_size: usize,
    non_brp_pool: PoolHandle,
    brp_pool: PoolHandle,
    configurable: Option<ConfigurablePool>,
}

struct ConfigurablePool {
    base: usize,
    handle: PoolHandle,
}

static CAGE: Lazy<Mutex<Option<CageInner>>> = Lazy::new(|| Mutex::new(None));

/// Anchor-alignment computation: place N self-aligned pools back to back.
/// The largest pool anchors the core alignment; the sizes before it fix the
/// offset within that alignment at which the stack must start.
fn calculate_cage_properties(pool_sizes: &[usize]) -> (usize, usize, usize) {
    let mut size_sum = 0usize;
    let mut alignment = 0usize;
    let mut alignment_offset = 0usize;
    for &pool_size in pool_sizes {
        assert!(pool_size.is_power_of_two());
        if pool_size > alignment {
            alignment = pool_size;
            alignment_offset = alignment.wrapping_sub(size_sum) & (alignment - 1);
        }
        size_sum += pool_size;
    }
    // Verify the found placement actually self-aligns every pool.
    let mut sample = alignment_offset + 7 * alignment;
    for &pool_size in pool_sizes {
        assert_eq!(sample & (pool_size - 1), 0, "pool ordering cannot be self-aligned");
        sample += pool_size;
    }
    (size_sum, alignment, alignment_offset)
}

/// Reserves the cage and registers its pools. Idempotent; double-init is
/// silently skipped.
pub fn init() {
    let mut guard = CAGE.lock();
    if guard.is_some() {
        return;
    }

    let pool_sizes = [NON_BRP_POOL_SIZE, BRP_POOL_SIZE];
    let (size_sum, alignment, alignment_offset) = calculate_cage_properties(&pool_sizes);

    // The reservation starts FORBIDDEN_ZONE_SIZE before the pool stack, so
    // the base must sit that much before the pools' alignment offset.
    let reserved_size = FORBIDDEN_ZONE_SIZE + size_sum;
    let base_offset =
        (alignment_offset.wrapping_sub(FORBIDDEN_ZONE_SIZE)) & (alignment - 1);
    let reserved_base = page::alloc_pages_with_align_offset(
        None,
        reserved_size,
        alignment,
        base_offset,
        PageAccess::Inaccessible,
        0,
    )
    .unwrap_or_else(|| {
        crate::oom::partition_oom(reserved_size);
    });

    let pools_base = reserved_base + FORBIDDEN_ZONE_SIZE;
    debug_assert_eq!(pools_base % alignment, alignment_offset);
    let non_brp_base = pools_base;
    let brp_base = pools_base + NON_BRP_POOL_SIZE;

    let manager = AddressPoolManager::instance();
    let non_brp_pool = manager
        .add(non_brp_base, NON_BRP_POOL_SIZE)
        .expect("non-BRP pool registration");
    let brp_pool = manager
        .add(brp_base, BRP_POOL_SIZE)
        .expect("BRP pool registration");

    // The reservation offset table occupies exactly the tail super page of
    // the BRP pool: commit it, pin it in the pool's bitset so it is never
    // handed out, and flood it with the not-in-direct-map sentinel.
    let table_base = brp_base + BRP_POOL_SIZE - SUPER_PAGE_SIZE;
    let pinned = manager.reserve(brp_pool, Some(table_base), SUPER_PAGE_SIZE);
    assert_eq!(pinned, Some(table_base));
    if !page::set_system_pages_access(table_base, SUPER_PAGE_SIZE, PageAccess::ReadWrite) {
        crate::oom::partition_oom(SUPER_PAGE_SIZE);
    }
    debug_assert_eq!(NOT_IN_DIRECT_MAP, u16::MAX);
    unsafe {
        core::ptr::write_bytes(table_base as *mut u8, 0xff, SUPER_PAGE_SIZE);
    }

    POOLS_BASE.store(pools_base, Ordering::Release);
    NON_BRP_BASE.store(non_brp_base, Ordering::Release);
    BRP_BASE.store(brp_base, Ordering::Release);
    TABLE_BASE.store(table_base, Ordering::Release);

    *guard = Some(CageInner {
        reserved_base,
        reserved_size,
        non_brp_pool,
        brp_pool,
        configurable: None,
    });

    log::info!(
        "address cage reserved: {} GiB at {:#x} (non-BRP {:#x}, BRP {:#x})",
        reserved_size >> 30,
        reserved_base,
        non_brp_base,
        brp_base
    );
}

pub fn is_initialized() -> bool {
    POOLS_BASE.load(Ordering::Acquire) != 0
}

pub fn non_brp_pool() -> PoolHandle {
    init();
    CAGE.lock().as_ref().expect("cage initialized").non_brp_pool
}

pub fn brp_pool() -> PoolHandle {
    init();
    CAGE.lock().as_ref().expect("cage initialized").brp_pool
}

/// Lazily reserves the configurable pool and returns its handle.
pub fn configurable_pool() -> PoolHandle {
    init();
    let mut guard = CAGE.lock();
    let inner = guard.as_mut().expect("cage initialized");
    if let Some(ref pool) = inner.configurable {
        return pool.handle;
    }

    let base = page::alloc_pages(
        None,
        CONFIGURABLE_POOL_SIZE,
        CONFIGURABLE_POOL_SIZE,
        PageAccess::Inaccessible,
        0,
    )
    .unwrap_or_else(|| crate::oom::partition_oom(CONFIGURABLE_POOL_SIZE));
    let handle = AddressPoolManager::instance()
        .add(base, CONFIGURABLE_POOL_SIZE)
        .expect("configurable pool registration");
    CONFIGURABLE_BASE.store(base, Ordering::Release);
    inner.configurable = Some(ConfigurablePool { base, handle });
    handle
}

/// Base of the offset-table coverage (== non-BRP pool base). Zero before
/// init.
#[inline]
pub fn pools_base() -> usize {
    POOLS_BASE.load(Ordering::Acquire)
}

#[inline]
pub fn reservation_offset_table_base() -> usize {
    TABLE_BASE.load(Ordering::Acquire)
}

/// Returns false for null and for every address outside the non-BRP pool.
#[inline]
pub fn is_in_non_brp_pool(address: usize) -> bool {
    let base = NON_BRP_BASE.load(Ordering::Relaxed);
    base != 0 && (address & !(NON_BRP_POOL_SIZE - 1)) == base
}

/// Returns false for null and for every address outside the BRP pool.
#[inline]
pub fn is_in_brp_pool(address: usize) -> bool {
    let base = BRP_BASE.load(Ordering::Relaxed);
    base != 0 && (address & !(BRP_POOL_SIZE - 1)) == base
}

#[inline]
pub fn is_in_configurable_pool(address: usize) -> bool {
    let base = CONFIGURABLE_BASE.load(Ordering::Relaxed);
    base != 0 && (address & !(CONFIGURABLE_POOL_SIZE - 1)) == base
}

/// True iff the address lies inside any pool this allocator owns.
#[inline]
pub fn is_managed_by_partition_alloc(address: usize) -> bool {
    is_in_non_brp_pool(address) || is_in_brp_pool(address) || is_in_configurable_pool(address)
}

/// The scanner's fast bailout: both normal-bucket-hosting pools.
#[inline]
pub fn is_in_cage_pools(address: usize) -> bool {
    is_in_non_brp_pool(address) || is_in_brp_pool(address)
}

/// Tears the cage down. Only valid when every partition created against it
/// is gone; exists for isolated test binaries.
pub fn uninit_for_testing() {
    let mut guard = CAGE.lock();
    if let Some(inner) = guard.take() {
        let manager = AddressPoolManager::instance();
        manager.remove(inner.non_brp_pool);
        manager.remove(inner.brp_pool);
        if let Some(pool) = inner.configurable {
            manager.remove(pool.handle);
            page::free_pages(pool.base, CONFIGURABLE_POOL_SIZE);
        }
        page::free_pages(inner.reserved_base, inner.reserved_size);
    }
    POOLS_BASE.store(0, Ordering::Release);
    NON_BRP_BASE.store(0, Ordering::Release);
    BRP_BASE.store(0, Ordering::Release);
    CONFIGURABLE_BASE.store(0, Ordering::Release);
    TABLE_BASE.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cage_properties_for_equal_pools() {
        let (size_sum, alignment, offset) =
            calculate_cage_properties(&[NON_BRP_POOL_SIZE, BRP_POOL_SIZE]);
        assert_eq!(size_sum, CAGE_POOLS_SIZE);
        assert_eq!(alignment, NON_BRP_POOL_SIZE.max(BRP_POOL_SIZE));
        assert_eq!(offset, 0);
    }

    #[test]
    fn cage_properties_with_smaller_leading_pool() {
        // A smaller pool ahead of the anchor shifts the start so the anchor
        // still lands on its own alignment.
        let (sum, alignment, offset) = calculate_cage_properties(&[1 << 30, 4 << 30]);
        assert_eq!(sum, 5 << 30);
        assert_eq!(alignment, 4 << 30);
        assert_eq!(offset, (4usize << 30) - (1 << 30));
    }

    #[test]
    fn init_is_idempotent_and_pools_disjoint() {
        init();
        init();
        assert!(is_initialized());

        let base = pools_base();
        assert_eq!(base % NON_BRP_POOL_SIZE, 0);
        // A pointer in the middle of each pool classifies correctly.
        assert!(is_in_non_brp_pool(base + NON_BRP_POOL_SIZE / 2));
        assert!(!is_in_brp_pool(base + NON_BRP_POOL_SIZE / 2));
        let brp_mid = base + NON_BRP_POOL_SIZE + BRP_POOL_SIZE / 2;
        assert!(is_in_brp_pool(brp_mid));
        assert!(!is_in_non_brp_pool(brp_mid));
        // Null and the forbidden zone stay unclassified.
        assert!(!is_managed_by_partition_alloc(0));
        assert!(!is_managed_by_partition_alloc(base - 1));
    }
}
