// # Address Pool Manager
//
// Sub-allocates super-page-aligned chunks out of fixed reserved pools and
// answers "which pool owns address X" in constant time. Reservation state is
// one bit per super page (1 = allocated) plus a watermark hint below which
// every bit is known set; young pools therefore allocate in O(1) without
// scanning.
//
// Reserve and unreserve are pure bookkeeping over the bitset; the physical
// decommit on unreserve is best-effort so the manager can also track
// address ranges it did not map itself.

use parking_lot::Mutex;

use crate::constants::{SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE, NUM_POOLS};
use crate::error::{invalid_pool_handle, PoolError};
use crate::page;

/// 1-based pool identifier. Zero is never a valid handle.
pub type PoolHandle = u8;

/// Hard cap on a single pool, in bytes (8192 super pages).
pub const MAX_POOL_SIZE: usize = 8192 * SUPER_PAGE_SIZE;

struct Pool {
    base: usize,
    total_bits: usize,
    // 1 = allocated. Boxed so unused pool slots cost nothing.
    bitset: Box<[u64]>,
    // Index below which all bits are known to be 1. Best-effort: there may
    // be more 1s above it, but never a 0 below it.
    bit_hint: usize,
}

impl Pool {
    fn new(base: usize, length: usize) -> Self {
        let total_bits = length >> SUPER_PAGE_SHIFT;
        let words = total_bits.div_ceil(64);
        Pool {
            base,
            total_bits,
            bitset: vec![0u64; words].into_boxed_slice(),
            bit_hint: 0,
        }
    }

    #[inline]
    fn bit(&self, index: usize) -> bool {
        self.bitset[index / 64] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, index: usize) {
        self.bitset[index / 64] |= 1u64 << (index % 64);
    }

    #[inline]
    fn clear_bit(&mut self, index: usize) {
        self.bitset[index / 64] &= !(1u64 << (index % 64));
    }

    /// First-fit search for `need` consecutive clear bits. Thanks to the
    /// hint invariant, starting at `bit_hint` *is* first fit.
    fn find_chunk(&mut self, need: usize) -> Option<usize> {
        let mut run_start = self.bit_hint;
        let mut run_len = 0;
        let mut index = self.bit_hint;
        while index < self.total_bits {
            if self.bit(index) {
                run_start = index + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == need {
                    for i in run_start..run_start + need {
                        self.set_bit(i);
                    }
                    if run_start == self.bit_hint {
                        self.bit_hint = run_start + need;
                    }
                    return Some(run_start);
                }
            }
            index += 1;
        }
        None
    }

    /// Claims the exact run starting at `start` if every bit in it is clear.
    fn try_reserve_chunk(&mut self, start: usize, need: usize) -> bool {
        if start + need > self.total_bits {
            return false;
        }
        for i in start..start + need {
            if self.bit(i) {
                return false;
            }
        }
        for i in start..start + need {
            self.set_bit(i);
        }
        if start <= self.bit_hint {
            self.bit_hint = self.bit_hint.max(start + need);
        }
        true
    }

    fn free_chunk(&mut self, start: usize, need: usize) {
        for i in start..start + need {
            debug_assert!(self.bit(i), "freeing an unreserved super page");
            self.clear_bit(i);
        }
        if start < self.bit_hint {
            self.bit_hint = start;
        }
    }
}

/// Process-wide pool registry. Pools are registered by the cage at startup
/// and, for the configurable pool, on first use.
pub struct AddressPoolManager {
    pools: [Mutex<Option<Pool>>; NUM_POOLS],
}

static INSTANCE: AddressPoolManager = AddressPoolManager {
    pools: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
};

impl AddressPoolManager {
    pub fn instance() -> &'static AddressPoolManager {
        &INSTANCE
    }

    /// A detached manager for tests that must not disturb the process-wide
    /// pool registry.
    pub fn new_for_testing() -> AddressPoolManager {
        AddressPoolManager {
            pools: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
        }
    }

    /// Registers `[base, base + length)` as a pool and returns its handle.
    ///
    /// `base` and `length` must be super-page aligned; `length` must not
    /// exceed `MAX_POOL_SIZE`. Violations crash: pools are created during
    /// process bring-up where misconfiguration must not be survivable.
    pub fn add(&self, base: usize, length: usize) -> Result<PoolHandle, PoolError> {
        assert!(
            base % SUPER_PAGE_SIZE == 0 && length % SUPER_PAGE_SIZE == 0,
            "pool region {base:#x}+{length:#x} is not super-page aligned"
        );
        assert!(
            length <= MAX_POOL_SIZE,
            "pool length {length:#x} exceeds the maximum pool size"
        );

        for (i, slot) in self.pools.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(Pool::new(base, length));
                return Ok((i + 1) as PoolHandle);
            }
        }
        Err(PoolError::NoFreePoolSlot { max: NUM_POOLS })
    }

    pub fn remove(&self, handle: PoolHandle) {
        let mut guard = self.pool_slot(handle).lock();
        *guard = None;
    }

    /// Reserves `length` bytes (a multiple of the super page size) from the
    /// pool, optionally at `requested_address`. Returns the chunk start, or
    /// `None` when the pool cannot satisfy the request.
    pub fn reserve(
        &self,
        handle: PoolHandle,
        requested_address: Option<usize>,
        length: usize,
    ) -> Option<usize> {
        debug_assert!(length % SUPER_PAGE_SIZE == 0 && length != 0);
        let need = length >> SUPER_PAGE_SHIFT;

        let mut guard = self.pool_slot(handle).lock();
        let pool = match guard.as_mut() {
            Some(pool) => pool,
            None => invalid_pool_handle(),
        };

        if let Some(requested) = requested_address {
            if requested % SUPER_PAGE_SIZE == 0 && requested >= pool.base {
                let start = (requested - pool.base) >> SUPER_PAGE_SHIFT;
                if pool.try_reserve_chunk(start, need) {
                    return Some(requested);
                }
            }
        }

        pool.find_chunk(need)
            .map(|start| pool.base + (start << SUPER_PAGE_SHIFT))
    }

    /// Returns a chunk to the pool and best-effort decommits its physical
    /// pages. The address space stays reserved by the pool's owner.
    pub fn unreserve_and_decommit(&self, handle: PoolHandle, address: usize, length: usize) {
        self.unreserve(handle, address, length);
        // Tolerates ranges the caller never mapped (pure bookkeeping pools).
        let _ = page::try_decommit_system_pages(address, length);
    }

    /// Bookkeeping-only release, for callers that manage physical pages
    /// themselves.
    pub fn unreserve(&self, handle: PoolHandle, address: usize, length: usize) {
        debug_assert!(address % SUPER_PAGE_SIZE == 0);
        debug_assert!(length % SUPER_PAGE_SIZE == 0 && length != 0);

        let mut guard = self.pool_slot(handle).lock();
        let pool = match guard.as_mut() {
            Some(pool) => pool,
            None => invalid_pool_handle(),
        };
        debug_assert!(address >= pool.base);
        let start = (address - pool.base) >> SUPER_PAGE_SHIFT;
        pool.free_chunk(start, length >> SUPER_PAGE_SHIFT);
    }

    /// True when `address` falls inside the registered pool's range,
    /// reserved or not.
    pub fn is_in_pool(&self, handle: PoolHandle, address: usize) -> bool {
        let guard = self.pool_slot(handle).lock();
        match guard.as_ref() {
            Some(pool) => {
                address >= pool.base
                    && address < pool.base + (pool.total_bits << SUPER_PAGE_SHIFT)
            }
            None => false,
        }
    }

    pub fn reset_for_testing(&self) {
        for slot in &self.pools {
            *slot.lock() = None;
        }
    }

    fn pool_slot(&self, handle: PoolHandle) -> &Mutex<Option<Pool>> {
        if handle == 0 || handle as usize > NUM_POOLS {
            invalid_pool_handle();
        }
        &self.pools[handle as usize - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4200_0000;

    #[test]
    fn one_super_page_pool() {
        let manager = AddressPoolManager::new_for_testing();
        let pool = manager.add(BASE, SUPER_PAGE_SIZE).unwrap();

        assert_eq!(manager.reserve(pool, None, SUPER_PAGE_SIZE), Some(BASE));
        assert_eq!(manager.reserve(pool, None, SUPER_PAGE_SIZE), None);
        manager.unreserve(pool, BASE, SUPER_PAGE_SIZE);
        assert_eq!(manager.reserve(pool, None, SUPER_PAGE_SIZE), Some(BASE));
    }

    #[test]
    fn sequential_fill_and_exhaustion() {
        let manager = AddressPoolManager::new_for_testing();
        const PAGE_COUNT: usize = 8192;
        let pool = manager.add(BASE, PAGE_COUNT * SUPER_PAGE_SIZE).unwrap();

        for i in 0..PAGE_COUNT {
            assert_eq!(
                manager.reserve(pool, None, SUPER_PAGE_SIZE),
                Some(BASE + i * SUPER_PAGE_SIZE)
            );
        }
        assert_eq!(manager.reserve(pool, None, SUPER_PAGE_SIZE), None);
    }

    #[test]
    fn fragmented_pool_rejects_wide_chunks() {
        let manager = AddressPoolManager::new_for_testing();
        const PAGE_COUNT: usize = 256;
        let pool = manager.add(BASE, PAGE_COUNT * SUPER_PAGE_SIZE).unwrap();

        let mut addrs = Vec::new();
        for i in 0..PAGE_COUNT {
            let addr = manager.reserve(pool, None, SUPER_PAGE_SIZE).unwrap();
            assert_eq!(addr, BASE + i * SUPER_PAGE_SIZE);
            addrs.push(addr);
        }
        // Free every odd super page: all gaps are one page wide.
        for addr in addrs.iter().skip(1).step_by(2) {
            manager.unreserve(pool, *addr, SUPER_PAGE_SIZE);
        }
        assert_eq!(manager.reserve(pool, None, 2 * SUPER_PAGE_SIZE), None);

        // Freeing one even neighbor opens the smallest two-wide gap.
        manager.unreserve(pool, addrs[2], SUPER_PAGE_SIZE);
        assert_eq!(
            manager.reserve(pool, None, 2 * SUPER_PAGE_SIZE),
            Some(addrs[1])
        );

        // The remaining odd holes still serve single pages, first-fit.
        assert_eq!(
            manager.reserve(pool, None, SUPER_PAGE_SIZE),
            Some(addrs[3])
        );
    }

    #[test]
    fn irregular_pattern_coalesces() {
        let manager = AddressPoolManager::new_for_testing();
        const PAGE_COUNT: usize = 8192;
        let pool = manager.add(BASE, PAGE_COUNT * SUPER_PAGE_SIZE).unwrap();

        let sp = SUPER_PAGE_SIZE;
        let a1 = manager.reserve(pool, None, sp).unwrap();
        assert_eq!(a1, BASE);
        let a2 = manager.reserve(pool, None, 2 * sp).unwrap();
        assert_eq!(a2, BASE + sp);
        let a3 = manager.reserve(pool, None, 3 * sp).unwrap();
        assert_eq!(a3, BASE + 3 * sp);
        let a4 = manager.reserve(pool, None, 4 * sp).unwrap();
        assert_eq!(a4, BASE + 6 * sp);
        let a5 = manager.reserve(pool, None, 5 * sp).unwrap();
        assert_eq!(a5, BASE + 10 * sp);

        manager.unreserve(pool, a4, 4 * sp);
        let a6 = manager.reserve(pool, None, 6 * sp).unwrap();
        assert_eq!(a6, BASE + 15 * sp);

        manager.unreserve(pool, a5, 5 * sp);
        // The freed 4-wide and 5-wide runs coalesce with the hole at 6.
        let a7 = manager.reserve(pool, None, 9 * sp).unwrap();
        assert_eq!(a7, BASE + 6 * sp);

        manager.unreserve(pool, a6, 6 * sp);
        manager.unreserve(pool, a7, 9 * sp);
        // Everything from offset 6 through 20 is free again.
        let a8 = manager.reserve(pool, None, 15 * sp).unwrap();
        assert_eq!(a8, BASE + 6 * sp);
    }

    #[test]
    fn requested_address_honored_when_free() {
        let manager = AddressPoolManager::new_for_testing();
        let pool = manager.add(BASE, 64 * SUPER_PAGE_SIZE).unwrap();

        let wanted = BASE + 17 * SUPER_PAGE_SIZE;
        assert_eq!(
            manager.reserve(pool, Some(wanted), 2 * SUPER_PAGE_SIZE),
            Some(wanted)
        );
        // The claimed run is unavailable to later requests.
        for _ in 0..17 {
            manager.reserve(pool, None, SUPER_PAGE_SIZE).unwrap();
        }
        assert_eq!(
            manager.reserve(pool, None, SUPER_PAGE_SIZE),
            Some(BASE + 19 * SUPER_PAGE_SIZE)
        );
    }

    #[test]
    #[should_panic(expected = "maximum pool size")]
    fn oversized_pool_crashes() {
        let manager = AddressPoolManager::new_for_testing();
        let _ = manager.add(BASE, MAX_POOL_SIZE + SUPER_PAGE_SIZE);
    }
}
