// # Reservation Offset Table
//
// One u16 entry per super page of the cage, stored in the committed tail
// super page of the BRP pool. An entry is either the sentinel ("not part of
// a direct-map reservation" — the state of normal-bucket super pages and of
// untouched address space) or the distance, in super pages, back to the
// reservation start of the direct mapping that covers it:
//
// ```text
// |<----- direct-map reservation (3 super pages) ----->|
// +----------------+----------------+----------------+
// |   SuperPage 0  |   SuperPage 1  |   SuperPage 2  |
// +----------------+----------------+----------------+
//        0                 1                 2          <- table entries
// ```
//
// So for any address Z inside the cage,
// `(Z >> shift) - entry(Z) << shift` is the reservation start. Entries are
// read concurrently by smart-pointer checks and the scanner; all accesses
// are atomic.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::constants::{NOT_IN_DIRECT_MAP, SUPER_PAGE_OFFSET_MASK, SUPER_PAGE_SHIFT};

use super::cage;

/// The table entry covering `address`, or `None` when the address is
/// outside the cage's pools (the configurable pool is intentionally not
/// covered: aligned-alloc partitions carry no extras and no smart-pointer
/// contract).
#[inline]
fn entry_for(address: usize) -> Option<&'static AtomicU16> {
    let base = cage::pools_base();
    let table = cage::reservation_offset_table_base();
    if base == 0 || address < base || address - base >= cage::CAGE_POOLS_SIZE {
        return None;
    }
    let index = (address - base) >> SUPER_PAGE_SHIFT;
    // The table lives in always-committed cage memory and is never moved.
    Some(unsafe { &*(table as *const AtomicU16).add(index) })
}

/// Records that the super page holding `address` lies `offset` super pages
/// past its reservation start.
pub fn set_offset(address: usize, offset: u16) {
    debug_assert_ne!(offset, NOT_IN_DIRECT_MAP);
    if let Some(entry) = entry_for(address) {
        entry.store(offset, Ordering::Release);
    }
}

/// Restores the sentinel when a direct-map reservation is released.
pub fn clear_offsets(reservation_start: usize, reservation_size: usize) {
    let mut current = reservation_start;
    let end = reservation_start + reservation_size;
    while current < end {
        if let Some(entry) = entry_for(current) {
            entry.store(NOT_IN_DIRECT_MAP, Ordering::Release);
        }
        current += 1 << SUPER_PAGE_SHIFT;
    }
}

#[inline]
pub fn reservation_offset(address: usize) -> u16 {
    match entry_for(address) {
        Some(entry) => entry.load(Ordering::Acquire),
        None => NOT_IN_DIRECT_MAP,
    }
}

/// For a pointer into a direct-mapped allocation, the allocation's first
/// super page; 0 for normal-bucket or off-cage pointers.
#[inline]
pub fn get_direct_map_reservation_start(address: usize) -> usize {
    let offset = reservation_offset(address);
    if offset == NOT_IN_DIRECT_MAP {
        return 0;
    }
    let start = (address & !SUPER_PAGE_OFFSET_MASK) - ((offset as usize) << SUPER_PAGE_SHIFT);
    debug_assert_eq!(reservation_offset(start), 0);
    start
}

/// True iff `address` begins a reservation: a normal-bucket super page, or
/// the head super page of a direct mapping. Only meaningful for addresses
/// the caller owns.
#[inline]
pub fn is_reservation_start(address: usize) -> bool {
    if address & SUPER_PAGE_OFFSET_MASK != 0 {
        return false;
    }
    let offset = reservation_offset(address);
    offset == 0 || offset == NOT_IN_DIRECT_MAP
}

/// True iff `address` belongs to a normal-bucket super page (given that the
/// caller owns an allocation there).
#[inline]
pub fn is_managed_by_normal_buckets(address: usize) -> bool {
    cage::is_in_cage_pools(address) && reservation_offset(address) == NOT_IN_DIRECT_MAP
}

/// True iff `address` belongs to a direct-map reservation.
#[inline]
pub fn is_managed_by_direct_map(address: usize) -> bool {
    reservation_offset(address) != NOT_IN_DIRECT_MAP
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SUPER_PAGE_SIZE;

    #[test]
    fn untouched_cage_addresses_read_the_sentinel() {
        cage::init();
        let base = cage::pools_base();
        assert_eq!(reservation_offset(base), NOT_IN_DIRECT_MAP);
        assert!(is_reservation_start(base));
        assert!(!is_reservation_start(base + 123));
        assert!(is_managed_by_normal_buckets(base));
        assert!(!is_managed_by_direct_map(base));
    }

    #[test]
    fn off_cage_addresses_resolve_to_nothing() {
        cage::init();
        assert_eq!(get_direct_map_reservation_start(0x1234), 0);
        assert!(!is_managed_by_direct_map(0x1234));
        assert!(!is_managed_by_normal_buckets(0x1234));
    }

    #[test]
    fn direct_map_offsets_round_trip() {
        cage::init();
        // Use a scratch range far inside the non-BRP pool; nothing else
        // allocates at a fixed offset, so pick the pool's top quarter.
        let base = cage::pools_base();
        let reservation = base + (3 << 30) - 8 * SUPER_PAGE_SIZE;
        for i in 0..3u16 {
            set_offset(reservation + (i as usize) * SUPER_PAGE_SIZE, i);
        }

        let mid = reservation + 2 * SUPER_PAGE_SIZE + 4096;
        assert!(is_managed_by_direct_map(mid));
        assert_eq!(get_direct_map_reservation_start(mid), reservation);
        assert!(is_reservation_start(reservation));
        assert!(!is_reservation_start(reservation + SUPER_PAGE_SIZE));

        clear_offsets(reservation, 3 * SUPER_PAGE_SIZE);
        assert!(!is_managed_by_direct_map(mid));
        assert_eq!(get_direct_map_reservation_start(mid), 0);
    }
}
