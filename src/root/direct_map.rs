// # Direct-Mapped Allocations
//
// Requests above the largest bucket get a dedicated reservation from the
// root's pool:
//
// ```text
// reservation (super-page aligned, super-page-size granular)
// | guard 4K | metadata 12K | slot ............ | tail slack | guard PP |
//            ^ committed     ^ committed, system-page rounded
// ```
//
// The head super page's metadata region holds the usual header (so `free`
// resolves the owning root from the pointer alone), a span-head record
// carrying the raw size, and the `DirectMapExtent` linking the mapping into
// the root's reclaim list. Offset-table entries record each super page's
// distance from the reservation start so interior pointers resolve in O(1).

use crate::address::{offset_table, AddressPoolManager};
use crate::constants::*;
use crate::page::{self, PageAccess};
use crate::slot_span::{
    self, partition_page_meta, SuperPageKind, DIRECT_MAP_BUCKET,
};

use super::{PartitionRoot, RootInner, ALLOC_RETURN_NULL};

/// Where the extent record lives inside the head super page's metadata.
pub const DIRECT_MAP_EXTENT_OFFSET: usize = SUPER_PAGE_METADATA_OFFSET + 512;

#[repr(C)]
pub struct DirectMapExtent {
    pub next: *mut DirectMapExtent,
    pub prev: *mut DirectMapExtent,
    pub reservation_start: usize,
    pub reservation_size: usize,
    /// Currently committed slot bytes (system-page rounded raw size).
    pub committed_slot_bytes: usize,
    pub raw_size: usize,
}

/// System-page-rounded slot size for a direct-mapped request.
#[inline]
pub fn direct_map_slot_size(raw_size: usize) -> usize {
    align_up(raw_size, SYSTEM_PAGE_SIZE)
}

/// Total reservation for a direct-mapped request: front metadata partition
/// page + slot + trailing guard partition page, rounded to super pages.
#[inline]
pub fn direct_map_reservation_size(raw_size: usize) -> usize {
    align_up(
        PARTITION_PAGE_SIZE + direct_map_slot_size(raw_size) + PARTITION_PAGE_SIZE,
        SUPER_PAGE_SIZE,
    )
}

#[inline]
pub unsafe fn extent_of(reservation_start: usize) -> *mut DirectMapExtent {
    (reservation_start + DIRECT_MAP_EXTENT_OFFSET) as *mut DirectMapExtent
}

/// Reserves, commits, and links a direct-mapped slot. Returns
/// `(slot_start, utilized_slot_size)`.
///
/// # Safety
/// Caller holds the root lock and passes its inner state.
pub(super) unsafe fn alloc(
    root: &PartitionRoot,
    inner: &mut RootInner,
    flags: u32,
    raw_size: usize,
) -> Option<(usize, usize)> {
    let slot_size = direct_map_slot_size(raw_size);
    let reservation_size = direct_map_reservation_size(raw_size);

    let reservation =
        match AddressPoolManager::instance().reserve(root.pool, None, reservation_size) {
            Some(address) => address,
            None => {
                if flags & ALLOC_RETURN_NULL != 0 {
                    return None;
                }
                crate::oom::partition_oom(reservation_size);
            }
        };

    let commit_ok = page::recommit_system_pages(
        reservation + SUPER_PAGE_METADATA_OFFSET,
        SUPER_PAGE_METADATA_SIZE,
        PageAccess::ReadWrite,
    ) && page::recommit_system_pages(
        reservation + PARTITION_PAGE_SIZE,
        slot_size,
        PageAccess::ReadWrite,
    );
    if !commit_ok {
        AddressPoolManager::instance().unreserve_and_decommit(
            root.pool,
            reservation,
            reservation_size,
        );
        if flags & ALLOC_RETURN_NULL != 0 {
            return None;
        }
        crate::oom::partition_oom(slot_size);
    }

    slot_span::init_super_page_metadata(
        reservation,
        root as *const PartitionRoot,
        SuperPageKind::DirectMap,
        false,
    );
    // The slot begins at partition page 1; its span-head record carries the
    // utilized (system-page-rounded) size so the shared free/realloc paths
    // resolve extras uniformly and `get_usable_size` matches `actual_size`.
    let meta = partition_page_meta(reservation, 1);
    (*meta).bucket_index = DIRECT_MAP_BUCKET;
    (*meta).raw_size = slot_size;
    (*meta).num_allocated_slots = 1;

    let extent = extent_of(reservation);
    extent.write(DirectMapExtent {
        next: inner.direct_map_list,
        prev: core::ptr::null_mut(),
        reservation_start: reservation,
        reservation_size,
        committed_slot_bytes: slot_size,
        raw_size,
    });
    if !inner.direct_map_list.is_null() {
        (*inner.direct_map_list).prev = extent;
    }
    inner.direct_map_list = extent;

    let mut offset = 0u16;
    let mut current = reservation;
    while current < reservation + reservation_size {
        offset_table::set_offset(current, offset);
        offset += 1;
        current += SUPER_PAGE_SIZE;
    }

    inner.total_size_of_direct_mapped_pages += reservation_size;
    inner.increase_committed(SUPER_PAGE_METADATA_SIZE + slot_size);

    Some((reservation + PARTITION_PAGE_SIZE, slot_size))
}

/// Unlinks and releases a direct mapping. `slot_start` is the slot base
/// (reservation + one partition page).
///
/// # Safety
/// Caller holds the root lock; `slot_start` must be a live direct-mapped
/// slot of this root.
pub(super) unsafe fn free(root: &PartitionRoot, inner: &mut RootInner, slot_start: usize) {
    let reservation = slot_span::super_page_base_of(slot_start);
    debug_assert_eq!(slot_start, reservation + PARTITION_PAGE_SIZE);
    let extent = extent_of(reservation);

    if !(*extent).prev.is_null() {
        (*(*extent).prev).next = (*extent).next;
    } else {
        debug_assert_eq!(inner.direct_map_list, extent);
        inner.direct_map_list = (*extent).next;
    }
    if !(*extent).next.is_null() {
        (*(*extent).next).prev = (*extent).prev;
    }

    let reservation_size = (*extent).reservation_size;
    inner.total_size_of_direct_mapped_pages -= reservation_size;
    inner.decrease_committed(SUPER_PAGE_METADATA_SIZE + (*extent).committed_slot_bytes);

    offset_table::clear_offsets(reservation, reservation_size);
    AddressPoolManager::instance().unreserve_and_decommit(
        root.pool,
        reservation,
        reservation_size,
    );
}

/// Grows or shrinks the mapping in place when the new size fits the
/// existing reservation. Returns false when the caller must fall back to
/// alloc-copy-free.
///
/// # Safety
/// Caller holds the root lock; `slot_start` as for `free`.
pub(super) unsafe fn realloc_in_place(
    _root: &PartitionRoot,
    inner: &mut RootInner,
    slot_start: usize,
    new_raw_size: usize,
) -> bool {
    let reservation = slot_span::super_page_base_of(slot_start);
    let extent = extent_of(reservation);
    let capacity = (*extent).reservation_size - 2 * PARTITION_PAGE_SIZE;
    let new_slot_size = direct_map_slot_size(new_raw_size);
    if new_slot_size > capacity {
        return false;
    }

    let current = (*extent).committed_slot_bytes;
    if new_slot_size > current {
        if !page::recommit_system_pages(
            slot_start + current,
            new_slot_size - current,
            PageAccess::ReadWrite,
        ) {
            return false;
        }
        inner.increase_committed(new_slot_size - current);
    } else if new_slot_size < current {
        page::decommit_system_pages(slot_start + new_slot_size, current - new_slot_size);
        inner.decrease_committed(current - new_slot_size);
    }

    (*extent).committed_slot_bytes = new_slot_size;
    (*extent).raw_size = new_raw_size;
    (*partition_page_meta(reservation, 1)).raw_size = new_slot_size;
    true
}
