// # BackupRefPtr Front-End Operations
//
// The four operations the smart-pointer layer consumes. They resolve an
// arbitrary in-object address to its slot, then drive the per-slot ref
// count. In return the core guarantees: the count sits at a fixed offset
// inside the slot, `free` of a referenced slot retains it in a
// pending-release state, and the last reference release performs the
// physical free.

use crate::address::cage;
use crate::build_config;
use crate::constants::REF_COUNT_SIZE;
use crate::slot_span::{
    slot_span_from_ptr, slot_span_start, super_page_base_of, super_page_header,
};

use super::ref_count::ref_count_ptr;
use super::PartitionRoot;

/// Classification of a pointer-arithmetic result relative to its
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrPosition {
    InRange,
    /// One past the end is legal to form but not to dereference.
    OnePastEnd,
    OutOfBounds,
}

struct SlotInfo {
    root: &'static PartitionRoot,
    slot_start: usize,
    user_start: usize,
    user_size: usize,
}

/// # Safety
/// `address` must point into (or one past) a live BRP-pool allocation.
unsafe fn resolve(address: usize) -> SlotInfo {
    if build_config::ENABLE_BACKUP_REF_PTR_SLOW_CHECKS {
        assert!(
            cage::is_in_brp_pool(address),
            "BackupRefPtr operation on a non-BRP-pool address"
        );
    }
    let super_page = super_page_base_of(address);
    let header = &*super_page_header(super_page);
    let root = &*header.root;
    debug_assert!(root.use_ref_count);

    let span = slot_span_from_ptr(address);
    let span_start = slot_span_start(span);
    let slot_size = (*span).slot_size();
    let offset_in_span = address - span_start;
    let slot_start = span_start + (offset_in_span / slot_size) * slot_size;
    let utilized = (*span).utilized_slot_size();
    SlotInfo {
        root,
        slot_start,
        user_start: slot_start + root.extras_offset(),
        user_size: utilized - root.extras_total(),
    }
}

/// Computes the slot start for an in-object pointer in the BRP pool.
///
/// # Safety
/// As `resolve`.
pub unsafe fn get_slot_start_in_brp_pool(address: usize) -> usize {
    resolve(address).slot_start
}

/// Takes a protective reference on the slot containing `address`.
///
/// # Safety
/// As `resolve`.
pub unsafe fn acquire_internal(address: usize) {
    let info = resolve(address);
    let utilized = info.user_size + info.root.extras_total();
    ref_count_ptr(info.slot_start, utilized).acquire();
}

/// Drops a protective reference; physically frees the slot when this was
/// the last reference to an already-freed allocation.
///
/// # Safety
/// As `resolve`; the caller must have a matching `acquire_internal`.
pub unsafe fn release_internal(address: usize) {
    let info = resolve(address);
    let utilized = info.user_size + info.root.extras_total();
    if ref_count_ptr(info.slot_start, utilized).release() {
        free_for_ref_counting(info.root, info.slot_start);
    }
}

/// Reads the allocation's alive bit.
///
/// # Safety
/// As `resolve`.
pub unsafe fn is_pointee_alive(address: usize) -> bool {
    let info = resolve(address);
    let utilized = info.user_size + info.root.extras_total();
    ref_count_ptr(info.slot_start, utilized).is_alive()
}

/// Classifies `address + delta` against the allocation's user region.
///
/// # Safety
/// As `resolve` for `address`; `delta` may be anything.
pub unsafe fn is_valid_delta(address: usize, delta: isize) -> PtrPosition {
    let info = resolve(address);
    let target = address.wrapping_add_signed(delta);
    let user_end = info.user_start + info.user_size;
    if (info.user_start..user_end).contains(&target) {
        PtrPosition::InRange
    } else if target == user_end {
        PtrPosition::OnePastEnd
    } else {
        PtrPosition::OutOfBounds
    }
}

/// Physically frees a slot whose logical free was deferred by outstanding
/// references. Idempotent with respect to `free`: the allocator's release
/// already happened, this completes it exactly once.
///
/// # Safety
/// `slot_start` must be a pending-release slot of `root`.
pub(crate) unsafe fn free_for_ref_counting(root: &PartitionRoot, slot_start: usize) {
    let span = slot_span_from_ptr(slot_start);
    let _guard = root.lock.lock();
    let inner = root.inner_locked();
    root.raw_free_locked(inner, slot_start, span);
}

/// Size of the in-slot ref-count buffer, part of the public contract.
pub const IN_SLOT_REF_COUNT_BUFFER_SIZE: usize = REF_COUNT_SIZE;
