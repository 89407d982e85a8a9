// Per-super-page used/free slot bitmap, the third reserved bitmap page. A
// bit set means "this slot is on a freelist". Pop paths verify the bit
// before handing a slot out, which catches freelist corruption the codec's
// shadow check cannot see (a forged pointer to a never-freed slot decodes
// cleanly but fails here). Maintained only when the build flag is on.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::build_config;
use crate::constants::{
    MIN_SLOT_ALIGNMENT, PARTITION_PAGE_SIZE, SUPER_PAGE_BITMAP_OFFSET,
    SUPER_PAGE_OFFSET_MASK,
};
use crate::error::freelist_corruption_detected;
use crate::slot_span::super_page_base_of;

const WORD_BITS: usize = usize::BITS as usize;

/// Byte offset of the freeslot bitmap page within a super page.
pub const FREESLOT_BITMAP_OFFSET: usize = SUPER_PAGE_BITMAP_OFFSET + 2 * PARTITION_PAGE_SIZE;

#[inline]
fn word_for(address: usize) -> (*const AtomicUsize, usize) {
    let super_page = super_page_base_of(address);
    let bit = (address & SUPER_PAGE_OFFSET_MASK) / MIN_SLOT_ALIGNMENT;
    let words = (super_page + FREESLOT_BITMAP_OFFSET) as *const AtomicUsize;
    (unsafe { words.add(bit / WORD_BITS) }, bit % WORD_BITS)
}

/// Marks `slot_start` free (freelist push).
///
/// # Safety
/// The super page's bitmap region must be committed and `slot_start` owned
/// by the caller.
#[inline]
pub unsafe fn mark_free(slot_start: usize) {
    if !build_config::USE_FREESLOT_BITMAP {
        return;
    }
    let (word, bit) = word_for(slot_start);
    (*word).fetch_or(1usize << bit, Ordering::Relaxed);
}

/// Marks `slot_start` used (freelist pop), crashing when the bitmap
/// disagrees that the slot was free.
///
/// # Safety
/// As `mark_free`.
#[inline]
pub unsafe fn mark_used_verify(slot_start: usize) {
    if !build_config::USE_FREESLOT_BITMAP {
        return;
    }
    let (word, bit) = word_for(slot_start);
    let previous = (*word).fetch_and(!(1usize << bit), Ordering::Relaxed);
    if previous & (1usize << bit) == 0 {
        freelist_corruption_detected();
    }
}

/// Unchecked clear, for slots reset wholesale (span decommit).
///
/// # Safety
/// As `mark_free`.
#[inline]
pub unsafe fn mark_used(slot_start: usize) {
    if !build_config::USE_FREESLOT_BITMAP {
        return;
    }
    let (word, bit) = word_for(slot_start);
    (*word).fetch_and(!(1usize << bit), Ordering::Relaxed);
}

/// # Safety
/// As `mark_free`.
#[inline]
pub unsafe fn is_marked_free(slot_start: usize) -> bool {
    if !build_config::USE_FREESLOT_BITMAP {
        return false;
    }
    let (word, bit) = word_for(slot_start);
    (*word).load(Ordering::Relaxed) & (1usize << bit) != 0
}
