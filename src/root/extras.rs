// # Slot Extras
//
// Metadata the root wraps around user memory when the partition allows it:
//
// ```text
// slot_start
// | cookie | user data ... | [slack] | cookie | ref count | [unused] |
//                                              ^ utilized_slot_size ends here
// ```
//
// The trailing extras are positioned off the *utilized* slot size (the raw
// size when the span can store one, otherwise the full slot size), so their
// location is recoverable at free time without knowing the request size.

use crate::constants::{COOKIE_SIZE, REF_COUNT_SIZE};
use crate::error::cookie_corruption_detected;

use super::PartitionRoot;

/// The cookie pattern. Chosen to be an improbable heap fill value with no
/// valid pointer bytes.
const COOKIE_VALUE: [u8; COOKIE_SIZE] = [
    0x0d, 0xf0, 0xad, 0x8b, 0x0d, 0xf0, 0xad, 0x8b, 0x0d, 0xf0, 0xad, 0x8b, 0x0d, 0xf0,
    0xad, 0x8b,
];

impl PartitionRoot {
    /// Bytes added before the user region.
    #[inline]
    pub(crate) fn extras_offset(&self) -> usize {
        if self.use_cookies {
            COOKIE_SIZE
        } else {
            0
        }
    }

    /// Total extras bytes per slot.
    #[inline]
    pub(crate) fn extras_total(&self) -> usize {
        let mut total = 0;
        if self.use_cookies {
            total += 2 * COOKIE_SIZE;
        }
        if self.use_ref_count {
            total += REF_COUNT_SIZE;
        }
        total
    }

    /// Request size -> raw (slot-resident) size. Saturates so oversize
    /// requests fail the direct-map limit check rather than wrapping.
    #[inline]
    pub(crate) fn adjust_size_add(&self, size: usize) -> usize {
        size.saturating_add(self.extras_total())
    }
}

/// Offset of the trailing cookie within a slot of utilized size `utilized`.
#[inline]
fn trailing_cookie_offset(root: &PartitionRoot, utilized: usize) -> usize {
    let mut offset = utilized - COOKIE_SIZE;
    if root.use_ref_count {
        offset -= REF_COUNT_SIZE;
    }
    offset
}

/// Stamps both cookies.
///
/// # Safety
/// `slot_start..slot_start + utilized` must be caller-owned writable slot
/// memory; only call when the root uses cookies.
pub(crate) unsafe fn write_cookies(root: &PartitionRoot, slot_start: usize, utilized: usize) {
    debug_assert!(root.use_cookies);
    core::ptr::copy_nonoverlapping(
        COOKIE_VALUE.as_ptr(),
        slot_start as *mut u8,
        COOKIE_SIZE,
    );
    core::ptr::copy_nonoverlapping(
        COOKIE_VALUE.as_ptr(),
        (slot_start + trailing_cookie_offset(root, utilized)) as *mut u8,
        COOKIE_SIZE,
    );
}

/// Verifies both cookies, crashing on mismatch.
///
/// # Safety
/// As `write_cookies`.
pub(crate) unsafe fn check_cookies(root: &PartitionRoot, slot_start: usize, utilized: usize) {
    debug_assert!(root.use_cookies);
    let leading = core::slice::from_raw_parts(slot_start as *const u8, COOKIE_SIZE);
    let trailing = core::slice::from_raw_parts(
        (slot_start + trailing_cookie_offset(root, utilized)) as *const u8,
        COOKIE_SIZE,
    );
    if leading != COOKIE_VALUE || trailing != COOKIE_VALUE {
        cookie_corruption_detected();
    }
}
