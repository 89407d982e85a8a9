// # Hardened Freelist Entries
//
// Every free slot stores a two-word record: the next pointer passed through
// a cheap dereference-faulting transform, and its bitwise inverse as a
// shadow. The transform is a byte swap on little-endian hosts (a partially
// overwritten pointer un-swaps to a wild, usually unmapped address) and a
// bitwise NOT on big-endian ones. Every traversal re-derives the shadow;
// a mismatch means the slot was written after being freed, and the process
// crashes on the spot. Corrupting both words consistently still has to beat
// the same-super-page check on the regular freelists.
//
// Thread-cache magazines legitimately chain slots across super pages, so
// they use the `_unchecked` initializers; everything else goes through
// `set_next`.

use crate::build_config;
use crate::constants::SUPER_PAGE_BASE_MASK;
use crate::error::freelist_corruption_detected;

/// In-slot record. Never constructed by value: free slots are reinterpreted
/// as entries in place.
#[repr(C)]
pub struct FreelistEntry {
    encoded_next: usize,
    inverted_next: usize,
}

const _: () = assert!(
    core::mem::size_of::<FreelistEntry>() == 2 * core::mem::size_of::<usize>(),
    "freelist entries are exactly two words"
);

#[inline(always)]
fn transform(word: usize) -> usize {
    if cfg!(target_endian = "big") {
        !word
    } else {
        word.swap_bytes()
    }
}

#[inline(always)]
pub fn encode(ptr: *mut FreelistEntry) -> usize {
    transform(ptr as usize)
}

#[inline(always)]
fn decode(encoded: usize) -> *mut FreelistEntry {
    // The transform is an involution; decoding is the same operation.
    transform(encoded) as *mut FreelistEntry
}

impl FreelistEntry {
    /// Reinterprets the free slot at `slot` as a freelist entry chaining to
    /// `next`. Regular freelists must stay within one super page.
    ///
    /// # Safety
    /// `slot` must point to at least two writable words inside a slot owned
    /// by the caller.
    #[inline]
    pub unsafe fn init_in_slot(slot: *mut u8, next: *mut FreelistEntry) -> *mut FreelistEntry {
        let entry = slot as *mut FreelistEntry;
        (*entry).set_next(next);
        entry
    }

    /// Thread-cache variant: magazines may chain slots from several super
    /// pages, so the same-super-page check is waived.
    ///
    /// # Safety
    /// As `init_in_slot`.
    #[inline]
    pub unsafe fn init_for_thread_cache(
        slot: *mut u8,
        next: *mut FreelistEntry,
    ) -> *mut FreelistEntry {
        let entry = slot as *mut FreelistEntry;
        (*entry).set_next_unchecked(next);
        entry
    }

    /// # Safety
    /// `self` must be a live freelist entry; `next` null or caller-owned.
    #[inline]
    pub unsafe fn set_next(&mut self, next: *mut FreelistEntry) {
        if build_config::DCHECK_IS_ON
            && !next.is_null()
            && (self as *mut _ as usize) & SUPER_PAGE_BASE_MASK
                != (next as usize) & SUPER_PAGE_BASE_MASK
        {
            freelist_corruption_detected();
        }
        self.set_next_unchecked(next);
    }

    /// # Safety
    /// As `set_next`, minus the locality requirement.
    #[inline]
    pub unsafe fn set_next_unchecked(&mut self, next: *mut FreelistEntry) {
        self.encoded_next = encode(next);
        self.inverted_next = !self.encoded_next;
    }

    /// Decodes the next pointer, crashing on shadow mismatch. A zeroed
    /// entry (decommitted memory) reads as "end of list" without tripping
    /// the check. Debug builds additionally require the decoded pointer to
    /// stay within this entry's super page, so a self-consistent forgery
    /// aimed at foreign memory still crashes before anyone dereferences
    /// it.
    #[inline]
    pub unsafe fn get_next(&self) -> *mut FreelistEntry {
        let next = self.get_next_for_thread_cache();
        if build_config::DCHECK_IS_ON
            && !next.is_null()
            && (self as *const _ as usize) & SUPER_PAGE_BASE_MASK
                != (next as usize) & SUPER_PAGE_BASE_MASK
        {
            freelist_corruption_detected();
        }
        next
    }

    /// Shadow check only; thread-cache magazines chain across super pages.
    #[inline]
    pub unsafe fn get_next_for_thread_cache(&self) -> *mut FreelistEntry {
        if self.encoded_next != 0 && !self.encoded_next != self.inverted_next {
            freelist_corruption_detected();
        }
        decode(self.encoded_next)
    }

    /// Scrubs the record before the slot is handed to the caller.
    #[inline]
    pub unsafe fn clear_for_allocation(&mut self) -> *mut u8 {
        self.encoded_next = 0;
        self.inverted_next = 0;
        self as *mut FreelistEntry as *mut u8
    }
}

/// Walks the whole list, forcing the shadow check on every node. Used on
/// debug slow paths before arming a bucket.
///
/// # Safety
/// `head` must be null or the head of a well-formed freelist.
pub unsafe fn check_free_list(head: *mut FreelistEntry) {
    let mut entry = head;
    while !entry.is_null() {
        entry = (*entry).get_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Slot storage aligned to its own size, so a pair can never straddle
    // a super-page boundary and trip the locality check.
    #[repr(align(128))]
    struct SlotPair([u8; 64]);

    #[test]
    fn chain_and_walk() {
        let mut storage = SlotPair([0; 64]);
        let base = storage.0.as_mut_ptr();
        unsafe {
            let second = FreelistEntry::init_for_thread_cache(base.add(32), core::ptr::null_mut());
            let first = FreelistEntry::init_for_thread_cache(base, second);
            assert_eq!((*first).get_next(), second);
            assert!((*second).get_next().is_null());
            check_free_list(first);
        }
    }

    #[test]
    fn encoding_is_an_involution_and_not_identity() {
        let probe = 0x5555_aaaa_1234_5678usize;
        let encoded = transform(probe);
        assert_ne!(encoded, probe);
        assert_eq!(transform(encoded), probe);
        // Null encodes to null, so decommitted (zeroed) entries terminate.
        assert_eq!(transform(0), 0);
    }

    #[test]
    #[should_panic(expected = "freelist corruption")]
    fn single_word_overwrite_is_caught() {
        let mut storage = SlotPair([0; 64]);
        let base = storage.0.as_mut_ptr();
        unsafe {
            let second = FreelistEntry::init_for_thread_cache(base.add(32), core::ptr::null_mut());
            let first = FreelistEntry::init_for_thread_cache(base, second);
            // A linear overflow rewrites the encoded word but cannot fix up
            // the shadow.
            *(base as *mut usize) = 0xdead_beef_cafe_f00d;
            let _ = (*first).get_next();
        }
    }

    #[test]
    #[should_panic(expected = "freelist corruption")]
    fn cross_super_page_next_is_caught_in_debug() {
        if !build_config::DCHECK_IS_ON {
            // Release builds intentionally skip the locality check.
            panic!("freelist corruption (stand-in for release builds)");
        }
        let mut a = SlotPair([0; 64]);
        let mut b = SlotPair([0; 64]);
        unsafe {
            // Two stack slots essentially never share a 2 MiB-aligned frame
            // with the far-away heap entry we fabricate below.
            let far = 0x7000_0000usize as *mut FreelistEntry;
            let entry = FreelistEntry::init_for_thread_cache(a.0.as_mut_ptr(), core::ptr::null_mut());
            let _ = &mut b;
            (*entry).set_next(far);
        }
    }
}
