// # Quarantine Bitmaps
//
// Each super page reserves two bitmap partition pages; bit `i` covers the
// slot granule at offset `i * 16`. The pair's roles alternate with the
// scan epoch: mutators stamp freed slots into the instance selected by
// `epoch & 1`, the scanner consumes the other one. The swap is just the
// epoch increment, so mutators never contend with the scanner on the same
// words.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::{
    MIN_SLOT_ALIGNMENT, QUARANTINE_BITMAP_SIZE, SUPER_PAGE_BITMAP_OFFSET,
    SUPER_PAGE_OFFSET_MASK,
};
use crate::page::{self, PageAccess};
use crate::slot_span::super_page_base_of;

const WORD_BITS: usize = usize::BITS as usize;
const WORDS_PER_BITMAP: usize = QUARANTINE_BITMAP_SIZE / core::mem::size_of::<usize>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapRole {
    Mutator,
    Scanner,
}

/// A view over one committed bitmap instance of one super page.
#[derive(Clone, Copy)]
pub struct QuarantineBitmap {
    words: *const AtomicUsize,
    super_page: usize,
}

impl QuarantineBitmap {
    /// # Safety
    /// The super page's bitmap region must be committed (quarantine
    /// enabled on the owning root).
    pub unsafe fn get(super_page: usize, epoch: usize, role: BitmapRole) -> QuarantineBitmap {
        let instance = match role {
            BitmapRole::Mutator => epoch & 1,
            BitmapRole::Scanner => (epoch + 1) & 1,
        };
        QuarantineBitmap {
            words: (super_page + SUPER_PAGE_BITMAP_OFFSET + instance * QUARANTINE_BITMAP_SIZE)
                as *const AtomicUsize,
            super_page,
        }
    }

    #[inline]
    fn locate(&self, address: usize) -> (&AtomicUsize, usize) {
        debug_assert_eq!(super_page_base_of(address), self.super_page);
        let bit = (address & SUPER_PAGE_OFFSET_MASK) / MIN_SLOT_ALIGNMENT;
        (unsafe { &*self.words.add(bit / WORD_BITS) }, bit % WORD_BITS)
    }

    /// Sets the bit; returns whether it was already set (the double-free
    /// signal).
    #[inline]
    pub fn set_bit(&self, address: usize) -> bool {
        let (word, bit) = self.locate(address);
        let previous = word.fetch_or(1 << bit, Ordering::AcqRel);
        previous & (1 << bit) != 0
    }

    #[inline]
    pub fn check_bit(&self, address: usize) -> bool {
        let (word, bit) = self.locate(address);
        word.load(Ordering::Acquire) & (1 << bit) != 0
    }

    #[inline]
    pub fn clear_bit(&self, address: usize) {
        let (word, bit) = self.locate(address);
        word.fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    /// Invokes `visitor` with the address of every set bit.
    pub fn iterate(&self, mut visitor: impl FnMut(usize)) {
        for word_index in 0..WORDS_PER_BITMAP {
            let mut word = unsafe { &*self.words.add(word_index) }.load(Ordering::Acquire);
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                let offset = (word_index * WORD_BITS + bit) * MIN_SLOT_ALIGNMENT;
                visitor(self.super_page + offset);
            }
        }
    }

    pub fn clear(&self) {
        for word_index in 0..WORDS_PER_BITMAP {
            unsafe { &*self.words.add(word_index) }.store(0, Ordering::Release);
        }
    }
}

/// Commits (read-write) both quarantine bitmap instances of a super page;
/// returns the committed byte count for the root's accounting. Freshly
/// committed pages read as zero.
pub fn commit_quarantine_bitmaps(super_page: usize) -> usize {
    let ok = page::recommit_system_pages(
        super_page + SUPER_PAGE_BITMAP_OFFSET,
        2 * QUARANTINE_BITMAP_SIZE,
        PageAccess::ReadWrite,
    );
    debug_assert!(ok);
    2 * QUARANTINE_BITMAP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SUPER_PAGE_PAYLOAD_OFFSET, SUPER_PAGE_SIZE};

    fn scratch_super_page() -> usize {
        page::alloc_pages(
            None,
            SUPER_PAGE_SIZE,
            SUPER_PAGE_SIZE,
            PageAccess::ReadWrite,
            0,
        )
        .expect("scratch super page")
    }

    #[test]
    fn set_reports_prior_state_and_check_reads_it() {
        let super_page = scratch_super_page();
        let address = super_page + SUPER_PAGE_PAYLOAD_OFFSET + 3 * MIN_SLOT_ALIGNMENT;

        let bitmap = unsafe { QuarantineBitmap::get(super_page, 0, BitmapRole::Mutator) };
        assert!(!bitmap.check_bit(address));
        assert!(!bitmap.set_bit(address));
        assert!(bitmap.check_bit(address));
        // The double-free signal: the bit was already set.
        assert!(bitmap.set_bit(address));

        bitmap.clear_bit(address);
        assert!(!bitmap.check_bit(address));
        page::free_pages(super_page, SUPER_PAGE_SIZE);
    }

    #[test]
    fn roles_swap_with_the_epoch_parity() {
        let super_page = scratch_super_page();
        let address = super_page + SUPER_PAGE_PAYLOAD_OFFSET;

        let mutator_epoch0 =
            unsafe { QuarantineBitmap::get(super_page, 0, BitmapRole::Mutator) };
        mutator_epoch0.set_bit(address);

        // After the epoch advances, the same instance is the scanner's.
        let scanner_epoch1 =
            unsafe { QuarantineBitmap::get(super_page, 1, BitmapRole::Scanner) };
        assert!(scanner_epoch1.check_bit(address));
        // And the new mutator instance starts clean.
        let mutator_epoch1 =
            unsafe { QuarantineBitmap::get(super_page, 1, BitmapRole::Mutator) };
        assert!(!mutator_epoch1.check_bit(address));
        page::free_pages(super_page, SUPER_PAGE_SIZE);
    }

    #[test]
    fn iterate_visits_every_set_bit_in_order() {
        let super_page = scratch_super_page();
        let bitmap = unsafe { QuarantineBitmap::get(super_page, 0, BitmapRole::Scanner) };

        let addresses = [
            super_page + SUPER_PAGE_PAYLOAD_OFFSET,
            super_page + SUPER_PAGE_PAYLOAD_OFFSET + 64 * MIN_SLOT_ALIGNMENT,
            super_page + SUPER_PAGE_SIZE / 2,
        ];
        for &address in &addresses {
            bitmap.set_bit(address);
        }

        let mut visited = Vec::new();
        bitmap.iterate(|address| visited.push(address));
        assert_eq!(visited, addresses);

        bitmap.clear();
        let mut visited = Vec::new();
        bitmap.iterate(|address| visited.push(address));
        assert!(visited.is_empty());
        page::free_pages(super_page, SUPER_PAGE_SIZE);
    }
}
