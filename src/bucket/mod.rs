// # Buckets
//
// One `Bucket` per size class, owning the slot-span lists. A span is in
// exactly one of four logical states: active (has capacity), full, empty
// (committed but no live slot), or decommitted. Transitions are lazy the
// way the hot path likes them: frees never unlink a span from the active
// list; the next allocation's scan (`set_new_active_slot_span`) prunes
// non-active spans into their proper lists. All of this runs under the
// owning root's lock.

pub mod sizes;

use crate::slot_span::PartitionPageMeta;

#[derive(Clone, Copy)]
pub struct Bucket {
    pub active_head: *mut PartitionPageMeta,
    pub empty_head: *mut PartitionPageMeta,
    pub decommitted_head: *mut PartitionPageMeta,
    pub num_full_slot_spans: usize,
    pub slot_size: u32,
    pub index: u16,
}

impl Bucket {
    pub const fn invalid() -> Bucket {
        Bucket {
            active_head: core::ptr::null_mut(),
            empty_head: core::ptr::null_mut(),
            decommitted_head: core::ptr::null_mut(),
            num_full_slot_spans: 0,
            slot_size: 0,
            index: 0,
        }
    }

    pub fn init(index: usize) -> Bucket {
        Bucket {
            active_head: core::ptr::null_mut(),
            empty_head: core::ptr::null_mut(),
            decommitted_head: core::ptr::null_mut(),
            num_full_slot_spans: 0,
            slot_size: sizes::bucket_slot_size(index) as u32,
            index: index as u16,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.slot_size != 0
    }

    #[inline]
    pub fn bytes_per_span(&self) -> usize {
        sizes::bucket_bytes_per_span(self.index as usize)
    }

    #[inline]
    pub fn slots_per_span(&self) -> usize {
        sizes::bucket_slots_per_span(self.index as usize)
    }

    #[inline]
    pub fn partition_pages_per_span(&self) -> usize {
        sizes::bucket_partition_pages_per_span(self.index as usize)
    }

    /// Walks the active list until a span with capacity surfaces at the
    /// head, filing everything else where it belongs. Returns false when
    /// the list is exhausted (the caller then falls back to the empty /
    /// decommitted lists or carves a new span).
    ///
    /// # Safety
    /// Must run under the owning root's lock; list pointers must be valid.
    pub unsafe fn set_new_active_slot_span(&mut self) -> bool {
        let mut span = self.active_head;
        while !span.is_null() {
            let next = (*span).next_span;
            if (*span).is_active() {
                self.active_head = span;
                return true;
            }
            (*span).set_in_active_list(false);
            if (*span).is_decommitted() {
                (*span).next_span = self.decommitted_head;
                self.decommitted_head = span;
            } else if (*span).is_empty() {
                (*span).next_span = self.empty_head;
                self.empty_head = span;
            } else {
                debug_assert!((*span).is_full());
                (*span).next_span = core::ptr::null_mut();
                self.num_full_slot_spans += 1;
            }
            span = next;
        }
        self.active_head = core::ptr::null_mut();
        false
    }

    /// Re-links a span (popped from the empty or decommitted list, or
    /// freshly carved) as the new active head.
    ///
    /// # Safety
    /// As `set_new_active_slot_span`.
    pub unsafe fn push_active(&mut self, span: *mut PartitionPageMeta) {
        debug_assert!(!(*span).in_active_list());
        (*span).next_span = self.active_head;
        (*span).set_in_active_list(true);
        self.active_head = span;
    }
}
