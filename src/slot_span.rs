// # Super Page Layout and Slot Span Metadata
//
// Every super page is carved identically:
//
// ```text
// [ guard 4K | metadata 12K | 3 bitmap PPs | payload PPs 4..=126 | guard PP ]
// ```
//
// The metadata region holds one `SuperPageHeader` followed by a
// `PartitionPageMeta` record per partition page. The record for a slot
// span's first partition page carries the span state; records for the
// following pages just store their distance back to the head, so resolving
// any interior pointer to its span is two masks and one subtraction. The
// metadata lives inside the super page itself, which is what makes
// `free()` addressable from nothing but the pointer.

use crate::bucket::sizes;
use crate::constants::*;
use crate::freelist::FreelistEntry;
use crate::root::PartitionRoot;

/// Offset of the `PartitionPageMeta` array within the metadata region.
pub const PAGE_META_ARRAY_OFFSET: usize = 64;

/// Bucket index marking a direct-mapped pseudo-span.
pub const DIRECT_MAP_BUCKET: u16 = u16::MAX;

const FLAG_DECOMMITTED: u8 = 1 << 0;
const FLAG_IN_ACTIVE_LIST: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperPageKind {
    NormalBuckets = 1,
    DirectMap = 2,
}

/// Lives at the start of the metadata region of every super page.
#[repr(C)]
pub struct SuperPageHeader {
    pub root: *const PartitionRoot,
    /// Next super page base in the owning root's chain (0 terminates).
    pub next_super_page: usize,
    pub kind: SuperPageKind,
    pub scannable: bool,
}

const _: () = assert!(core::mem::size_of::<SuperPageHeader>() <= PAGE_META_ARRAY_OFFSET);

/// Metadata for one partition page. Only the first page of a slot span
/// carries live span state; trailing pages hold the back-offset.
#[repr(C)]
pub struct PartitionPageMeta {
    pub freelist_head: *mut FreelistEntry,
    /// Intrusive link for the bucket's active/empty/decommitted lists.
    pub next_span: *mut PartitionPageMeta,
    /// Requested size including extras; meaningful for single-slot spans
    /// and direct maps only.
    pub raw_size: usize,
    pub bucket_index: u16,
    pub num_allocated_slots: u16,
    pub num_unprovisioned_slots: u16,
    /// 0 for a span head; otherwise the distance (in partition pages) back
    /// to the head's record.
    pub slot_span_metadata_offset: u16,
    /// Position in the root's empty-span ring, or -1.
    pub empty_cache_index: i16,
    pub flags: u8,
}

const _: () = assert!(
    PAGE_META_ARRAY_OFFSET
        + PARTITION_PAGES_PER_SUPER_PAGE * core::mem::size_of::<PartitionPageMeta>()
        <= SUPER_PAGE_METADATA_SIZE,
    "partition page metadata must fit the metadata region"
);

impl PartitionPageMeta {
    #[inline]
    pub fn slot_size(&self) -> usize {
        debug_assert_ne!(self.bucket_index, DIRECT_MAP_BUCKET);
        sizes::bucket_slot_size(self.bucket_index as usize)
    }

    #[inline]
    pub fn total_slots(&self) -> usize {
        sizes::bucket_slots_per_span(self.bucket_index as usize)
    }

    #[inline]
    pub fn is_decommitted(&self) -> bool {
        self.flags & FLAG_DECOMMITTED != 0
    }

    #[inline]
    pub fn set_decommitted(&mut self, value: bool) {
        if value {
            self.flags |= FLAG_DECOMMITTED;
        } else {
            self.flags &= !FLAG_DECOMMITTED;
        }
    }

    /// Whether the span currently sits in its bucket's active list. Frees
    /// use this to re-link full spans that the allocation scan already
    /// unlinked, without double-linking ones it has not reached yet.
    #[inline]
    pub fn in_active_list(&self) -> bool {
        self.flags & FLAG_IN_ACTIVE_LIST != 0
    }

    #[inline]
    pub fn set_in_active_list(&mut self, value: bool) {
        if value {
            self.flags |= FLAG_IN_ACTIVE_LIST;
        } else {
            self.flags &= !FLAG_IN_ACTIVE_LIST;
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_allocated_slots == 0 && !self.is_decommitted()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_allocated_slots as usize == self.total_slots()
    }

    /// Has at least one free or unprovisioned slot.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.is_decommitted()
            && (!self.freelist_head.is_null() || self.num_unprovisioned_slots != 0)
    }

    /// The provisioned prefix of the span, in bytes: the region the scanner
    /// walks and the discard pass measures.
    #[inline]
    pub fn provisioned_bytes(&self) -> usize {
        (self.total_slots() - self.num_unprovisioned_slots as usize) * self.slot_size()
    }

    /// Slot bytes actually in use by one allocation: the raw size when the
    /// span can store one (single slot), otherwise the full slot size.
    #[inline]
    pub fn utilized_slot_size(&self) -> usize {
        if self.raw_size != 0 {
            self.raw_size
        } else {
            self.slot_size()
        }
    }

    #[inline]
    pub fn can_store_raw_size(&self) -> bool {
        self.bucket_index == DIRECT_MAP_BUCKET || self.total_slots() == 1
    }
}

#[inline]
pub fn super_page_base_of(address: usize) -> usize {
    address & SUPER_PAGE_BASE_MASK
}

/// # Safety
/// `super_page` must be the base of a live super page of this allocator.
#[inline]
pub unsafe fn super_page_header(super_page: usize) -> *mut SuperPageHeader {
    (super_page + SUPER_PAGE_METADATA_OFFSET) as *mut SuperPageHeader
}

/// # Safety
/// As `super_page_header`; `index` < 128.
#[inline]
pub unsafe fn partition_page_meta(super_page: usize, index: usize) -> *mut PartitionPageMeta {
    debug_assert!(index < PARTITION_PAGES_PER_SUPER_PAGE);
    ((super_page + SUPER_PAGE_METADATA_OFFSET + PAGE_META_ARRAY_OFFSET)
        as *mut PartitionPageMeta)
        .add(index)
}

/// Resolves any pointer into a slot span to the span's head record.
///
/// # Safety
/// `address` must lie within a live slot span of this allocator.
#[inline]
pub unsafe fn slot_span_from_ptr(address: usize) -> *mut PartitionPageMeta {
    let super_page = super_page_base_of(address);
    let index = (address & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT;
    let meta = partition_page_meta(super_page, index);
    let offset = (*meta).slot_span_metadata_offset as usize;
    debug_assert!(offset <= index);
    meta.sub(offset)
}

/// Payload address of a span head record.
///
/// # Safety
/// `meta` must be a span-head record obtained from this module.
#[inline]
pub unsafe fn slot_span_start(meta: *const PartitionPageMeta) -> usize {
    let super_page = super_page_base_of(meta as usize);
    let array_base =
        super_page + SUPER_PAGE_METADATA_OFFSET + PAGE_META_ARRAY_OFFSET;
    let index =
        (meta as usize - array_base) / core::mem::size_of::<PartitionPageMeta>();
    super_page + (index << PARTITION_PAGE_SHIFT)
}

/// Whether an address falls inside the payload region of its super page
/// (excludes guards, metadata, and the bitmap pages).
#[inline]
pub fn is_within_super_page_payload(address: usize) -> bool {
    let offset = address & SUPER_PAGE_OFFSET_MASK;
    (SUPER_PAGE_PAYLOAD_OFFSET..SUPER_PAGE_PAYLOAD_END_OFFSET).contains(&offset)
}

/// Initializes the header and zeroes all page records of a fresh super
/// page. The metadata region must already be committed.
///
/// # Safety
/// `super_page` must be a committed, exclusively-owned super page.
pub unsafe fn init_super_page_metadata(
    super_page: usize,
    root: *const PartitionRoot,
    kind: SuperPageKind,
    scannable: bool,
) {
    let header = super_page_header(super_page);
    header.write(SuperPageHeader {
        root,
        next_super_page: 0,
        kind,
        scannable,
    });
    for index in 0..PARTITION_PAGES_PER_SUPER_PAGE {
        partition_page_meta(super_page, index).write(PartitionPageMeta {
            freelist_head: core::ptr::null_mut(),
            next_span: core::ptr::null_mut(),
            raw_size: 0,
            bucket_index: 0,
            num_allocated_slots: 0,
            num_unprovisioned_slots: 0,
            slot_span_metadata_offset: 0,
            empty_cache_index: -1,
            flags: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_bounds_exclude_metadata_and_guards() {
        let base = 0x40_0000usize * 37; // any super-page-aligned value
        assert!(!is_within_super_page_payload(base));
        assert!(!is_within_super_page_payload(base + SUPER_PAGE_METADATA_OFFSET));
        assert!(!is_within_super_page_payload(base + SUPER_PAGE_BITMAP_OFFSET));
        assert!(is_within_super_page_payload(base + SUPER_PAGE_PAYLOAD_OFFSET));
        assert!(is_within_super_page_payload(
            base + SUPER_PAGE_PAYLOAD_END_OFFSET - 1
        ));
        assert!(!is_within_super_page_payload(
            base + SUPER_PAGE_PAYLOAD_END_OFFSET
        ));
    }

    #[test]
    fn metadata_record_is_compact() {
        // 128 records plus the header must fit the 12 KiB metadata region.
        assert!(core::mem::size_of::<PartitionPageMeta>() <= 88);
        assert!(core::mem::size_of::<SuperPageHeader>() <= PAGE_META_ARRAY_OFFSET);
    }

    #[test]
    fn interior_pointers_resolve_to_the_span_head() {
        use crate::page::{self, PageAccess};

        let super_page = page::alloc_pages(
            None,
            SUPER_PAGE_SIZE,
            SUPER_PAGE_SIZE,
            PageAccess::ReadWrite,
            0,
        )
        .expect("scratch super page");

        unsafe {
            init_super_page_metadata(
                super_page,
                core::ptr::null(),
                SuperPageKind::NormalBuckets,
                false,
            );

            // Fabricate a three-partition-page span at the payload start.
            let head_index = FIRST_PAYLOAD_PARTITION_PAGE;
            for trailing in 1..3usize {
                (*partition_page_meta(super_page, head_index + trailing))
                    .slot_span_metadata_offset = trailing as u16;
            }

            let head = partition_page_meta(super_page, head_index);
            let span_start = super_page + head_index * PARTITION_PAGE_SIZE;
            assert_eq!(slot_span_start(head), span_start);

            // Pointers in every page of the span resolve to the head.
            for probe in [
                span_start,
                span_start + 1000,
                span_start + PARTITION_PAGE_SIZE + 8,
                span_start + 2 * PARTITION_PAGE_SIZE + PARTITION_PAGE_SIZE - 1,
            ] {
                assert_eq!(slot_span_from_ptr(probe), head, "probe {probe:#x}");
            }
        }
        page::free_pages(super_page, SUPER_PAGE_SIZE);
    }

    #[test]
    fn span_state_predicates() {
        let mut meta = PartitionPageMeta {
            freelist_head: core::ptr::null_mut(),
            next_span: core::ptr::null_mut(),
            raw_size: 0,
            bucket_index: 0, // the 16-byte class
            num_allocated_slots: 0,
            num_unprovisioned_slots: 4,
            slot_span_metadata_offset: 0,
            empty_cache_index: -1,
            flags: 0,
        };
        // Unprovisioned capacity makes the span active and empty at once.
        assert!(meta.is_active());
        assert!(meta.is_empty());
        assert!(!meta.is_full());

        meta.num_unprovisioned_slots = 0;
        meta.num_allocated_slots = meta.total_slots() as u16;
        assert!(meta.is_full());
        assert!(!meta.is_active());

        meta.set_decommitted(true);
        assert!(meta.is_decommitted());
        assert!(!meta.is_empty());
        meta.set_decommitted(false);
        assert!(!meta.is_decommitted());
    }
}
