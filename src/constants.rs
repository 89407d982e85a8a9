// # Allocator Layout Constants
//
// Compile-time units and limits shared by every subsystem. All metadata
// offsets within a super page are fixed at compile time; changing any value
// here changes the on-memory layout of every partition.

/// Smallest unit of commit/decommit. The allocator assumes 4 KiB OS pages.
pub const SYSTEM_PAGE_SIZE: usize = 1 << 12;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;
pub const SYSTEM_PAGE_BASE_MASK: usize = !SYSTEM_PAGE_OFFSET_MASK;

/// Metadata granule: one slot span occupies a whole number of these.
pub const PARTITION_PAGE_SHIFT: usize = 14;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_OFFSET_MASK: usize = PARTITION_PAGE_SIZE - 1;
pub const PARTITION_PAGE_BASE_MASK: usize = !PARTITION_PAGE_OFFSET_MASK;
pub const SYSTEM_PAGES_PER_PARTITION_PAGE: usize =
    PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;

/// The large unit on which all metadata layout is pinned. Always aligned to
/// its own size.
pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
pub const PARTITION_PAGES_PER_SUPER_PAGE: usize =
    SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

// Super page interior layout. The first system page and the last partition
// page are guard regions. Metadata lives right after the head guard. Three
// reserved bitmap partition pages (mutator quarantine, scanner quarantine,
// freeslot) sit between the metadata and the payload; they are committed
// only when the owning root needs them.
pub const SUPER_PAGE_METADATA_OFFSET: usize = SYSTEM_PAGE_SIZE;
pub const SUPER_PAGE_METADATA_SIZE: usize = PARTITION_PAGE_SIZE - SYSTEM_PAGE_SIZE;
pub const SUPER_PAGE_BITMAP_OFFSET: usize = PARTITION_PAGE_SIZE;
pub const BITMAP_PARTITION_PAGES: usize = 3;
pub const SUPER_PAGE_BITMAP_SIZE: usize = BITMAP_PARTITION_PAGES * PARTITION_PAGE_SIZE;
pub const SUPER_PAGE_PAYLOAD_OFFSET: usize =
    SUPER_PAGE_BITMAP_OFFSET + SUPER_PAGE_BITMAP_SIZE;
pub const SUPER_PAGE_PAYLOAD_END_OFFSET: usize = SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE;
pub const SUPER_PAGE_PAYLOAD_SIZE: usize =
    SUPER_PAGE_PAYLOAD_END_OFFSET - SUPER_PAGE_PAYLOAD_OFFSET;
pub const FIRST_PAYLOAD_PARTITION_PAGE: usize =
    SUPER_PAGE_PAYLOAD_OFFSET / PARTITION_PAGE_SIZE;
pub const LAST_PAYLOAD_PARTITION_PAGE: usize =
    SUPER_PAGE_PAYLOAD_END_OFFSET / PARTITION_PAGE_SIZE - 1;

/// Smallest slot granule; every slot size is a multiple of this and every
/// freelist entry (two pointers) must fit in it.
pub const MIN_SLOT_ALIGNMENT: usize = 16;

// Bucketing. An "order" is the bit length of the size; each order is split
// into eight buckets, bounding worst-case internal waste to ~12.5% (plus
// the granule rounding at the low end).
pub const NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const NUM_BUCKETS_PER_ORDER: usize = 1 << NUM_BUCKETS_PER_ORDER_BITS;
pub const MIN_BUCKETED_ORDER: usize = 5; // 16 bytes
pub const MAX_BUCKETED_ORDER: usize = 21; // covers up to 1 MiB
pub const NUM_BUCKETED_ORDERS: usize = MAX_BUCKETED_ORDER - MIN_BUCKETED_ORDER + 1;
pub const NUM_BUCKETS: usize = NUM_BUCKETED_ORDERS * NUM_BUCKETS_PER_ORDER;
pub const SMALLEST_BUCKET: usize = 1 << (MIN_BUCKETED_ORDER - 1);
pub const MAX_BUCKETED: usize = 1 << (MAX_BUCKETED_ORDER - 1);

pub const BITS_PER_SIZE_T: usize = usize::BITS as usize;

/// Requests above the largest bucket take a dedicated reservation, up to
/// this hard cap.
pub const MAX_DIRECT_MAPPED: usize = 1 << 31;

/// Multi-slot spans use at most this many partition pages; bigger slots get
/// single-slot spans sized to fit.
pub const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;

/// Ring of empty-but-committed slot spans kept around for cheap reuse.
pub const MAX_FREEABLE_SPANS: usize = 16;

// Address pools. The cage reserves the non-BRP and BRP pools back to back
// (non-BRP first, so that one-past-end pointers of foreign allocations can
// never alias the BRP pool); the configurable pool is reserved on demand.
pub const NON_BRP_POOL_SIZE: usize = 4 << 30;
pub const BRP_POOL_SIZE: usize = 4 << 30;
pub const CONFIGURABLE_POOL_SIZE: usize = 1 << 30;
pub const FORBIDDEN_ZONE_SIZE: usize = 64 * 1024;
pub const NUM_POOLS: usize = 3;

/// Reservation offset table sentinel: "this super page is not part of a
/// direct-map reservation".
pub const NOT_IN_DIRECT_MAP: u16 = u16::MAX;

// Thread cache. Buckets up to the 16 KiB class are cacheable; larger
// allocations always go to the central allocator.
pub const THREAD_CACHE_BUCKET_COUNT: usize = 81;
pub const THREAD_CACHE_MAX_COUNT_PER_BUCKET: u16 = 128;
pub const THREAD_CACHE_BATCH_FILL_RATIO: u16 = 4;

// Quarantine scanning.
pub const QUARANTINE_SIZE_MIN_LIMIT: usize = 1024 * 1024;
pub const QUARANTINE_SIZE_FRACTION: f64 = 0.1;
pub const LARGE_SCAN_AREA_THRESHOLD: usize = 8192;

/// One quarantine bitmap covers a whole super page at slot-granule
/// resolution: exactly one partition page of bits.
pub const QUARANTINE_BITMAP_SIZE: usize = SUPER_PAGE_SIZE / MIN_SLOT_ALIGNMENT / 8;

pub const COOKIE_SIZE: usize = 16;
pub const REF_COUNT_SIZE: usize = 8;

#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_page_layout_is_consistent() {
        assert_eq!(PARTITION_PAGES_PER_SUPER_PAGE, 128);
        assert_eq!(FIRST_PAYLOAD_PARTITION_PAGE, 4);
        assert_eq!(LAST_PAYLOAD_PARTITION_PAGE, 126);
        assert_eq!(
            SUPER_PAGE_PAYLOAD_OFFSET + SUPER_PAGE_PAYLOAD_SIZE + PARTITION_PAGE_SIZE,
            SUPER_PAGE_SIZE
        );
        // The largest bucketed slot must fit in one span within the payload.
        assert!(MAX_BUCKETED <= SUPER_PAGE_PAYLOAD_SIZE);
    }

    #[test]
    fn quarantine_bitmap_fills_exactly_one_partition_page() {
        assert_eq!(QUARANTINE_BITMAP_SIZE, PARTITION_PAGE_SIZE);
    }

    #[test]
    fn pool_geometry() {
        assert!(NON_BRP_POOL_SIZE.is_power_of_two());
        assert!(BRP_POOL_SIZE.is_power_of_two());
        assert!(CONFIGURABLE_POOL_SIZE.is_power_of_two());
        // Offset-table entries must stay below the sentinel.
        let cage_super_pages = (NON_BRP_POOL_SIZE + BRP_POOL_SIZE) / SUPER_PAGE_SIZE;
        assert!(cage_super_pages < NOT_IN_DIRECT_MAP as usize);
    }

    #[test]
    fn min_bucket_fits_a_freelist_entry() {
        assert!(SMALLEST_BUCKET >= 2 * core::mem::size_of::<usize>());
        assert_eq!(SMALLEST_BUCKET, MIN_SLOT_ALIGNMENT);
    }
}
