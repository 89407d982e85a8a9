// Address-space classification: pool membership, reservation starts, and
// direct-map reservation resolution, exercised through real allocations.

use rusty_alloc::constants::{SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE};
use rusty_alloc::{PartitionAllocator, PartitionOptions, PartitionRoot};

#[test]
fn null_and_foreign_pointers_are_unmanaged() {
    let _allocator = PartitionAllocator::new(PartitionOptions::default());
    assert!(!rusty_alloc::is_managed_by_partition_alloc(0));

    let foreign = Box::new(42u64);
    let address = &*foreign as *const u64 as usize;
    assert!(!rusty_alloc::is_managed_by_partition_alloc(address));
    let stack_value = 7u8;
    assert!(!rusty_alloc::is_managed_by_partition_alloc(
        &stack_value as *const u8 as usize
    ));
}

#[test]
fn normal_bucket_pointers_classify_correctly() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    let ptr = root.alloc(100, "test");
    let address = ptr as usize;
    assert!(rusty_alloc::is_managed_by_partition_alloc(address));
    assert!(rusty_alloc::is_managed_by_normal_buckets(address));
    assert!(!rusty_alloc::is_managed_by_direct_map(address));
    assert_eq!(rusty_alloc::get_direct_map_reservation_start(address), 0);

    // The super page holding the allocation is a reservation start; the
    // pointer itself is not (unaligned).
    let super_page = address & !(SUPER_PAGE_SIZE - 1);
    assert!(rusty_alloc::is_reservation_start(super_page));
    assert!(!rusty_alloc::is_reservation_start(address));

    unsafe { PartitionRoot::free(ptr) };
}

#[test]
fn direct_map_pointers_resolve_to_their_reservation() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    // Five-plus super pages, so interior pointers cross several entries.
    let size = 11 << 20;
    let ptr = root.alloc(size, "test");
    let address = ptr as usize;
    let reservation = address & !(SUPER_PAGE_SIZE - 1);

    assert!(rusty_alloc::is_managed_by_direct_map(address));
    assert!(rusty_alloc::is_reservation_start(reservation));
    assert_eq!(
        rusty_alloc::get_direct_map_reservation_start(address),
        reservation
    );

    // Head, middle, and tail super pages all resolve back to the head.
    for probe in [
        address + SYSTEM_PAGE_SIZE,
        reservation + SUPER_PAGE_SIZE + 17,
        reservation + 3 * SUPER_PAGE_SIZE,
        address + size - 1,
    ] {
        assert_eq!(
            rusty_alloc::get_direct_map_reservation_start(probe),
            reservation,
            "probe {probe:#x}"
        );
        assert!(rusty_alloc::is_managed_by_direct_map(probe));
        assert!(!rusty_alloc::is_managed_by_normal_buckets(probe));
    }
    // Interior super pages are not reservation starts.
    assert!(!rusty_alloc::is_reservation_start(
        reservation + SUPER_PAGE_SIZE
    ));

    unsafe { PartitionRoot::free(ptr) };
    // Released reservations fall back to the sentinel.
    assert!(!rusty_alloc::is_managed_by_direct_map(address));
    assert_eq!(rusty_alloc::get_direct_map_reservation_start(address), 0);
}

#[test]
fn distinct_partitions_share_the_pools() {
    let first = PartitionAllocator::new(PartitionOptions::default());
    let second = PartitionAllocator::new(PartitionOptions::default());

    let a = first.root().alloc(64, "test");
    let b = second.root().alloc(64, "test");
    // Different roots never share a super page.
    assert_ne!(
        a as usize & !(SUPER_PAGE_SIZE - 1),
        b as usize & !(SUPER_PAGE_SIZE - 1)
    );
    assert!(rusty_alloc::is_managed_by_partition_alloc(a as usize));
    assert!(rusty_alloc::is_managed_by_partition_alloc(b as usize));

    unsafe {
        // Static free resolves the owning root through the super page.
        PartitionRoot::free(a);
        PartitionRoot::free(b);
    }
}
