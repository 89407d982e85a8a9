// Comprehensive allocator behavior: bucketed allocation, freelist reuse,
// realloc, direct maps, aligned allocation, purging, and the committed-size
// invariant. Each test builds its own partition; the cage and pools are
// process-wide and shared.

use rusty_alloc::root::brp;
use rusty_alloc::{
    Alignment, OptCookies, OptRefCount, PartitionAllocator, PartitionBucketMemoryStats,
    PartitionMemoryStats, PartitionOptions, PartitionRoot, PartitionStatsDumper,
    ALLOC_RETURN_NULL, ALLOC_ZERO_FILL, PURGE_DECOMMIT_EMPTY_SLOT_SPANS,
    PURGE_DISCARD_UNUSED_SYSTEM_PAGES,
};

fn plain_options() -> PartitionOptions {
    PartitionOptions {
        cookies: OptCookies::Disallowed,
        ..Default::default()
    }
}

#[test]
fn alloc_writes_and_frees_across_size_classes() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    let sizes = [1usize, 8, 12, 16, 31, 64, 100, 256, 1000, 4096, 20000, 65536];
    let mut live = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let ptr = root.alloc(size, "test");
        assert!(!ptr.is_null(), "allocation of {size} failed");
        unsafe {
            std::ptr::write_bytes(ptr, i as u8 + 1, size);
        }
        live.push((ptr, size, i as u8 + 1));
    }
    // Contents survive neighboring allocations.
    for &(ptr, size, fill) in &live {
        unsafe {
            assert_eq!(*ptr, fill);
            assert_eq!(*ptr.add(size - 1), fill);
        }
    }
    for (ptr, _, _) in live {
        unsafe { PartitionRoot::free(ptr) };
    }
}

#[test]
fn freed_slots_are_reused_lifo() {
    let allocator = PartitionAllocator::new(plain_options());
    let root = allocator.root();

    let a = root.alloc(128, "test");
    let b = root.alloc(128, "test");
    // Fresh spans provision slots in address order.
    assert_eq!(b as usize - a as usize, 128);

    unsafe {
        PartitionRoot::free(b);
        PartitionRoot::free(a);
    }
    // The bucket freelist is now a -> b.
    let first = root.alloc(128, "test");
    let second = root.alloc(128, "test");
    assert_eq!(first, a);
    assert_eq!(second, b);
    unsafe {
        PartitionRoot::free(first);
        PartitionRoot::free(second);
    }
}

#[test]
fn zero_fill_returns_zeroed_memory() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    let ptr = root.alloc(512, "test");
    unsafe {
        std::ptr::write_bytes(ptr, 0xcd, 512);
        PartitionRoot::free(ptr);
    }
    let ptr = root.alloc_flags(ALLOC_ZERO_FILL, 512, "test");
    unsafe {
        for offset in 0..512 {
            assert_eq!(*ptr.add(offset), 0, "byte {offset} not zeroed");
        }
        PartitionRoot::free(ptr);
    }
}

#[test]
fn actual_size_matches_usable_size() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    for size in [1usize, 16, 100, 1024, 5000, 100_000] {
        let expected = root.actual_size(size);
        assert!(expected >= size);
        let ptr = root.alloc(size, "test");
        let usable = unsafe { PartitionRoot::get_usable_size(ptr) };
        assert_eq!(usable, expected, "size {size}");
        unsafe { PartitionRoot::free(ptr) };
    }

    // Direct-mapped sizes round to system pages.
    let big = 3 << 20;
    let expected = root.actual_size(big);
    assert!(expected >= big);
    let ptr = root.alloc(big, "test");
    assert_eq!(unsafe { PartitionRoot::get_usable_size(ptr) }, expected);
    unsafe { PartitionRoot::free(ptr) };
}

#[test]
fn realloc_same_bucket_is_in_place() {
    let allocator = PartitionAllocator::new(plain_options());
    let root = allocator.root();

    let ptr = root.alloc(120, "test");
    unsafe {
        std::ptr::write_bytes(ptr, 0x42, 120);
        // 120 and 128 share the 128-byte class.
        let same = root.realloc(ptr, 128, "test");
        assert_eq!(same, ptr);

        let moved = root.realloc(same, 4000, "test");
        assert_ne!(moved, ptr);
        for offset in 0..120 {
            assert_eq!(*moved.add(offset), 0x42);
        }
        PartitionRoot::free(moved);
    }
}

#[test]
fn realloc_null_and_zero_edge_cases() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();
    unsafe {
        let ptr = root.realloc(std::ptr::null_mut(), 64, "test");
        assert!(!ptr.is_null());
        let gone = root.realloc(ptr, 0, "test");
        assert!(gone.is_null());
    }
}

#[test]
fn direct_map_lifecycle_and_in_place_realloc() {
    let allocator = PartitionAllocator::new(plain_options());
    let root = allocator.root();

    let size = 3 << 20;
    let ptr = root.alloc(size, "test");
    assert!(!ptr.is_null());
    let address = ptr as usize;
    assert!(rusty_alloc::is_managed_by_direct_map(address));
    assert!(!rusty_alloc::is_managed_by_normal_buckets(address));

    unsafe {
        std::ptr::write_bytes(ptr, 0x7e, size);

        // Growing within the reserved extent keeps the pointer.
        let grown = root.realloc(ptr, size + (256 << 10), "test");
        assert_eq!(grown, ptr);
        assert_eq!(*grown, 0x7e);
        assert_eq!(*grown.add(size - 1), 0x7e);

        // Shrinking decommits the tail but keeps the pointer too.
        let shrunk = root.realloc(grown, 1 << 20, "test");
        assert_eq!(shrunk, ptr);

        // Growing far past the reservation moves.
        let moved = root.realloc(shrunk, 16 << 20, "test");
        assert_ne!(moved, ptr);
        assert_eq!(*moved, 0x7e);
        PartitionRoot::free(moved);
    }
    assert!(!rusty_alloc::is_managed_by_direct_map(address));
}

#[test]
fn oversize_requests_honor_return_null() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();
    let ptr = root.alloc_flags(ALLOC_RETURN_NULL, usize::MAX / 2, "test");
    assert!(ptr.is_null());
}

#[test]
#[should_panic(expected = "out of memory")]
fn oversize_requests_crash_without_return_null() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let _ = allocator.root().alloc(usize::MAX / 2, "test");
}

#[test]
#[should_panic(expected = "cookie mismatch")]
fn trailing_cookie_overwrite_crashes_on_free() {
    // Cookies are on by default; a linear overflow past the usable region
    // lands in the trailing cookie.
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    let ptr = root.alloc(64, "test");
    let usable = unsafe { PartitionRoot::get_usable_size(ptr) };
    unsafe {
        std::ptr::write_bytes(ptr.add(usable), 0xee, 4);
        PartitionRoot::free(ptr);
    }
}

#[test]
fn partition_tags_count_up_and_skip_zero() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();
    let first = root.get_new_partition_tag();
    let second = root.get_new_partition_tag();
    assert_ne!(first, 0);
    assert_eq!(second, first + 1);
}

#[test]
fn aligned_alloc_respects_alignment() {
    let allocator = PartitionAllocator::new(PartitionOptions {
        alignment: Alignment::AlignedAlloc,
        cookies: OptCookies::Disallowed,
        ..Default::default()
    });
    let root = allocator.root();

    for alignment in [8usize, 16, 64, 256, 4096, 16384] {
        for size in [1usize, 24, 100, 1000, 60000] {
            let ptr = root.aligned_alloc_flags(0, alignment, size);
            assert!(!ptr.is_null(), "align {alignment} size {size}");
            assert_eq!(ptr as usize % alignment, 0, "align {alignment} size {size}");
            unsafe {
                std::ptr::write_bytes(ptr, 0x11, size);
                PartitionRoot::free(ptr);
            }
        }
    }

    // Non-power-of-two and sub-pointer alignments are refused, not fatal.
    assert!(root.aligned_alloc_flags(0, 24, 64).is_null());
    assert!(root.aligned_alloc_flags(0, 4, 64).is_null());
}

#[test]
fn purge_decommits_empty_slot_spans() {
    let allocator = PartitionAllocator::new(plain_options());
    let root = allocator.root();

    let mut ptrs = Vec::new();
    for _ in 0..200 {
        ptrs.push(root.alloc(16 << 10, "test"));
    }
    let peak = root.total_size_of_committed_pages();
    for ptr in ptrs {
        unsafe { PartitionRoot::free(ptr) };
    }
    root.purge_memory(PURGE_DECOMMIT_EMPTY_SLOT_SPANS);
    let after = root.total_size_of_committed_pages();
    assert!(
        after < peak,
        "purge should decommit: peak {peak}, after {after}"
    );

    // Discard is a hint; it must leave the heap fully functional.
    let ptr = root.alloc(16 << 10, "test");
    root.purge_memory(PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
    unsafe {
        std::ptr::write_bytes(ptr, 0x66, 16 << 10);
        assert_eq!(*ptr, 0x66);
        PartitionRoot::free(ptr);
    }
}

#[derive(Default)]
struct CollectingDumper {
    totals: Option<PartitionMemoryStats>,
    buckets: Vec<PartitionBucketMemoryStats>,
}

impl PartitionStatsDumper for CollectingDumper {
    fn partition_dump_totals(&mut self, _name: &str, stats: &PartitionMemoryStats) {
        self.totals = Some(*stats);
    }

    fn partition_dump_bucket_stats(&mut self, _name: &str, stats: &PartitionBucketMemoryStats) {
        self.buckets.push(*stats);
    }
}

#[test]
fn dump_stats_upholds_the_commit_invariant() {
    let allocator = PartitionAllocator::new(PartitionOptions::default());
    let root = allocator.root();

    let mut live = Vec::new();
    for size in [32usize, 500, 9000, 3 << 20] {
        live.push(root.alloc(size, "test"));
    }

    let mut dumper = CollectingDumper::default();
    root.dump_stats("test-partition", false, &mut dumper);
    let totals = dumper.totals.expect("totals dumped");
    assert!(totals.total_committed_bytes <= totals.total_mmapped_bytes);
    assert!(totals.total_active_bytes > 0);
    assert!(dumper.buckets.iter().any(|b| b.is_direct_map));
    assert!(dumper.buckets.iter().any(|b| !b.is_direct_map));

    for ptr in live {
        unsafe { PartitionRoot::free(ptr) };
    }
}

#[cfg(feature = "backup-ref-ptr")]
#[test]
fn brp_references_defer_the_physical_free() {
    let allocator = PartitionAllocator::new(PartitionOptions {
        ref_count: OptRefCount::Allowed,
        ..Default::default()
    });
    let root = allocator.root();

    let ptr = root.alloc(64, "test");
    let address = ptr as usize;
    assert!(rusty_alloc::address::cage::is_in_brp_pool(address));

    unsafe {
        brp::acquire_internal(address);
        assert!(brp::is_pointee_alive(address));

        PartitionRoot::free(ptr);
        // The reference keeps the slot out of the freelist: a new
        // allocation of the class must not reuse it.
        assert!(!brp::is_pointee_alive(address));
        let other = root.alloc(64, "test");
        assert_ne!(other, ptr);

        // Last release performs the physical free; now the slot recycles.
        brp::release_internal(address);
        let reused = root.alloc(64, "test");
        assert_eq!(reused, ptr);

        PartitionRoot::free(other);
        PartitionRoot::free(reused);
    }
}

#[cfg(feature = "backup-ref-ptr")]
#[test]
fn brp_delta_classification() {
    let allocator = PartitionAllocator::new(PartitionOptions {
        ref_count: OptRefCount::Allowed,
        ..Default::default()
    });
    let root = allocator.root();

    let ptr = root.alloc(64, "test");
    let address = ptr as usize;
    let usable = unsafe { PartitionRoot::get_usable_size(ptr) };

    unsafe {
        assert_eq!(brp::is_valid_delta(address, 0), brp::PtrPosition::InRange);
        assert_eq!(
            brp::is_valid_delta(address, (usable - 1) as isize),
            brp::PtrPosition::InRange
        );
        assert_eq!(
            brp::is_valid_delta(address, usable as isize),
            brp::PtrPosition::OnePastEnd
        );
        assert_eq!(
            brp::is_valid_delta(address, -1),
            brp::PtrPosition::OutOfBounds
        );
        assert_eq!(
            brp::is_valid_delta(address, (usable + 8) as isize),
            brp::PtrPosition::OutOfBounds
        );
        PartitionRoot::free(ptr);
    }
}
