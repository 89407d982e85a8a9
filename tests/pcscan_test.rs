// Probabilistic conservative scanning: quarantine on free, survival of
// referenced objects across a scan, sweeping of unreferenced ones, and
// double-free detection. The scanner is a process singleton, so the tests
// serialize on one mutex and drive scans synchronously.

use parking_lot::Mutex;

use rusty_alloc::root::brp;
use rusty_alloc::scan;
use rusty_alloc::{
    OptCookies, OptPcScan, OptQuarantine, OptRefCount, PartitionAllocator, PartitionOptions,
    PartitionRoot,
};

static SCAN_TEST_LOCK: Mutex<()> = Mutex::new(());

fn scanned_options() -> PartitionOptions {
    PartitionOptions {
        quarantine: OptQuarantine::Allowed,
        pcscan: OptPcScan::DisabledByDefault,
        cookies: OptCookies::Disallowed,
        ..Default::default()
    }
}

fn scanned_allocator() -> PartitionAllocator {
    let allocator = PartitionAllocator::new(scanned_options());
    allocator.root().enable_pcscan();
    // Keep the threshold out of reach so only explicit scans run.
    scan::scheduler().set_size_limit_for_testing(usize::MAX / 2);
    allocator
}

fn run_blocking_scan() {
    scan::perform_scan(scan::InvocationMode::Blocking);
}

#[test]
fn free_quarantines_instead_of_freelisting() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    let p = root.alloc(64, "test");
    unsafe { PartitionRoot::free(p) };
    assert!(scan::is_quarantined_for_testing(p as usize));

    // The slot is not on the freelist: the next allocation provisions a
    // different slot.
    let q = root.alloc(64, "test");
    assert_ne!(q, p);
    unsafe { PartitionRoot::free(q) };
}

#[test]
fn referenced_object_survives_a_scan() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    let a = root.alloc(64, "test") as *mut usize;
    let b = root.alloc(64, "test");
    unsafe {
        // a -> b edge, then free b.
        *a = b as usize;
        PartitionRoot::free(b);
    }
    assert!(scan::is_quarantined_for_testing(b as usize));

    run_blocking_scan();
    // The dangling reference kept b quarantined (re-marked into the new
    // epoch's mutator bitmap)...
    assert!(scan::is_quarantined_for_testing(b as usize));
    // ...and its payload was zapped.
    unsafe {
        assert_eq!(*(b as *const usize), 0);
    }

    unsafe {
        // Clear the edge; the next cycle reclaims b.
        *a = 0;
    }
    run_blocking_scan();
    assert!(!scan::is_quarantined_for_testing(b as usize));
    // Swept means freelisted: the next allocation of the class reuses b.
    let reused = root.alloc(64, "test");
    assert_eq!(reused, b);

    unsafe {
        PartitionRoot::free(a as *mut u8);
        PartitionRoot::free(reused);
    }
    run_blocking_scan();
}

#[test]
fn unreferenced_object_is_swept() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    let p = root.alloc(64, "test");
    unsafe { PartitionRoot::free(p) };
    assert!(scan::is_quarantined_for_testing(p as usize));

    run_blocking_scan();
    assert!(!scan::is_quarantined_for_testing(p as usize));
    let reused = root.alloc(64, "test");
    assert_eq!(reused, p);
    unsafe { PartitionRoot::free(reused) };
    run_blocking_scan();
}

#[test]
fn interior_pointers_retain_objects() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    let a = root.alloc(64, "test") as *mut usize;
    let b = root.alloc(256, "test");
    unsafe {
        // A pointer into the middle of b still counts as a reference.
        *a = b as usize + 100;
        PartitionRoot::free(b);
    }
    run_blocking_scan();
    assert!(scan::is_quarantined_for_testing(b as usize));

    unsafe { *a = 0 };
    run_blocking_scan();
    assert!(!scan::is_quarantined_for_testing(b as usize));
    unsafe { PartitionRoot::free(a as *mut u8) };
    run_blocking_scan();
}

#[test]
fn cross_bucket_references_are_found() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    // Holder and pointee in different buckets, hence different slot spans
    // and typically different partition pages.
    let holder = root.alloc(2048, "test") as *mut usize;
    let small = root.alloc(32, "test");
    unsafe {
        *holder = small as usize;
        PartitionRoot::free(small);
    }
    run_blocking_scan();
    assert!(scan::is_quarantined_for_testing(small as usize));

    unsafe { *holder = 0 };
    run_blocking_scan();
    assert!(!scan::is_quarantined_for_testing(small as usize));
    unsafe { PartitionRoot::free(holder as *mut u8) };
    run_blocking_scan();
}

#[test]
fn every_slot_position_behaves_the_same() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    // Fill a whole span so we hold its first, last, and interior slots.
    let size = 1024usize;
    let mut slots = Vec::new();
    for _ in 0..64 {
        slots.push(root.alloc(size, "test"));
    }
    let holder = root.alloc(64, "test") as *mut usize;

    for &victim_index in &[0usize, slots.len() / 2, slots.len() - 1] {
        let victim = slots[victim_index];
        unsafe {
            *holder = victim as usize;
            PartitionRoot::free(victim);
        }
        run_blocking_scan();
        assert!(
            scan::is_quarantined_for_testing(victim as usize),
            "victim {victim_index} should survive while referenced"
        );

        unsafe { *holder = 0 };
        run_blocking_scan();
        assert!(
            !scan::is_quarantined_for_testing(victim as usize),
            "victim {victim_index} should be swept once unreferenced"
        );
        // Keep the set consistent: reallocate the swept slot.
        slots[victim_index] = root.alloc(size, "test");
    }

    for ptr in slots {
        unsafe { PartitionRoot::free(ptr) };
    }
    unsafe { PartitionRoot::free(holder as *mut u8) };
    run_blocking_scan();
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_detected_in_the_quarantine() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = scanned_allocator();
    let root = allocator.root();

    let p = root.alloc(64, "test");
    unsafe {
        PartitionRoot::free(p);
        PartitionRoot::free(p);
    }
}

#[cfg(feature = "backup-ref-ptr")]
#[test]
fn quarantine_and_ref_count_compose() {
    let _guard = SCAN_TEST_LOCK.lock();
    let allocator = PartitionAllocator::new(PartitionOptions {
        quarantine: OptQuarantine::Allowed,
        pcscan: OptPcScan::DisabledByDefault,
        cookies: OptCookies::Disallowed,
        ref_count: OptRefCount::Allowed,
        ..Default::default()
    });
    allocator.root().enable_pcscan();
    scan::scheduler().set_size_limit_for_testing(usize::MAX / 2);
    let root = allocator.root();

    let p = root.alloc(64, "test");
    unsafe {
        brp::acquire_internal(p as usize);
        PartitionRoot::free(p);
    }
    // Freed into the quarantine; the sweep defers to the outstanding
    // reference instead of freelisting.
    run_blocking_scan();
    let q = root.alloc(64, "test");
    assert_ne!(q, p);

    unsafe {
        brp::release_internal(p as usize);
        PartitionRoot::free(q);
    }
    run_blocking_scan();
}
