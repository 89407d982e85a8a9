// # Probabilistic Conservative Scanner
//
// Quarantine plus mark-and-sweep over partition payload. Freed objects of
// scanning-enabled partitions are not freelisted; they get a bit in the
// current mutator bitmap. When the quarantine crosses the scheduler's
// threshold, the epoch advances (swapping the bitmap roles) and a scan
// task walks every active slot span of every scannable partition as raw
// words. A word that resolves to a quarantined slot "rescues" it into the
// next epoch's quarantine; everything still marked in the scanner bitmap
// afterwards is unreachable and gets swept back to the freelists.
//
// The scan reads mutator memory without synchronization. That is
// deliberate and self-correcting: a stale read can only produce a false
// positive, which merely delays reclamation by one cycle. Missing a
// reference is prevented by the protocol, not by locks — quarantined
// objects are zeroed before the scan, so the only pointers that can
// survive are ones the mutator genuinely kept.
//
// ```text
// NotRunning ── account_freed crosses limit ──▶ Scheduled
// Scheduled  ── task dispatched              ──▶ Scanning
// Scanning   ── mark phase done              ──▶ SweepingAndFinishing
// SweepingAndFinishing ── sweep done         ──▶ NotRunning
// ```

mod bitmap;
mod scheduler;

pub use bitmap::{commit_quarantine_bitmaps, BitmapRole, QuarantineBitmap};
pub use scheduler::{LimitBackend, PcScanSchedulingBackend, PcScanScheduler, QuarantineData};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::constants::LARGE_SCAN_AREA_THRESHOLD;
use crate::error::double_free_detected;
use crate::root::PartitionRoot;
use crate::slot_span::{
    is_within_super_page_payload, slot_span_from_ptr, slot_span_start, super_page_base_of,
    super_page_header,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    NotRunning = 0,
    Scheduled = 1,
    Scanning = 2,
    SweepingAndFinishing = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Runs the task inline; for tests and teardown.
    Blocking,
    /// Posts the task to a detached worker thread.
    NonBlocking,
    /// Advances the epoch but leaves the task to
    /// `finish_scan_for_testing`.
    ScheduleOnlyForTesting,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct RootPtr(*const PartitionRoot);
unsafe impl Send for RootPtr {}

#[derive(Default)]
struct ScanRoots {
    scannable: Vec<RootPtr>,
    nonscannable: Vec<RootPtr>,
}

pub struct PcScan {
    state: AtomicU8,
    scheduler: PcScanScheduler,
    roots: Mutex<ScanRoots>,
    join_mutex: Mutex<()>,
    join_cv: Condvar,
}

static INSTANCE: Lazy<PcScan> = Lazy::new(|| PcScan {
    state: AtomicU8::new(State::NotRunning as u8),
    scheduler: PcScanScheduler::new(),
    roots: Mutex::new(ScanRoots::default()),
    join_mutex: Mutex::new(()),
    join_cv: Condvar::new(),
});

impl PcScan {
    fn instance() -> &'static PcScan {
        &INSTANCE
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::NotRunning,
            1 => State::Scheduled,
            2 => State::Scanning,
            _ => State::SweepingAndFinishing,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub fn scheduler() -> &'static PcScanScheduler {
    &PcScan::instance().scheduler
}

#[inline]
pub fn epoch() -> usize {
    PcScan::instance().scheduler.epoch()
}

#[inline]
pub fn is_in_progress() -> bool {
    PcScan::instance().state() != State::NotRunning
}

/// Registers a partition whose payload is scanned for references.
pub fn register_scannable_root(root: &PartitionRoot) {
    let mut roots = PcScan::instance().roots.lock();
    let entry = RootPtr(root as *const PartitionRoot);
    if !roots.scannable.contains(&entry) {
        roots.scannable.push(entry);
    }
}

/// Registers a partition that quarantines but is never scanned (its
/// objects are known to hold no pointers). The root's quarantine bitmaps
/// must already be committed.
pub fn register_nonscannable_root(root: &PartitionRoot) {
    debug_assert!(root.is_quarantine_enabled());
    let mut roots = PcScan::instance().roots.lock();
    let entry = RootPtr(root as *const PartitionRoot);
    if !roots.nonscannable.contains(&entry) {
        roots.nonscannable.push(entry);
    }
}

pub fn unregister_root(root: &PartitionRoot) {
    let mut roots = PcScan::instance().roots.lock();
    let entry = RootPtr(root as *const PartitionRoot);
    roots.scannable.retain(|r| *r != entry);
    roots.nonscannable.retain(|r| *r != entry);
}

/// Quarantines a freed slot instead of freelisting it. Crashes on a
/// double free (the bit was already set this epoch). Crossing the
/// scheduler threshold kicks off an asynchronous scan.
pub fn move_to_quarantine(root: &PartitionRoot, slot_start: usize, slot_size: usize) {
    debug_assert!(root.is_quarantine_enabled());
    let instance = PcScan::instance();

    let super_page = super_page_base_of(slot_start);
    let mutator = unsafe {
        QuarantineBitmap::get(super_page, instance.scheduler.epoch(), BitmapRole::Mutator)
    };
    if mutator.set_bit(slot_start) {
        double_free_detected();
    }

    if instance.scheduler.account_freed(slot_size) {
        if is_in_progress() {
            return;
        }
        perform_scan(InvocationMode::NonBlocking);
    }
}

/// Runs a scan only when something is quarantined.
pub fn perform_scan_if_needed(mode: InvocationMode) {
    if PcScan::instance().scheduler.current_size() > 0 {
        perform_scan(mode);
    }
}

/// Starts a scan cycle unless one is already in flight.
pub fn perform_scan(mode: InvocationMode) {
    let instance = PcScan::instance();
    if instance
        .state
        .compare_exchange(
            State::NotRunning as u8,
            State::Scheduled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }

    // The swap point: from here on, mutators stamp into the fresh mutator
    // bitmap while the task owns the scanner side.
    instance.scheduler.scan_started();

    match mode {
        InvocationMode::ScheduleOnlyForTesting => {}
        InvocationMode::Blocking => run_scan_task(),
        InvocationMode::NonBlocking => {
            let spawned = std::thread::Builder::new()
                .name("pcscan".into())
                .spawn(run_scan_task);
            if spawned.is_err() {
                // No worker available; degrade to inline.
                run_scan_task();
            }
        }
    }
}

/// Completes a scan scheduled with `ScheduleOnlyForTesting`.
pub fn finish_scan_for_testing() {
    let instance = PcScan::instance();
    if instance.state() == State::Scheduled {
        run_scan_task();
    }
}

/// Cooperative join: when the scanner is in its scanning window, blocks
/// until the cycle finishes so the caller observes a settled quarantine.
pub fn join_scan_if_needed() {
    let instance = PcScan::instance();
    if instance.state() != State::Scanning {
        return;
    }
    let mut guard = instance.join_mutex.lock();
    while instance.state() != State::NotRunning {
        instance.join_cv.wait(&mut guard);
    }
}

pub fn reset_for_testing() {
    let instance = PcScan::instance();
    *instance.roots.lock() = ScanRoots::default();
}

fn run_scan_task() {
    let instance = PcScan::instance();
    instance.set_state(State::Scanning);

    // Snapshot registered roots; each root snapshot takes that root's
    // lock, nothing is held across the phases below.
    let (scannable, nonscannable) = {
        let roots = instance.roots.lock();
        (roots.scannable.clone(), roots.nonscannable.clone())
    };

    let mut super_pages: BTreeSet<usize> = BTreeSet::new();
    let mut scan_areas: Vec<(usize, usize, usize)> = Vec::new();
    let mut heap_size = 0usize;
    for root in scannable.iter().chain(nonscannable.iter()) {
        let root = unsafe { &*root.0 };
        super_pages.extend(root.super_pages_snapshot());
        heap_size += root.total_size_of_committed_pages();
    }
    for root in &scannable {
        scan_areas.extend(unsafe { &*root.0 }.scan_areas_snapshot());
    }

    let epoch = instance.scheduler.epoch();

    clear_quarantined_objects(&super_pages, epoch);
    let survived = scan_partitions(&super_pages, &scan_areas, epoch);

    instance.set_state(State::SweepingAndFinishing);
    let swept = sweep_quarantine(&super_pages, epoch);

    instance
        .scheduler
        .update_schedule_after_scan(survived, heap_size);

    log::debug!(
        "pcscan cycle: {} bytes survived, {} bytes swept, quarantine {} -> {}",
        survived,
        swept,
        instance.scheduler.last_size(),
        instance.scheduler.current_size()
    );

    {
        let _guard = instance.join_mutex.lock();
        instance.set_state(State::NotRunning);
    }
    instance.join_cv.notify_all();
}

/// Zeroes the user bytes of every quarantined object. The zeros both
/// poison dangling payloads and make the scan's zero-word bailout correct:
/// a quarantined object cannot keep another quarantined object alive.
fn clear_quarantined_objects(super_pages: &BTreeSet<usize>, epoch: usize) {
    for &super_page in super_pages {
        let scanner = unsafe { QuarantineBitmap::get(super_page, epoch, BitmapRole::Scanner) };
        scanner.iterate(|slot_start| unsafe {
            let span = slot_span_from_ptr(slot_start);
            let root = &*(*super_page_header(super_page)).root;
            let begin = slot_start + root.extras_offset();
            let size = (*span).utilized_slot_size() - root.extras_total();
            core::ptr::write_bytes(begin as *mut u8, 0, size);
        });
    }
}

fn scan_partitions(
    super_pages: &BTreeSet<usize>,
    scan_areas: &[(usize, usize, usize)],
    epoch: usize,
) -> usize {
    let mut survived = 0usize;

    for &(begin, end, slot_size) in scan_areas {
        if slot_size >= LARGE_SCAN_AREA_THRESHOLD {
            // Large areas iterate slot-wise so whole quarantined slots can
            // be skipped: they were zapped and cannot hold pointers.
            let scanner = unsafe {
                QuarantineBitmap::get(super_page_base_of(begin), epoch, BitmapRole::Scanner)
            };
            let mut slot = begin;
            while slot < end {
                if !scanner.check_bit(slot) {
                    survived += scan_range(super_pages, slot, slot + slot_size, epoch);
                }
                slot += slot_size;
            }
        } else {
            survived += scan_range(super_pages, begin, end, epoch);
        }
    }
    survived
}

/// Reads each pointer-sized word of `[begin, end)` and tries to rescue
/// what it points at. The reads race mutators by design.
fn scan_range(super_pages: &BTreeSet<usize>, begin: usize, end: usize, epoch: usize) -> usize {
    let mut survived = 0usize;
    let mut current = begin;
    while current + core::mem::size_of::<usize>() <= end {
        // Volatile keeps the racy read a single untorn access the compiler
        // cannot re-load or invent.
        let word = unsafe { core::ptr::read_volatile(current as *const usize) };
        current += core::mem::size_of::<usize>();
        if word == 0 {
            continue;
        }
        // Cage fast bailout: a word outside the normal-bucket pools cannot
        // name a quarantined slot.
        if !crate::address::cage::is_in_cage_pools(word) {
            continue;
        }
        survived += try_mark_object_in_normal_bucket_pool(super_pages, word, epoch);
    }
    survived
}

/// If `maybe_ptr` points into a quarantined slot, re-marks the slot in the
/// mutator bitmap and clears it from the scanner bitmap, returning the
/// slot's size (so callers can account surviving bytes). Returns zero
/// otherwise.
fn try_mark_object_in_normal_bucket_pool(
    super_pages: &BTreeSet<usize>,
    maybe_ptr: usize,
    epoch: usize,
) -> usize {
    let super_page = super_page_base_of(maybe_ptr);
    if !super_pages.contains(&super_page) {
        return 0;
    }
    if !is_within_super_page_payload(maybe_ptr) {
        return 0;
    }

    unsafe {
        let span = slot_span_from_ptr(maybe_ptr);
        let span_start = slot_span_start(span);
        let slot_size = (*span).slot_size();
        let slot_start = span_start + ((maybe_ptr - span_start) / slot_size) * slot_size;

        let scanner = QuarantineBitmap::get(super_page, epoch, BitmapRole::Scanner);
        if !scanner.check_bit(slot_start) {
            return 0;
        }

        // Range check for inner pointers: a pointer past the user region
        // (into the trailing extras) does not retain the object.
        let root = &*(*super_page_header(super_page)).root;
        let user_size = (*span).utilized_slot_size() - root.extras_total();
        if maybe_ptr >= slot_start + root.extras_offset() + user_size {
            return 0;
        }

        scanner.clear_bit(slot_start);
        QuarantineBitmap::get(super_page, epoch, BitmapRole::Mutator).set_bit(slot_start);
        slot_size
    }
}

/// Frees every slot still marked in the scanner bitmaps; nothing reachable
/// refers to them.
fn sweep_quarantine(super_pages: &BTreeSet<usize>, epoch: usize) -> usize {
    let mut swept = 0usize;
    for &super_page in super_pages {
        let scanner = unsafe { QuarantineBitmap::get(super_page, epoch, BitmapRole::Scanner) };
        scanner.iterate(|slot_start| unsafe {
            let span = slot_span_from_ptr(slot_start);
            let root = &*(*super_page_header(super_page)).root;
            swept += (*span).slot_size();
            root.free_no_hooks_immediate(slot_start, span);
        });
        scanner.clear();
    }
    swept
}

/// Test helper: whether `slot_start` is currently quarantined in the
/// mutator bitmap of the current epoch.
pub fn is_quarantined_for_testing(slot_start: usize) -> bool {
    let super_page = super_page_base_of(slot_start);
    let mutator =
        unsafe { QuarantineBitmap::get(super_page, epoch(), BitmapRole::Mutator) };
    mutator.check_bit(slot_start)
}
