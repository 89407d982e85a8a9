// # Scan Scheduling
//
// The mutator-facing side of scan triggering: an atomic byte count that
// frees bump, checked against a limit the backend recomputes after every
// scan. The default backend is a plain limit rule: scan when the
// quarantine exceeds max(1 MiB, 10% of the committed heap).

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::constants::{QUARANTINE_SIZE_FRACTION, QUARANTINE_SIZE_MIN_LIMIT};

#[derive(Default)]
pub struct QuarantineData {
    /// Bytes currently quarantined (grows on free, resets at scan start,
    /// re-grows with survivors).
    pub current_size: AtomicUsize,
    pub size_limit: AtomicUsize,
    /// Scan generation; selects which bitmap instance is the mutator's.
    pub epoch: AtomicUsize,
    /// Quarantine size at the start of the last scan.
    pub last_size: AtomicUsize,
}

pub trait PcScanSchedulingBackend: Send + Sync {
    /// Called when `account_freed` crosses the limit; returning true asks
    /// the caller to start a scan.
    fn limit_reached(&self, data: &QuarantineData) -> bool;

    fn scan_started(&self, data: &QuarantineData);

    fn update_schedule_after_scan(
        &self,
        data: &QuarantineData,
        survived_bytes: usize,
        heap_size: usize,
    );
}

/// The stock backend: one hard limit, recomputed from the heap size.
pub struct LimitBackend;

impl PcScanSchedulingBackend for LimitBackend {
    fn limit_reached(&self, _data: &QuarantineData) -> bool {
        true
    }

    fn scan_started(&self, data: &QuarantineData) {
        let last = data.current_size.swap(0, Ordering::Relaxed);
        data.last_size.store(last, Ordering::Relaxed);
        data.epoch.fetch_add(1, Ordering::Release);
    }

    fn update_schedule_after_scan(
        &self,
        data: &QuarantineData,
        survived_bytes: usize,
        heap_size: usize,
    ) {
        data.current_size.fetch_add(survived_bytes, Ordering::Relaxed);
        let limit = QUARANTINE_SIZE_MIN_LIMIT
            .max((QUARANTINE_SIZE_FRACTION * heap_size as f64) as usize);
        data.size_limit.store(limit, Ordering::Relaxed);
    }
}

pub struct PcScanScheduler {
    data: QuarantineData,
    backend: RwLock<Box<dyn PcScanSchedulingBackend>>,
}

impl Default for PcScanScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PcScanScheduler {
    pub fn new() -> PcScanScheduler {
        let data = QuarantineData::default();
        data.size_limit
            .store(QUARANTINE_SIZE_MIN_LIMIT, Ordering::Relaxed);
        PcScanScheduler {
            data,
            backend: RwLock::new(Box::new(LimitBackend)),
        }
    }

    /// Accounts freed bytes; true means the caller should trigger a scan.
    #[inline]
    pub fn account_freed(&self, bytes: usize) -> bool {
        let before = self.data.current_size.fetch_add(bytes, Ordering::Relaxed);
        before + bytes > self.data.size_limit.load(Ordering::Relaxed)
            && self.backend.read().limit_reached(&self.data)
    }

    pub fn scan_started(&self) {
        self.backend.read().scan_started(&self.data);
    }

    pub fn update_schedule_after_scan(&self, survived_bytes: usize, heap_size: usize) {
        self.backend
            .read()
            .update_schedule_after_scan(&self.data, survived_bytes, heap_size);
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.data.epoch.load(Ordering::Acquire)
    }

    pub fn current_size(&self) -> usize {
        self.data.current_size.load(Ordering::Relaxed)
    }

    pub fn size_limit(&self) -> usize {
        self.data.size_limit.load(Ordering::Relaxed)
    }

    pub fn last_size(&self) -> usize {
        self.data.last_size.load(Ordering::Relaxed)
    }

    /// Swaps in a different scheduling strategy.
    pub fn set_scheduling_backend(&self, backend: Box<dyn PcScanSchedulingBackend>) {
        *self.backend.write() = backend;
    }

    pub fn set_size_limit_for_testing(&self, limit: usize) {
        self.data.size_limit.store(limit, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_freed_triggers_at_the_limit() {
        let scheduler = PcScanScheduler::new();
        scheduler.set_size_limit_for_testing(1024);
        assert!(!scheduler.account_freed(1024));
        assert!(scheduler.account_freed(1));
        assert_eq!(scheduler.current_size(), 1025);
    }

    #[test]
    fn scan_start_snapshots_and_advances_epoch() {
        let scheduler = PcScanScheduler::new();
        scheduler.set_size_limit_for_testing(10);
        let _ = scheduler.account_freed(64);
        let epoch_before = scheduler.epoch();

        scheduler.scan_started();
        assert_eq!(scheduler.epoch(), epoch_before + 1);
        assert_eq!(scheduler.last_size(), 64);
        assert_eq!(scheduler.current_size(), 0);
    }

    #[test]
    fn limit_follows_the_heap_with_a_floor() {
        let scheduler = PcScanScheduler::new();
        scheduler.update_schedule_after_scan(100, 4 << 20);
        // 10% of 4 MiB is under the 1 MiB floor.
        assert_eq!(scheduler.size_limit(), QUARANTINE_SIZE_MIN_LIMIT);
        assert_eq!(scheduler.current_size(), 100);

        scheduler.update_schedule_after_scan(0, 400 << 20);
        assert_eq!(scheduler.size_limit(), 40 << 20);
    }
}
