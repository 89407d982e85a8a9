// # Lightweight Quarantine
//
// A bounded, lossy deferred-free ring for partitions that cannot afford
// scanning: `free` parks the object here and the eventual eviction performs
// the real free. Entry ids concatenate a reuse counter with the slot index;
// evicting a slot bumps its counter, so a stale id captured earlier (say,
// in a zapping pattern recovered by a crash handler) can never resolve to
// the slot's next tenant. Stored ids are kept shuffled by swapping each
// insertion into a random position of the active prefix.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::root::PartitionRoot;

/// One quarantined free request. Applications may carry more free-time
/// context by embedding this in a larger entry.
#[derive(Debug, Clone, Copy)]
pub struct LightweightQuarantineEntry {
    pub object: *mut u8,
}

impl LightweightQuarantineEntry {
    pub fn new(object: *mut u8) -> Self {
        LightweightQuarantineEntry { object }
    }

    #[inline]
    pub fn get_object(&self) -> *mut u8 {
        self.object
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Slot {
    entry_id: u32,
    entry: LightweightQuarantineEntry,
}

const INVALID_ENTRY_ID: u32 = u32::MAX;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct LightweightQuarantineStats {
    pub count: usize,
    pub size_in_bytes: usize,
    pub cumulative_count: usize,
    pub cumulative_size_in_bytes: usize,
    pub quarantine_miss_count: usize,
}

struct ListState<const CAPACITY_COUNT: usize> {
    slots: [Slot; CAPACITY_COUNT],
    /// The first `count` elements are the ids of occupied slots (shuffled);
    /// the rest are the ids free slots will be assigned next.
    entry_ids: [u32; CAPACITY_COUNT],
    rng: StdRng,
}

pub struct LightweightQuarantineList<const CAPACITY_COUNT: usize> {
    root: *const PartitionRoot,
    capacity_in_bytes: AtomicUsize,
    state: Mutex<ListState<CAPACITY_COUNT>>,
    count: AtomicUsize,
    size_in_bytes: AtomicUsize,
    cumulative_count: AtomicUsize,
    cumulative_size_in_bytes: AtomicUsize,
    quarantine_miss_count: AtomicUsize,
}

unsafe impl<const N: usize> Send for LightweightQuarantineList<N> {}
unsafe impl<const N: usize> Sync for LightweightQuarantineList<N> {}

impl<const CAPACITY_COUNT: usize> LightweightQuarantineList<CAPACITY_COUNT> {
    const SLOT_MASK: u32 = (CAPACITY_COUNT - 1) as u32;

    pub fn new(root: &PartitionRoot, capacity_in_bytes: usize) -> Self {
        assert!(CAPACITY_COUNT.is_power_of_two());
        let mut entry_ids = [0u32; CAPACITY_COUNT];
        for (index, id) in entry_ids.iter_mut().enumerate() {
            // Any values work as long as the slot-index bits are unique;
            // iota keeps counters starting at zero.
            *id = index as u32;
        }
        LightweightQuarantineList {
            root: root as *const PartitionRoot,
            capacity_in_bytes: AtomicUsize::new(capacity_in_bytes),
            state: Mutex::new(ListState {
                slots: [Slot {
                    entry_id: INVALID_ENTRY_ID,
                    entry: LightweightQuarantineEntry {
                        object: core::ptr::null_mut(),
                    },
                }; CAPACITY_COUNT],
                entry_ids,
                rng: StdRng::seed_from_u64(0x1d1d_5eed_c0de_4a11),
            }),
            count: AtomicUsize::new(0),
            size_in_bytes: AtomicUsize::new(0),
            cumulative_count: AtomicUsize::new(0),
            cumulative_size_in_bytes: AtomicUsize::new(0),
            quarantine_miss_count: AtomicUsize::new(0),
        }
    }

    /// Skips the two reserved values (0 is "rejected", all-ones is
    /// "invalid") when assigning ids.
    fn sanitize_id(mut id: u32) -> u32 {
        while id == 0 || id == INVALID_ENTRY_ID {
            id = id.wrapping_add(CAPACITY_COUNT as u32);
        }
        id
    }

    /// Quarantines an object, evicting from the tail until it fits.
    /// Returns the entry id, or 0 when the entry alone exceeds the byte
    /// capacity (the object is then freed immediately and counted as a
    /// miss).
    ///
    /// # Safety
    /// `entry.object` must be a live allocation of this list's root.
    pub unsafe fn quarantine(&self, entry: LightweightQuarantineEntry) -> u32 {
        let size = PartitionRoot::get_usable_size(entry.object);
        let capacity = self.capacity_in_bytes.load(Ordering::Relaxed);
        if size > capacity {
            self.quarantine_miss_count.fetch_add(1, Ordering::Relaxed);
            PartitionRoot::free_no_hooks(entry.object);
            return 0;
        }

        let mut state = self.state.lock();
        while self.count.load(Ordering::Relaxed) >= CAPACITY_COUNT
            || self.size_in_bytes.load(Ordering::Relaxed) + size > capacity
        {
            self.evict_tail(&mut state);
        }

        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(count < CAPACITY_COUNT);
        let id = Self::sanitize_id(state.entry_ids[count]);
        let slot_index = (id & Self::SLOT_MASK) as usize;
        state.entry_ids[count] = id;
        state.slots[slot_index] = Slot {
            entry_id: id,
            entry,
        };
        // Shuffle the fresh id into the active prefix.
        let swap_with = state.rng.random_range(0..=count);
        state.entry_ids.swap(count, swap_with);

        self.count.store(count + 1, Ordering::Relaxed);
        self.size_in_bytes.fetch_add(size, Ordering::Relaxed);
        self.cumulative_count.fetch_add(1, Ordering::Relaxed);
        self.cumulative_size_in_bytes
            .fetch_add(size, Ordering::Relaxed);
        id
    }

    unsafe fn evict_tail(&self, state: &mut ListState<CAPACITY_COUNT>) {
        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(count > 0);
        let id = state.entry_ids[count - 1];
        let slot_index = (id & Self::SLOT_MASK) as usize;
        let object = state.slots[slot_index].entry.object;
        let size = PartitionRoot::get_usable_size(object);

        PartitionRoot::free_no_hooks(object);

        // Bump the counter so the evicted id never matches this slot again.
        state.entry_ids[count - 1] = Self::sanitize_id(id.wrapping_add(CAPACITY_COUNT as u32));
        state.slots[slot_index].entry_id = INVALID_ENTRY_ID;
        self.count.store(count - 1, Ordering::Relaxed);
        self.size_in_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Drains everything now.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        while self.count.load(Ordering::Relaxed) > 0 {
            unsafe { self.evict_tail(&mut state) };
        }
        debug_assert_eq!(self.size_in_bytes.load(Ordering::Relaxed), 0);
    }

    pub fn accumulate_stats(&self, stats: &mut LightweightQuarantineStats) {
        stats.count += self.count.load(Ordering::Relaxed);
        stats.size_in_bytes += self.size_in_bytes.load(Ordering::Relaxed);
        stats.cumulative_count += self.cumulative_count.load(Ordering::Relaxed);
        stats.cumulative_size_in_bytes += self.cumulative_size_in_bytes.load(Ordering::Relaxed);
        stats.quarantine_miss_count += self.quarantine_miss_count.load(Ordering::Relaxed);
    }

    pub fn is_quarantined_for_testing(&self, object: *mut u8) -> bool {
        let state = self.state.lock();
        let count = self.count.load(Ordering::Relaxed);
        state.entry_ids[..count].iter().any(|id| {
            let slot = &state.slots[(id & Self::SLOT_MASK) as usize];
            slot.entry_id == *id && slot.entry.object == object
        })
    }

    /// Address of the slot array, for diagnostic tooling that resolves a
    /// captured id back to an entry at crash time. Don't dereference while
    /// mutators run.
    pub fn get_slots_address(&self) -> usize {
        let state = self.state.lock();
        state.slots.as_ptr() as usize
    }

    /// Recovers the entry for a captured id. Returns `None` when the slot
    /// was reused since (counter mismatch). Not thread-safe; crash-handler
    /// and test use only.
    ///
    /// # Safety
    /// `slots_address` must come from `get_slots_address` of a live list.
    pub unsafe fn get_entry_by_id(
        slots_address: usize,
        entry_id: u32,
    ) -> Option<LightweightQuarantineEntry> {
        let slots = slots_address as *const Slot;
        let slot = &*slots.add((entry_id & Self::SLOT_MASK) as usize);
        if slot.entry_id != entry_id {
            return None;
        }
        Some(slot.entry)
    }

    pub fn capacity_in_bytes(&self) -> usize {
        self.capacity_in_bytes.load(Ordering::Relaxed)
    }

    /// The partition this list defers frees for.
    pub fn root(&self) -> *const PartitionRoot {
        self.root
    }

    pub fn set_capacity_in_bytes_for_testing(&self, capacity: usize) {
        self.capacity_in_bytes.store(capacity, Ordering::Relaxed);
        self.purge();
    }
}

impl<const N: usize> Drop for LightweightQuarantineList<N> {
    fn drop(&mut self) {
        self.purge();
    }
}

/// The configuration used for scheduler-loop style deferred frees.
pub type SchedulerLoopQuarantine = LightweightQuarantineList<1024>;
