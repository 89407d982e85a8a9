// RustyAlloc - Enterprise-grade partitioned heap allocator
// Core library module
//
// A partitioned allocator: distinct roots occupy disjoint virtual-address
// reservations carved from a pre-reserved cage, serve bucketed allocations
// from slot spans with hardened freelists, amortize locking through
// per-thread caches, return memory on a reclaim cadence, and optionally
// quarantine frees behind a probabilistic conservative scan that catches
// still-referenced freed objects before their slots are reused.

pub mod address;
pub mod bucket;
pub mod build_config;
pub mod constants;
pub mod error;
pub mod freelist;
pub mod freeslot_bitmap;
pub mod hooks;
pub mod lock;
pub mod oom;
pub mod page;
pub mod quarantine;
pub mod reclaim;
pub mod root;
pub mod scan;
pub mod slot_span;
pub mod stats;
pub mod telemetry;
pub mod thread_cache;

pub use error::{AllocError, PoolError};
pub use oom::set_partition_alloc_oom_handler;
pub use quarantine::{
    LightweightQuarantineEntry, LightweightQuarantineList, LightweightQuarantineStats,
    SchedulerLoopQuarantine,
};
pub use reclaim::{MemoryReclaimer, RECLAIM_INTERVAL};
pub use root::{
    Alignment, OptCookies, OptPcScan, OptQuarantine, OptRefCount, OptThreadCache,
    PartitionAllocator, PartitionOptions, PartitionRoot, ALLOC_RETURN_NULL, ALLOC_ZERO_FILL,
    PURGE_DECOMMIT_EMPTY_SLOT_SPANS, PURGE_DISCARD_UNUSED_SYSTEM_PAGES,
};
pub use stats::{
    PartitionBucketMemoryStats, PartitionMemoryStats, PartitionStatsDumper, ThreadCacheStats,
};

/// True iff `address` lies inside any pool this allocator owns. False for
/// null.
#[inline]
pub fn is_managed_by_partition_alloc(address: usize) -> bool {
    address::cage::is_managed_by_partition_alloc(address)
}

/// True iff `address` belongs to a normal-bucket super page (as opposed to
/// a direct mapping).
#[inline]
pub fn is_managed_by_normal_buckets(address: usize) -> bool {
    address::offset_table::is_managed_by_normal_buckets(address)
}

/// True iff `address` belongs to a direct-map reservation.
#[inline]
pub fn is_managed_by_direct_map(address: usize) -> bool {
    address::offset_table::is_managed_by_direct_map(address)
}

/// True iff `address` begins a reservation (a normal-bucket super page or
/// the head super page of a direct mapping).
#[inline]
pub fn is_reservation_start(address: usize) -> bool {
    address::offset_table::is_reservation_start(address)
}

/// The reservation start of the direct mapping containing `address`, or 0
/// for normal-bucket and off-cage pointers.
#[inline]
pub fn get_direct_map_reservation_start(address: usize) -> usize {
    address::offset_table::get_direct_map_reservation_start(address)
}
