// # Memory Statistics
//
// Snapshot structures for partition and thread-cache accounting, plus the
// dumper interface embedders implement to receive them. Collection is
// best-effort where it races allocation (thread-cache counters); totals
// under the root lock are exact.

use serde::{Deserialize, Serialize};

/// Total memory usage of one partition.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionMemoryStats {
    /// Address space reserved from the system.
    pub total_mmapped_bytes: usize,
    /// Committed (resident-capable) bytes.
    pub total_committed_bytes: usize,
    /// Bytes provisioned into slots.
    pub total_resident_bytes: usize,
    /// Bytes in live allocations.
    pub total_active_bytes: usize,
    /// Bytes returnable by decommitting empty slot spans.
    pub total_decommittable_bytes: usize,
    /// Bytes returnable by discarding unused system pages.
    pub total_discardable_bytes: usize,
}

/// Per-bucket breakdown.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionBucketMemoryStats {
    pub is_valid: bool,
    pub is_direct_map: bool,
    pub bucket_slot_size: u32,
    /// Span footprint allocated from the system, in bytes.
    pub allocated_slot_span_size: u32,
    pub active_bytes: u32,
    pub resident_bytes: u32,
    pub decommittable_bytes: u32,
    pub discardable_bytes: u32,
    pub num_full_slot_spans: u32,
    pub num_active_slot_spans: u32,
    pub num_empty_slot_spans: u32,
    pub num_decommitted_slot_spans: u32,
}

/// Thread-cache counters, accumulated across caches. Reads race mutation
/// on other threads; the numbers are statistics, not invariants.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadCacheStats {
    pub alloc_count: u64,
    pub alloc_hits: u64,
    pub alloc_misses: u64,
    /// Misses because the cached bucket was empty.
    pub alloc_miss_empty: u64,
    /// Misses because the request was too large for the cache.
    pub alloc_miss_too_large: u64,
    pub cache_fill_count: u64,
    pub cache_fill_hits: u64,
    /// Fills rejected because the bucket was at its limit or the slot was
    /// too large.
    pub cache_fill_misses: u64,
    pub bucket_total_memory: u64,
    pub metadata_overhead: u64,
}

/// Receives statistics from `PartitionRoot::dump_stats`.
pub trait PartitionStatsDumper {
    fn partition_dump_totals(&mut self, partition_name: &str, stats: &PartitionMemoryStats);

    fn partition_dump_bucket_stats(
        &mut self,
        partition_name: &str,
        stats: &PartitionBucketMemoryStats,
    );
}
