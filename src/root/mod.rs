// # Partition Root
//
// The entry point for one logically-separate heap. A root owns its buckets,
// its super-page chain, its direct-map list, and the bookkeeping counters;
// one lock serializes all of it. The hot paths are structured so the
// disarmed configuration costs almost nothing: hooks are one relaxed load,
// extras are a couple of adds, and the thread cache keeps the lock out of
// the common case entirely.
//
// Roots are created through `PartitionAllocator`, never destroyed while any
// of their allocations live, and resolve back from any pointer via the
// super-page header. `inverted_self` is the tamper check on that
// resolution: a forged header is overwhelmingly unlikely to carry both a
// root pointer and its bitwise inverse.

pub mod brp;
pub mod direct_map;
pub mod extras;
pub mod ref_count;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::address::{cage, AddressPoolManager, PoolHandle};
use crate::bucket::{sizes, Bucket};
use crate::build_config;
use crate::constants::*;
use crate::error::root_integrity_violated;
use crate::freelist::FreelistEntry;
use crate::freeslot_bitmap;
use crate::hooks;
use crate::lock::PartitionLock;
use crate::page::{self, PageAccess};
use crate::scan;
use crate::slot_span::{
    self, partition_page_meta, slot_span_from_ptr, slot_span_start, super_page_base_of,
    super_page_header, PartitionPageMeta, SuperPageKind, DIRECT_MAP_BUCKET,
};
use crate::stats::{PartitionBucketMemoryStats, PartitionMemoryStats, PartitionStatsDumper};
use crate::thread_cache;

use direct_map::DirectMapExtent;
use ref_count::{ref_count_ptr, PartitionRefCount};

// Allocation flags.
pub const ALLOC_RETURN_NULL: u32 = 1 << 0;
pub const ALLOC_ZERO_FILL: u32 = 1 << 1;

// Purge flags.
pub const PURGE_DECOMMIT_EMPTY_SLOT_SPANS: u32 = 1 << 0;
pub const PURGE_DISCARD_UNUSED_SYSTEM_PAGES: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    /// Allocations aligned to the slot granule.
    Regular,
    /// Enables `aligned_alloc_flags`; costs all extras and moves the
    /// partition outside the cage's extras-carrying pools so smart-pointer
    /// front-ends can tell by a membership test.
    AlignedAlloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptThreadCache {
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptQuarantine {
    Disallowed,
    Allowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptCookies {
    Disallowed,
    Allowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptRefCount {
    Disallowed,
    Allowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptPcScan {
    /// For value partitions known to hold no pointers; no quarantine
    /// bitmaps are ever committed.
    AlwaysDisabled,
    /// Off until `enable_pcscan()` is called.
    DisabledByDefault,
    /// On from creation.
    Enabled,
}

/// Immutable-after-init configuration of a root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub alignment: Alignment,
    pub thread_cache: OptThreadCache,
    pub quarantine: OptQuarantine,
    pub cookies: OptCookies,
    pub ref_count: OptRefCount,
    pub pcscan: OptPcScan,
    pub use_configurable_pool: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        PartitionOptions {
            alignment: Alignment::Regular,
            thread_cache: OptThreadCache::Disabled,
            quarantine: OptQuarantine::Disallowed,
            cookies: OptCookies::Allowed,
            ref_count: OptRefCount::Disallowed,
            pcscan: OptPcScan::AlwaysDisabled,
            use_configurable_pool: false,
        }
    }
}

/// Lock-guarded mutable state of a root.
pub(crate) struct RootInner {
    buckets: [Bucket; NUM_BUCKETS],
    first_super_page: usize,
    last_super_page: usize,
    next_partition_page: usize,
    next_partition_page_end: usize,
    pub(crate) direct_map_list: *mut DirectMapExtent,
    global_empty_slot_span_ring: [*mut PartitionPageMeta; MAX_FREEABLE_SPANS],
    global_empty_slot_span_ring_index: usize,
    pub(crate) total_size_of_committed_pages: usize,
    pub(crate) total_size_of_super_pages: usize,
    pub(crate) total_size_of_direct_mapped_pages: usize,
}

impl RootInner {
    pub(crate) fn increase_committed(&mut self, bytes: usize) {
        self.total_size_of_committed_pages += bytes;
        debug_assert!(
            self.total_size_of_committed_pages
                <= self.total_size_of_super_pages + self.total_size_of_direct_mapped_pages
        );
    }

    pub(crate) fn decrease_committed(&mut self, bytes: usize) {
        debug_assert!(self.total_size_of_committed_pages >= bytes);
        self.total_size_of_committed_pages -= bytes;
    }
}

pub struct PartitionRoot {
    pub(crate) lock: PartitionLock,
    inner: UnsafeCell<RootInner>,

    // Flags accessed on fast paths; immutable after init.
    pub(crate) allow_extras: bool,
    pub(crate) use_cookies: bool,
    pub(crate) use_ref_count: bool,
    pub(crate) scannable: bool,
    pub(crate) pool: PoolHandle,
    with_thread_cache: AtomicBool,
    quarantine_enabled: AtomicBool,
    current_partition_tag: AtomicU16,
    inverted_self: AtomicUsize,
    initialized: AtomicBool,
    options: PartitionOptions,
}

// The inner state is guarded by `lock`; everything else is atomic or
// immutable after init.
unsafe impl Send for PartitionRoot {}
unsafe impl Sync for PartitionRoot {}

impl PartitionRoot {
    /// Creates and initializes a root. Prefer `PartitionAllocator`, which
    /// also wires the root into the memory reclaimer.
    pub fn new(options: PartitionOptions) -> Box<PartitionRoot> {
        cage::init();

        let allow_extras = options.alignment == Alignment::Regular;
        let use_cookies = allow_extras && options.cookies == OptCookies::Allowed;
        let use_ref_count = allow_extras
            && build_config::USE_BACKUP_REF_PTR
            && options.ref_count == OptRefCount::Allowed;
        let scannable = options.pcscan != OptPcScan::AlwaysDisabled
            && options.quarantine == OptQuarantine::Allowed;

        let pool = if options.alignment == Alignment::AlignedAlloc
            || options.use_configurable_pool
        {
            cage::configurable_pool()
        } else if use_ref_count {
            cage::brp_pool()
        } else {
            cage::non_brp_pool()
        };

        let root = Box::new(PartitionRoot {
            lock: PartitionLock::new(),
            inner: UnsafeCell::new(RootInner {
                buckets: core::array::from_fn(Bucket::init),
                first_super_page: 0,
                last_super_page: 0,
                next_partition_page: 0,
                next_partition_page_end: 0,
                direct_map_list: core::ptr::null_mut(),
                global_empty_slot_span_ring: [core::ptr::null_mut(); MAX_FREEABLE_SPANS],
                global_empty_slot_span_ring_index: 0,
                total_size_of_committed_pages: 0,
                total_size_of_super_pages: 0,
                total_size_of_direct_mapped_pages: 0,
            }),
            allow_extras,
            use_cookies,
            use_ref_count,
            scannable,
            pool,
            with_thread_cache: AtomicBool::new(false),
            quarantine_enabled: AtomicBool::new(false),
            current_partition_tag: AtomicU16::new(0),
            inverted_self: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            options,
        });

        root.inverted_self
            .store(!(root.as_ref() as *const PartitionRoot as usize), Ordering::Release);

        if build_config::THREAD_CACHE_SUPPORTED
            && options.thread_cache == OptThreadCache::Enabled
        {
            thread_cache::init_for_root(root.as_ref());
            root.with_thread_cache.store(true, Ordering::Release);
        }

        root.initialized.store(true, Ordering::Release);

        if options.pcscan == OptPcScan::Enabled {
            root.enable_pcscan();
        }

        root
    }

    #[inline]
    pub(crate) unsafe fn inner_locked(&self) -> &mut RootInner {
        // Caller holds `self.lock`.
        &mut *self.inner.get()
    }

    #[inline]
    pub fn with_thread_cache(&self) -> bool {
        self.with_thread_cache.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_quarantine_enabled(&self) -> bool {
        self.quarantine_enabled.load(Ordering::Acquire)
    }

    /// Next MTE-style partition tag; skips zero so a zeroed slot never
    /// carries a valid tag. Storage is a no-op on targets without memory
    /// tagging, the counter semantics are kept.
    pub fn get_new_partition_tag(&self) -> u16 {
        let mut tag = self.current_partition_tag.fetch_add(1, Ordering::Relaxed) + 1;
        if tag == 0 {
            tag = self.current_partition_tag.fetch_add(1, Ordering::Relaxed) + 1;
        }
        tag
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    #[inline]
    pub fn alloc(&self, size: usize, type_name: &'static str) -> *mut u8 {
        self.alloc_flags(0, size, type_name)
    }

    pub fn alloc_flags(&self, flags: u32, size: usize, type_name: &'static str) -> *mut u8 {
        if hooks::are_hooks_armed() {
            if let Some(overridden) = hooks::allocation_override(flags, size, type_name) {
                hooks::allocation_observed(overridden, size, type_name);
                return overridden;
            }
            let result = self.alloc_flags_no_hooks(flags, size);
            hooks::allocation_observed(result, size, type_name);
            return result;
        }
        self.alloc_flags_no_hooks(flags, size)
    }

    /// Allocation without hook dispatch; used internally (scanner metadata,
    /// thread-cache storage) and by `alloc_flags`.
    pub fn alloc_flags_no_hooks(&self, flags: u32, size: usize) -> *mut u8 {
        debug_assert!(self.initialized.load(Ordering::Acquire));
        let raw_size = self.adjust_size_add(size);
        if raw_size > MAX_DIRECT_MAPPED {
            if flags & ALLOC_RETURN_NULL != 0 {
                return core::ptr::null_mut();
            }
            crate::oom::partition_oom(size);
        }

        let allocation = match sizes::size_to_bucket_index(raw_size) {
            Some(index) => self.alloc_bucketed(flags, index, raw_size),
            None => {
                let _guard = self.lock.lock();
                let inner = unsafe { self.inner_locked() };
                unsafe { direct_map::alloc(self, inner, flags, raw_size) }
            }
        };

        match allocation {
            Some((slot_start, utilized)) => unsafe {
                self.finish_allocation(slot_start, utilized, flags, size)
            },
            None => core::ptr::null_mut(),
        }
    }

    fn alloc_bucketed(
        &self,
        flags: u32,
        index: usize,
        raw_size: usize,
    ) -> Option<(usize, usize)> {
        let utilized = sizes::bucket_slot_size(index);

        if build_config::THREAD_CACHE_SUPPORTED && self.with_thread_cache() {
            if let Some(slot_start) = thread_cache::allocate(self, index) {
                return Some((slot_start, utilized));
            }
        }

        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };
        unsafe { self.alloc_from_bucket_locked(inner, index, flags, raw_size) }
            .map(|slot_start| (slot_start, utilized))
    }

    /// The central slow path: pops the active span's freelist, provisions
    /// fresh slots, resurrects empty or decommitted spans, and finally
    /// carves new spans out of (possibly new) super pages.
    ///
    /// # Safety
    /// Caller holds the root lock; `inner` is this root's state.
    pub(crate) unsafe fn alloc_from_bucket_locked(
        &self,
        inner: &mut RootInner,
        index: usize,
        flags: u32,
        _raw_size: usize,
    ) -> Option<usize> {
        debug_assert!(inner.buckets[index].is_valid());

        if inner.buckets[index].set_new_active_slot_span() {
            let span = inner.buckets[index].active_head;
            return Some(Self::take_slot_from_span(span));
        }

        // Empty spans keep their freelist and commit; cheapest revival.
        loop {
            let span = inner.buckets[index].empty_head;
            if span.is_null() {
                break;
            }
            inner.buckets[index].empty_head = (*span).next_span;
            if (*span).is_decommitted() {
                // The empty ring got to it first.
                (*span).next_span = inner.buckets[index].decommitted_head;
                inner.buckets[index].decommitted_head = span;
                continue;
            }
            inner.buckets[index].push_active(span);
            return Some(Self::take_slot_from_span(span));
        }

        // Decommitted spans need their pages back first.
        let span = inner.buckets[index].decommitted_head;
        if !span.is_null() {
            inner.buckets[index].decommitted_head = (*span).next_span;
            let span_start = slot_span_start(span);
            let footprint =
                inner.buckets[index].partition_pages_per_span() * PARTITION_PAGE_SIZE;
            if !page::recommit_system_pages(span_start, footprint, PageAccess::ReadWrite) {
                if flags & ALLOC_RETURN_NULL != 0 {
                    // Put it back; the request fails but the span is fine.
                    (*span).next_span = inner.buckets[index].decommitted_head;
                    inner.buckets[index].decommitted_head = span;
                    return None;
                }
                crate::oom::partition_oom(footprint);
            }
            inner.increase_committed(footprint);
            (*span).set_decommitted(false);
            (*span).freelist_head = core::ptr::null_mut();
            (*span).num_allocated_slots = 0;
            (*span).num_unprovisioned_slots = (*span).total_slots() as u16;
            inner.buckets[index].push_active(span);
            return Some(Self::take_slot_from_span(span));
        }

        // A fresh span, from the current super page or a new one.
        let span = self.alloc_new_slot_span(inner, index, flags)?;
        inner.buckets[index].push_active(span);
        Some(Self::take_slot_from_span(span))
    }

    /// Pops the freelist or provisions the next fresh slot. The span must
    /// be active.
    unsafe fn take_slot_from_span(span: *mut PartitionPageMeta) -> usize {
        let head = (*span).freelist_head;
        if !head.is_null() {
            let next = (*head).get_next();
            (*span).freelist_head = next;
            (*span).num_allocated_slots += 1;
            let slot_start = (*head).clear_for_allocation() as usize;
            freeslot_bitmap::mark_used_verify(slot_start);
            return slot_start;
        }

        debug_assert!((*span).num_unprovisioned_slots > 0);
        let provisioned = (*span).total_slots() - (*span).num_unprovisioned_slots as usize;
        let slot_start = slot_span_start(span) + provisioned * (*span).slot_size();
        (*span).num_unprovisioned_slots -= 1;
        (*span).num_allocated_slots += 1;
        slot_start
    }

    unsafe fn alloc_new_slot_span(
        &self,
        inner: &mut RootInner,
        index: usize,
        flags: u32,
    ) -> Option<*mut PartitionPageMeta> {
        let partition_pages = inner.buckets[index].partition_pages_per_span();
        let span_bytes = partition_pages * PARTITION_PAGE_SIZE;

        if inner.next_partition_page + span_bytes > inner.next_partition_page_end {
            self.alloc_new_super_page(inner, flags)?;
        }

        let span_start = inner.next_partition_page;
        inner.next_partition_page += span_bytes;

        let super_page = super_page_base_of(span_start);
        let first_index =
            (span_start & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT;
        let head = partition_page_meta(super_page, first_index);
        (*head).bucket_index = index as u16;
        (*head).freelist_head = core::ptr::null_mut();
        (*head).next_span = core::ptr::null_mut();
        (*head).raw_size = 0;
        (*head).num_allocated_slots = 0;
        (*head).num_unprovisioned_slots = (*head).total_slots() as u16;
        (*head).slot_span_metadata_offset = 0;
        (*head).empty_cache_index = -1;
        (*head).flags = 0;
        for trailing in 1..partition_pages {
            let meta = partition_page_meta(super_page, first_index + trailing);
            (*meta).bucket_index = index as u16;
            (*meta).slot_span_metadata_offset = trailing as u16;
        }
        Some(head)
    }

    unsafe fn alloc_new_super_page(&self, inner: &mut RootInner, flags: u32) -> Option<()> {
        let reservation =
            match AddressPoolManager::instance().reserve(self.pool, None, SUPER_PAGE_SIZE) {
                Some(address) => address,
                None => {
                    if flags & ALLOC_RETURN_NULL != 0 {
                        return None;
                    }
                    crate::oom::partition_oom(SUPER_PAGE_SIZE);
                }
            };

        let mut committed = SUPER_PAGE_METADATA_SIZE + SUPER_PAGE_PAYLOAD_SIZE;
        let commit_ok = page::recommit_system_pages(
            reservation + SUPER_PAGE_METADATA_OFFSET,
            SUPER_PAGE_METADATA_SIZE,
            PageAccess::ReadWrite,
        ) && page::recommit_system_pages(
            reservation + SUPER_PAGE_PAYLOAD_OFFSET,
            SUPER_PAGE_PAYLOAD_SIZE,
            PageAccess::ReadWrite,
        );
        if !commit_ok {
            AddressPoolManager::instance().unreserve_and_decommit(
                self.pool,
                reservation,
                SUPER_PAGE_SIZE,
            );
            if flags & ALLOC_RETURN_NULL != 0 {
                return None;
            }
            crate::oom::partition_oom(SUPER_PAGE_SIZE);
        }

        if self.is_quarantine_enabled() {
            committed += scan::commit_quarantine_bitmaps(reservation);
        }
        if build_config::USE_FREESLOT_BITMAP {
            let ok = page::recommit_system_pages(
                reservation + freeslot_bitmap::FREESLOT_BITMAP_OFFSET,
                PARTITION_PAGE_SIZE,
                PageAccess::ReadWrite,
            );
            debug_assert!(ok);
            committed += PARTITION_PAGE_SIZE;
        }

        slot_span::init_super_page_metadata(
            reservation,
            self as *const PartitionRoot,
            SuperPageKind::NormalBuckets,
            self.scannable,
        );

        if inner.first_super_page == 0 {
            inner.first_super_page = reservation;
        } else {
            (*super_page_header(inner.last_super_page)).next_super_page = reservation;
        }
        inner.last_super_page = reservation;
        inner.total_size_of_super_pages += SUPER_PAGE_SIZE;
        inner.increase_committed(committed);
        inner.next_partition_page = reservation + SUPER_PAGE_PAYLOAD_OFFSET;
        inner.next_partition_page_end = reservation + SUPER_PAGE_PAYLOAD_END_OFFSET;
        Some(())
    }

    /// Writes extras and zero-fill, returning the user pointer.
    unsafe fn finish_allocation(
        &self,
        slot_start: usize,
        utilized: usize,
        flags: u32,
        requested_size: usize,
    ) -> *mut u8 {
        if self.use_cookies {
            extras::write_cookies(self, slot_start, utilized);
        }
        if self.use_ref_count {
            PartitionRefCount::init_at(slot_start + utilized - REF_COUNT_SIZE);
        }
        if self.allow_extras {
            // Tag counter semantics are kept even where tag storage is a
            // no-op (non-MTE targets).
            let _ = self.get_new_partition_tag();
        }
        let user = (slot_start + self.extras_offset()) as *mut u8;
        if flags & ALLOC_ZERO_FILL != 0 {
            core::ptr::write_bytes(user, 0, requested_size);
        }
        user
    }

    // ---------------------------------------------------------------
    // Free
    // ---------------------------------------------------------------

    /// Frees a pointer previously returned by any root's allocation path.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this allocator, and its
    /// owning `PartitionAllocator` must still be alive.
    pub unsafe fn free(ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if hooks::are_hooks_armed() {
            if hooks::free_override(ptr) {
                hooks::free_observed(ptr);
                return;
            }
            hooks::free_observed(ptr);
        }
        Self::free_no_hooks(ptr)
    }

    /// # Safety
    /// As `free`.
    pub unsafe fn free_no_hooks(ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let super_page = super_page_base_of(ptr as usize);
        let header = &*super_page_header(super_page);
        let root = Self::resolve_root(header.root);
        root.free_inner(ptr, header.kind)
    }

    #[inline]
    unsafe fn resolve_root(root: *const PartitionRoot) -> &'static PartitionRoot {
        let root_ref = &*root;
        if root_ref.inverted_self.load(Ordering::Relaxed) != !(root as usize) {
            root_integrity_violated();
        }
        root_ref
    }

    unsafe fn free_inner(&self, ptr: *mut u8, kind: SuperPageKind) {
        let slot_start = ptr as usize - self.extras_offset();
        let span = slot_span_from_ptr(slot_start);
        let utilized = (*span).utilized_slot_size();

        // Cookie verification runs before any other bookkeeping so that a
        // corrupting use-after-free crashes deterministically, before the
        // ref count is touched.
        if self.use_cookies {
            extras::check_cookies(self, slot_start, utilized);
        }

        if kind == SuperPageKind::NormalBuckets && self.is_quarantine_enabled() {
            scan::move_to_quarantine(self, slot_start, (*span).slot_size());
            return;
        }

        if self.use_ref_count {
            let rc = ref_count_ptr(slot_start, utilized);
            if !rc.release_from_allocator() {
                // A smart pointer still holds a protective reference; the
                // slot is retained until the last release.
                return;
            }
        }

        if kind == SuperPageKind::DirectMap {
            let _guard = self.lock.lock();
            let inner = self.inner_locked();
            direct_map::free(self, inner, slot_start);
            return;
        }

        let index = (*span).bucket_index as usize;
        if build_config::THREAD_CACHE_SUPPORTED
            && self.with_thread_cache()
            && thread_cache::maybe_put_in_cache(self, slot_start, index)
        {
            return;
        }

        let _guard = self.lock.lock();
        let inner = self.inner_locked();
        self.raw_free_locked(inner, slot_start, span);
    }

    /// Physically frees a quarantined slot, bypassing the quarantine. Used
    /// by the scanner's sweep phase.
    ///
    /// # Safety
    /// `slot_start`/`span` must denote a quarantined slot of this root.
    pub(crate) unsafe fn free_no_hooks_immediate(
        &self,
        slot_start: usize,
        span: *mut PartitionPageMeta,
    ) {
        let utilized = (*span).utilized_slot_size();
        if self.use_cookies {
            extras::check_cookies(self, slot_start, utilized);
        }
        if self.use_ref_count {
            let rc = ref_count_ptr(slot_start, utilized);
            if !rc.release_from_allocator() {
                return;
            }
        }
        let _guard = self.lock.lock();
        let inner = self.inner_locked();
        self.raw_free_locked(inner, slot_start, span);
    }

    /// Freelist push plus span state transitions.
    ///
    /// # Safety
    /// Caller holds the root lock; `slot_start` is a live slot of `span`.
    pub(crate) unsafe fn raw_free_locked(
        &self,
        inner: &mut RootInner,
        slot_start: usize,
        span: *mut PartitionPageMeta,
    ) {
        let was_full = (*span).is_full();
        let entry = FreelistEntry::init_in_slot(slot_start as *mut u8, (*span).freelist_head);
        (*span).freelist_head = entry;
        freeslot_bitmap::mark_free(slot_start);
        debug_assert!((*span).num_allocated_slots > 0);
        (*span).num_allocated_slots -= 1;

        let index = (*span).bucket_index as usize;
        if was_full && !(*span).in_active_list() {
            // The allocation scan had filed it as full; resurface it.
            debug_assert!(inner.buckets[index].num_full_slot_spans > 0);
            inner.buckets[index].num_full_slot_spans -= 1;
            inner.buckets[index].push_active(span);
        }

        if (*span).num_allocated_slots == 0 {
            self.register_empty_slot_span(inner, span);
        }
    }

    /// Raw-path free used where the span is not at hand (thread-cache
    /// clearing). Resolves the span itself; the lock must be held.
    ///
    /// # Safety
    /// As `raw_free_locked`.
    pub(crate) unsafe fn raw_free_locked_no_span(
        &self,
        inner: &mut RootInner,
        slot_start: usize,
    ) {
        let span = slot_span_from_ptr(slot_start);
        self.raw_free_locked(inner, slot_start, span);
    }

    /// Files a newly-empty span in the bounded ring, decommitting the
    /// evicted victim.
    unsafe fn register_empty_slot_span(
        &self,
        inner: &mut RootInner,
        span: *mut PartitionPageMeta,
    ) {
        if (*span).empty_cache_index >= 0 {
            // Already ringed, unless the ring slot was since overwritten
            // while the span was briefly back in use.
            let slot = (*span).empty_cache_index as usize;
            if inner.global_empty_slot_span_ring[slot] == span {
                return;
            }
            (*span).empty_cache_index = -1;
        }
        let index = inner.global_empty_slot_span_ring_index;
        let victim = inner.global_empty_slot_span_ring[index];
        if !victim.is_null() && victim != span && (*victim).is_empty() {
            self.decommit_slot_span(inner, victim);
        }
        inner.global_empty_slot_span_ring[index] = span;
        (*span).empty_cache_index = index as i16;
        inner.global_empty_slot_span_ring_index = (index + 1) % MAX_FREEABLE_SPANS;
    }

    unsafe fn decommit_slot_span(&self, inner: &mut RootInner, span: *mut PartitionPageMeta) {
        debug_assert!((*span).is_empty());
        (*span).empty_cache_index = -1;
        // Never pull pages out from under a concurrent scan; the span
        // stays in the ring's past and a later purge gets it.
        if self.scannable && scan::is_in_progress() {
            return;
        }

        let span_start = slot_span_start(span);
        let index = (*span).bucket_index as usize;
        let footprint =
            inner.buckets[index].partition_pages_per_span() * PARTITION_PAGE_SIZE;
        page::decommit_system_pages(span_start, footprint);
        inner.decrease_committed(footprint);

        if build_config::USE_FREESLOT_BITMAP {
            let slot_size = (*span).slot_size();
            for slot in 0..(*span).total_slots() {
                freeslot_bitmap::mark_used(span_start + slot * slot_size);
            }
        }

        (*span).set_decommitted(true);
        (*span).freelist_head = core::ptr::null_mut();
        (*span).num_unprovisioned_slots = (*span).total_slots() as u16;
    }

    // ---------------------------------------------------------------
    // Realloc
    // ---------------------------------------------------------------

    /// # Safety
    /// `ptr` must be null or a live allocation of this root.
    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        self.realloc_flags(0, ptr, new_size, type_name)
    }

    /// Like `realloc`, but returns null (leaving `ptr` valid) when the
    /// allocation cannot be satisfied.
    ///
    /// # Safety
    /// As `realloc`.
    pub unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        self.realloc_flags(ALLOC_RETURN_NULL, ptr, new_size, type_name)
    }

    /// # Safety
    /// As `realloc`.
    pub unsafe fn realloc_flags(
        &self,
        flags: u32,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_flags(flags, new_size, type_name);
        }
        if new_size == 0 {
            Self::free(ptr);
            return core::ptr::null_mut();
        }

        let new_raw_size = self.adjust_size_add(new_size);
        if new_raw_size > MAX_DIRECT_MAPPED {
            if flags & ALLOC_RETURN_NULL != 0 {
                return core::ptr::null_mut();
            }
            crate::oom::partition_oom(new_size);
        }

        let slot_start = ptr as usize - self.extras_offset();
        let span = slot_span_from_ptr(slot_start);
        let old_utilized = (*span).utilized_slot_size();
        if self.use_cookies {
            extras::check_cookies(self, slot_start, old_utilized);
        }
        let old_usable = old_utilized - self.extras_total();

        if (*span).bucket_index == DIRECT_MAP_BUCKET {
            if self.try_realloc_direct_mapped_in_place(slot_start, old_utilized, new_raw_size)
            {
                return ptr;
            }
        } else if sizes::size_to_bucket_index(new_raw_size)
            == Some((*span).bucket_index as usize)
        {
            // Same bucket: the slot already fits and the utilized size (and
            // with it every extra's position) is unchanged.
            return ptr;
        }

        let new_ptr = self.alloc_flags(flags, new_size, type_name);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
        Self::free(ptr);
        new_ptr
    }

    unsafe fn try_realloc_direct_mapped_in_place(
        &self,
        slot_start: usize,
        old_utilized: usize,
        new_raw_size: usize,
    ) -> bool {
        let _guard = self.lock.lock();
        let inner = self.inner_locked();

        // Snapshot the ref count before the tail moves (a shrink decommits
        // the region the old count lives in).
        let saved_ref_count = if self.use_ref_count {
            Some(ref_count_ptr(slot_start, old_utilized).raw_value())
        } else {
            None
        };

        if !direct_map::realloc_in_place(self, inner, slot_start, new_raw_size) {
            return false;
        }

        let new_utilized = (*slot_span_from_ptr(slot_start)).utilized_slot_size();
        if self.use_cookies {
            extras::write_cookies(self, slot_start, new_utilized);
        }
        if let Some(value) = saved_ref_count {
            PartitionRefCount::restore_at(
                slot_start + new_utilized - REF_COUNT_SIZE,
                value,
            );
        }
        true
    }

    // ---------------------------------------------------------------
    // Aligned allocation
    // ---------------------------------------------------------------

    /// Returns memory aligned on `alignment`, or null. `alignment` must be
    /// a power of two, a multiple of the pointer size, and no larger than
    /// a partition page; the root must have been configured with
    /// `Alignment::AlignedAlloc` (extras shift alignment and are therefore
    /// incompatible).
    pub fn aligned_alloc_flags(&self, flags: u32, alignment: usize, size: usize) -> *mut u8 {
        if !alignment.is_power_of_two()
            || alignment % core::mem::size_of::<usize>() != 0
        {
            return core::ptr::null_mut();
        }
        debug_assert!(!self.allow_extras);
        if self.allow_extras || alignment > PARTITION_PAGE_SIZE {
            return core::ptr::null_mut();
        }

        if alignment <= MIN_SLOT_ALIGNMENT || size > MAX_BUCKETED {
            // Slot granule alignment is free; direct-mapped slots start on
            // a partition page boundary, which covers every alignment we
            // accept.
            let result = self.alloc_flags_no_hooks(flags, size);
            debug_assert!(result.is_null() || result as usize % alignment == 0);
            return result;
        }

        // Power-of-two slots are naturally aligned within their span.
        let target = size.max(alignment).next_power_of_two();
        let result = self.alloc_flags_no_hooks(flags, target);
        debug_assert!(result.is_null() || result as usize % alignment == 0);
        result
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// The user-visible size a request of `size` would actually receive.
    pub fn actual_size(&self, size: usize) -> usize {
        let raw_size = self.adjust_size_add(size);
        match sizes::size_to_bucket_index(raw_size) {
            Some(index) => sizes::bucket_slot_size(index) - self.extras_total(),
            None if raw_size <= MAX_DIRECT_MAPPED => {
                direct_map::direct_map_slot_size(raw_size) - self.extras_total()
            }
            // Too large to allocate: unchanged.
            None => size,
        }
    }

    /// Usable size of a live allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn get_usable_size(ptr: *mut u8) -> usize {
        let super_page = super_page_base_of(ptr as usize);
        let root = Self::resolve_root((*super_page_header(super_page)).root);
        let slot_start = ptr as usize - root.extras_offset();
        let span = slot_span_from_ptr(slot_start);
        (*span).utilized_slot_size() - root.extras_total()
    }

    // ---------------------------------------------------------------
    // Purging
    // ---------------------------------------------------------------

    pub fn purge_memory(&self, flags: u32) {
        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };
        if flags & PURGE_DECOMMIT_EMPTY_SLOT_SPANS != 0 {
            unsafe { self.decommit_empty_slot_spans(inner) };
        }
        if flags & PURGE_DISCARD_UNUSED_SYSTEM_PAGES != 0 {
            unsafe { self.discard_unused_system_pages(inner) };
        }
    }

    unsafe fn decommit_empty_slot_spans(&self, inner: &mut RootInner) {
        for index in 0..MAX_FREEABLE_SPANS {
            let span = inner.global_empty_slot_span_ring[index];
            if span.is_null() {
                continue;
            }
            if (*span).is_empty() {
                self.decommit_slot_span(inner, span);
            } else {
                (*span).empty_cache_index = -1;
            }
            inner.global_empty_slot_span_ring[index] = core::ptr::null_mut();
        }
        inner.global_empty_slot_span_ring_index = 0;
    }

    /// Hints the OS that freelist-covered and unprovisioned system pages
    /// are reclaimable, without giving up the commit.
    unsafe fn discard_unused_system_pages(&self, inner: &mut RootInner) {
        for index in 0..NUM_BUCKETS {
            let bucket = &inner.buckets[index];
            if !bucket.is_valid() {
                continue;
            }
            let mut span = bucket.active_head;
            while !span.is_null() {
                if !(*span).is_decommitted() {
                    Self::discard_in_span(span);
                }
                span = (*span).next_span;
            }
        }
    }

    unsafe fn discard_in_span(span: *mut PartitionPageMeta) {
        let span_start = slot_span_start(span);
        let slot_size = (*span).slot_size();

        // Unprovisioned tail: pages past the provisioned prefix are clean.
        let provisioned_end = span_start + (*span).provisioned_bytes();
        let committed_end = span_start
            + sizes::bucket_partition_pages_per_span((*span).bucket_index as usize)
                * PARTITION_PAGE_SIZE;
        let tail_begin = align_up(provisioned_end, SYSTEM_PAGE_SIZE);
        if tail_begin < committed_end {
            page::discard_system_pages(tail_begin, committed_end - tail_begin);
        }

        // Whole system pages inside free slots are discardable; only worth
        // the freelist walk for page-sized-or-larger slots.
        if slot_size >= SYSTEM_PAGE_SIZE {
            let mut entry = (*span).freelist_head;
            while !entry.is_null() {
                let next = (*entry).get_next();
                let slot = entry as usize;
                // Keep the freelist entry words themselves resident.
                let begin = align_up(slot + 2 * core::mem::size_of::<usize>(), SYSTEM_PAGE_SIZE);
                let end = align_down(slot + slot_size, SYSTEM_PAGE_SIZE);
                if begin < end {
                    page::discard_system_pages(begin, end - begin);
                }
                entry = next;
            }
        }
    }

    // ---------------------------------------------------------------
    // Quarantine scanning
    // ---------------------------------------------------------------

    /// Arms the quarantine for this root: commits the quarantine bitmaps
    /// of every existing super page and registers with the scanner. A root
    /// configured `AlwaysDisabled` silently ignores the request.
    pub fn enable_pcscan(&self) {
        if !self.scannable || self.is_quarantine_enabled() {
            return;
        }
        {
            let _guard = self.lock.lock();
            let inner = unsafe { self.inner_locked() };
            let mut super_page = inner.first_super_page;
            while super_page != 0 {
                let committed = scan::commit_quarantine_bitmaps(super_page);
                inner.increase_committed(committed);
                super_page = unsafe { (*super_page_header(super_page)).next_super_page };
            }
            self.quarantine_enabled.store(true, Ordering::Release);
        }
        scan::register_scannable_root(self);
    }

    /// Snapshot of every super page base currently owned by this root.
    pub(crate) fn super_pages_snapshot(&self) -> Vec<usize> {
        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };
        let mut pages = Vec::new();
        let mut super_page = inner.first_super_page;
        while super_page != 0 {
            pages.push(super_page);
            super_page = unsafe { (*super_page_header(super_page)).next_super_page };
        }
        pages
    }

    /// Scan-area snapshot for the scanner: `(payload_begin, payload_end,
    /// slot_size)` of every active or full slot span. Taken under the root
    /// lock.
    pub(crate) fn scan_areas_snapshot(&self) -> Vec<(usize, usize, usize)> {
        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };
        let mut areas = Vec::new();
        let mut super_page = inner.first_super_page;
        while super_page != 0 {
            unsafe {
                let mut index = FIRST_PAYLOAD_PARTITION_PAGE;
                while index <= LAST_PAYLOAD_PARTITION_PAGE {
                    let meta = partition_page_meta(super_page, index);
                    if (*meta).slot_span_metadata_offset != 0
                        || (*meta).bucket_index as usize >= NUM_BUCKETS
                    {
                        index += 1;
                        continue;
                    }
                    let span_pages = sizes::bucket_partition_pages_per_span(
                        (*meta).bucket_index as usize,
                    );
                    // Only spans the bump pointer has reached carry state.
                    let span_start = super_page + (index << PARTITION_PAGE_SHIFT);
                    if span_start >= inner.next_partition_page
                        && super_page == inner.last_super_page
                    {
                        break;
                    }
                    if !(*meta).is_decommitted() && (*meta).num_allocated_slots > 0 {
                        areas.push((
                            span_start,
                            span_start + (*meta).provisioned_bytes(),
                            (*meta).slot_size(),
                        ));
                    }
                    index += span_pages.max(1);
                }
            }
            super_page = unsafe { (*super_page_header(super_page)).next_super_page };
        }
        areas
    }

    // ---------------------------------------------------------------
    // Statistics
    // ---------------------------------------------------------------

    pub fn total_size_of_committed_pages(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { self.inner_locked() }.total_size_of_committed_pages
    }

    pub fn dump_stats(
        &self,
        partition_name: &str,
        is_light_dump: bool,
        dumper: &mut dyn PartitionStatsDumper,
    ) {
        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };

        let mut totals = PartitionMemoryStats {
            total_mmapped_bytes: inner.total_size_of_super_pages
                + inner.total_size_of_direct_mapped_pages,
            total_committed_bytes: inner.total_size_of_committed_pages,
            ..Default::default()
        };

        if !is_light_dump {
            for index in 0..NUM_BUCKETS {
                let bucket = &inner.buckets[index];
                if !bucket.is_valid() {
                    continue;
                }
                let stats = unsafe { Self::bucket_stats(bucket) };
                totals.total_resident_bytes += stats.resident_bytes as usize;
                totals.total_active_bytes += stats.active_bytes as usize;
                totals.total_decommittable_bytes += stats.decommittable_bytes as usize;
                if stats.num_active_slot_spans != 0
                    || stats.num_empty_slot_spans != 0
                    || stats.num_full_slot_spans != 0
                    || stats.num_decommitted_slot_spans != 0
                {
                    dumper.partition_dump_bucket_stats(partition_name, &stats);
                }
            }
            let mut extent = inner.direct_map_list;
            while !extent.is_null() {
                unsafe {
                    let stats = PartitionBucketMemoryStats {
                        is_valid: true,
                        is_direct_map: true,
                        bucket_slot_size: (*extent).committed_slot_bytes as u32,
                        allocated_slot_span_size: (*extent).reservation_size as u32,
                        active_bytes: (*extent).raw_size as u32,
                        resident_bytes: (*extent).committed_slot_bytes as u32,
                        ..Default::default()
                    };
                    totals.total_resident_bytes += stats.resident_bytes as usize;
                    totals.total_active_bytes += stats.active_bytes as usize;
                    dumper.partition_dump_bucket_stats(partition_name, &stats);
                    extent = (*extent).next;
                }
            }
        }

        dumper.partition_dump_totals(partition_name, &totals);
    }

    unsafe fn bucket_stats(bucket: &Bucket) -> PartitionBucketMemoryStats {
        let slot_size = bucket.slot_size;
        let footprint =
            (bucket.partition_pages_per_span() * PARTITION_PAGE_SIZE) as u32;
        let mut stats = PartitionBucketMemoryStats {
            is_valid: true,
            is_direct_map: false,
            bucket_slot_size: slot_size,
            allocated_slot_span_size: footprint,
            num_full_slot_spans: bucket.num_full_slot_spans as u32,
            ..Default::default()
        };
        let mut span = bucket.active_head;
        while !span.is_null() {
            if (*span).is_decommitted() {
                stats.num_decommitted_slot_spans += 1;
            } else if (*span).is_empty() {
                stats.num_empty_slot_spans += 1;
                stats.decommittable_bytes += footprint;
                stats.resident_bytes += footprint;
            } else {
                if (*span).is_full() {
                    stats.num_full_slot_spans += 1;
                } else {
                    stats.num_active_slot_spans += 1;
                }
                stats.resident_bytes += footprint;
                stats.active_bytes +=
                    (*span).num_allocated_slots as u32 * slot_size;
            }
            span = (*span).next_span;
        }
        let mut span = bucket.empty_head;
        while !span.is_null() {
            if !(*span).is_decommitted() {
                stats.num_empty_slot_spans += 1;
                stats.decommittable_bytes += footprint;
                stats.resident_bytes += footprint;
            }
            span = (*span).next_span;
        }
        let mut span = bucket.decommitted_head;
        while !span.is_null() {
            stats.num_decommitted_slot_spans += 1;
            span = (*span).next_span;
        }
        stats
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    /// Releases every reservation this root holds. Only sound when no
    /// allocation from this root is live anywhere.
    pub(crate) fn release_reservations(&self) {
        let _guard = self.lock.lock();
        let inner = unsafe { self.inner_locked() };
        let manager = AddressPoolManager::instance();

        let mut super_page = inner.first_super_page;
        while super_page != 0 {
            let next = unsafe { (*super_page_header(super_page)).next_super_page };
            manager.unreserve_and_decommit(self.pool, super_page, SUPER_PAGE_SIZE);
            super_page = next;
        }
        inner.first_super_page = 0;
        inner.last_super_page = 0;
        inner.next_partition_page = 0;
        inner.next_partition_page_end = 0;

        let mut extent = inner.direct_map_list;
        while !extent.is_null() {
            unsafe {
                let next = (*extent).next;
                let start = (*extent).reservation_start;
                let size = (*extent).reservation_size;
                crate::address::offset_table::clear_offsets(start, size);
                manager.unreserve_and_decommit(self.pool, start, size);
                extent = next;
            }
        }
        inner.direct_map_list = core::ptr::null_mut();
        inner.global_empty_slot_span_ring = [core::ptr::null_mut(); MAX_FREEABLE_SPANS];
        inner.total_size_of_committed_pages = 0;
        inner.total_size_of_super_pages = 0;
        inner.total_size_of_direct_mapped_pages = 0;
    }
}

/// Owning wrapper tying a root's lifetime to the reclaimer registration,
/// the way embedders are expected to hold partitions.
pub struct PartitionAllocator {
    root: Box<PartitionRoot>,
}

impl PartitionAllocator {
    pub fn new(options: PartitionOptions) -> PartitionAllocator {
        let root = PartitionRoot::new(options);
        crate::reclaim::MemoryReclaimer::instance().register(root.as_ref());
        PartitionAllocator { root }
    }

    #[inline]
    pub fn root(&self) -> &PartitionRoot {
        &self.root
    }
}

impl Drop for PartitionAllocator {
    fn drop(&mut self) {
        crate::reclaim::MemoryReclaimer::instance().unregister(self.root.as_ref());
        scan::unregister_root(self.root.as_ref());
        if self.root.scannable {
            // A scan snapshot taken before the unregistration may still
            // reference this root's super pages; let it drain.
            while scan::is_in_progress() {
                std::thread::yield_now();
            }
        }
        if self.root.with_thread_cache() {
            // Thread caches on other threads may still hold this root's
            // slots; the address space is intentionally retained.
            log::warn!("dropping a thread-cached partition: reservations are retained");
            return;
        }
        self.root.release_reservations();
    }
}
