// # Build Configuration
//
// Cargo features resolved into plain constants so that every branch
// type-checks in every configuration. Code tests these with ordinary `if`;
// the optimizer removes the dead arms.

/// Whether this build routes the process-wide `malloc` through a partition.
/// The allocator-shim glue is out of scope for this crate, so this is
/// permanently off; reentrancy hardening is kept regardless.
pub const USE_PARTITION_ALLOC_AS_MALLOC: bool = false;

/// Per-slot reference count support for the BackupRefPtr front-end.
pub const USE_BACKUP_REF_PTR: bool = cfg!(feature = "backup-ref-ptr");

/// The ref count lives at the end of the slot, after the trailing cookie.
pub const REF_COUNT_AT_END_OF_ALLOCATION: bool = USE_BACKUP_REF_PTR;

/// Extra verification on every smart-pointer operation.
pub const ENABLE_BACKUP_REF_PTR_SLOW_CHECKS: bool = cfg!(feature = "brp-slow-checks");

/// Memory-protection-key tagging for pool reservations (Linux only).
pub const ENABLE_PKEYS: bool = cfg!(target_os = "linux");

/// Per-super-page used/free slot bitmap, a defense-in-depth check against
/// freelist corruption.
pub const USE_FREESLOT_BITMAP: bool = cfg!(feature = "freeslot-bitmap");

/// Scan-locality card table. Surfaced for configuration parity; the table
/// itself is not built (the scanner snapshots scan areas instead).
pub const STARSCAN_USE_CARD_TABLE: bool = false;

/// Thread-cache code paths are compiled in on all supported targets.
pub const THREAD_CACHE_SUPPORTED: bool = true;

/// Cage-based pool management needs a 64-bit address space; the bitmap
/// classifier covers the rest.
pub const HAS_64_BIT_POINTERS: bool = cfg!(target_pointer_width = "64");

/// Extra consistency checking on slow paths (freelist walks, same-super-page
/// checks). Follows the debug-assertions switch.
pub const DCHECK_IS_ON: bool = cfg!(debug_assertions);
