// # Page Allocator Facade
//
// Thin layer over the OS virtual-memory primitives: reserve, commit,
// decommit, discard, protect, and (on Linux) memory-protection-key tagging.
// Everything above this module deals in addresses and lengths only; no other
// module issues a syscall.
//
// Reservations are made inaccessible (`PROT_NONE`) and carry `MAP_NORESERVE`
// so multi-gigabyte pools cost address space, not memory. Commit is an
// `mprotect` to the requested access; decommit returns the physical frames
// with `MADV_DONTNEED` and drops access back to none.

mod pkey;

pub use pkey::{pkey_alloc_for_pool, tag_memory_with_pkey};

use crate::constants::{align_up, SYSTEM_PAGE_SIZE};

/// Page protection for reserve/commit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    Inaccessible,
    ReadWrite,
    ReadExecute,
}

#[cfg(unix)]
fn prot_flags(access: PageAccess) -> libc::c_int {
    match access {
        PageAccess::Inaccessible => libc::PROT_NONE,
        PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        PageAccess::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

/// Reserves `length` bytes aligned to `alignment`, with the given initial
/// protection. `pkey` != 0 additionally tags the region with that protection
/// key. Returns the start address, or `None` when the address space request
/// fails.
#[cfg(unix)]
pub fn alloc_pages(
    hint: Option<usize>,
    length: usize,
    alignment: usize,
    access: PageAccess,
    pkey: u32,
) -> Option<usize> {
    alloc_pages_with_align_offset(hint, length, alignment, 0, access, pkey)
}

/// Like `alloc_pages`, but the returned address satisfies
/// `address % alignment == align_offset`. Used by the cage, whose pool stack
/// begins at an offset within its core alignment.
#[cfg(unix)]
pub fn alloc_pages_with_align_offset(
    hint: Option<usize>,
    length: usize,
    alignment: usize,
    align_offset: usize,
    access: PageAccess,
    pkey: u32,
) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(length % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(align_offset < alignment.max(1));

    // Try the cheap path first: the kernel usually returns page-aligned
    // mappings, which satisfies small alignments outright.
    if alignment <= SYSTEM_PAGE_SIZE && align_offset == 0 {
        let address = raw_map(hint, length, access)?;
        finish_mapping(address, length, pkey)?;
        return Some(address);
    }

    // Over-reserve by one alignment unit, then trim both ends down to the
    // aligned window.
    let padded = length.checked_add(alignment)?;
    let mapped = raw_map(hint, padded, access)?;

    let unaligned = mapped.wrapping_sub(align_offset);
    let aligned = align_up(unaligned, alignment).wrapping_add(align_offset);
    debug_assert!(aligned >= mapped && aligned + length <= mapped + padded);

    let head_slack = aligned - mapped;
    let tail_slack = padded - length - head_slack;
    unsafe {
        if head_slack != 0 {
            libc::munmap(mapped as *mut libc::c_void, head_slack);
        }
        if tail_slack != 0 {
            libc::munmap((aligned + length) as *mut libc::c_void, tail_slack);
        }
    }
    finish_mapping(aligned, length, pkey)?;
    Some(aligned)
}

#[cfg(unix)]
fn raw_map(hint: Option<usize>, length: usize, access: PageAccess) -> Option<usize> {
    let addr_hint = hint.unwrap_or(0) as *mut libc::c_void;
    let mapped = unsafe {
        libc::mmap(
            addr_hint,
            length,
            prot_flags(access),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        log::warn!(
            "page reservation of {} bytes failed: {}",
            length,
            std::io::Error::last_os_error()
        );
        return None;
    }
    Some(mapped as usize)
}

#[cfg(unix)]
fn finish_mapping(address: usize, length: usize, pkey: u32) -> Option<()> {
    if pkey != 0 && !tag_memory_with_pkey(pkey, address, length) {
        unsafe {
            libc::munmap(address as *mut libc::c_void, length);
        }
        return None;
    }
    Some(())
}

/// Returns the reservation to the OS.
#[cfg(unix)]
pub fn free_pages(address: usize, length: usize) {
    let ret = unsafe { libc::munmap(address as *mut libc::c_void, length) };
    debug_assert_eq!(ret, 0, "munmap failed");
}

/// Changes protection on an already-reserved range. Returns false on
/// failure (the only expected failure is commit charge exhaustion when
/// moving to an accessible protection).
#[cfg(unix)]
#[must_use]
pub fn set_system_pages_access(address: usize, length: usize, access: PageAccess) -> bool {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(length % SYSTEM_PAGE_SIZE == 0);
    let ret =
        unsafe { libc::mprotect(address as *mut libc::c_void, length, prot_flags(access)) };
    ret == 0
}

/// Returns the range's physical frames to the OS and makes it inaccessible.
/// The address space itself stays reserved.
#[cfg(unix)]
pub fn decommit_system_pages(address: usize, length: usize) {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(length % SYSTEM_PAGE_SIZE == 0);
    unsafe {
        libc::madvise(address as *mut libc::c_void, length, libc::MADV_DONTNEED);
    }
    let ok = set_system_pages_access(address, length, PageAccess::Inaccessible);
    debug_assert!(ok);
}

/// Best-effort decommit for ranges that may not currently be mapped (the
/// pool manager also tracks bookkeeping-only reservations). Returns whether
/// the range was actually decommitted.
#[cfg(unix)]
pub fn try_decommit_system_pages(address: usize, length: usize) -> bool {
    let advised = unsafe {
        libc::madvise(address as *mut libc::c_void, length, libc::MADV_DONTNEED) == 0
    };
    let protected = unsafe {
        libc::mprotect(address as *mut libc::c_void, length, libc::PROT_NONE) == 0
    };
    advised && protected
}

/// Makes a previously decommitted range accessible again. The pages fault
/// in zeroed on next touch.
#[cfg(unix)]
#[must_use]
pub fn recommit_system_pages(address: usize, length: usize, access: PageAccess) -> bool {
    set_system_pages_access(address, length, access)
}

/// Hints that the range's contents are disposable. Cheaper than decommit:
/// access is kept, and the kernel reclaims the frames lazily.
#[cfg(unix)]
pub fn discard_system_pages(address: usize, length: usize) {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(length % SYSTEM_PAGE_SIZE == 0);
    unsafe {
        #[cfg(target_os = "linux")]
        {
            if libc::madvise(address as *mut libc::c_void, length, libc::MADV_FREE) == 0 {
                return;
            }
            // MADV_FREE needs Linux 4.5; fall back to the eager flavor.
        }
        libc::madvise(address as *mut libc::c_void, length, libc::MADV_DONTNEED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SUPER_PAGE_SIZE;

    #[test]
    fn reserve_commit_touch_decommit() {
        let addr = alloc_pages(
            None,
            4 * SYSTEM_PAGE_SIZE,
            SYSTEM_PAGE_SIZE,
            PageAccess::Inaccessible,
            0,
        )
        .expect("reserve");
        assert_eq!(addr % SYSTEM_PAGE_SIZE, 0);

        assert!(set_system_pages_access(
            addr,
            2 * SYSTEM_PAGE_SIZE,
            PageAccess::ReadWrite
        ));
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0xab, 2 * SYSTEM_PAGE_SIZE);
            assert_eq!(*(addr as *const u8), 0xab);
        }

        decommit_system_pages(addr, 2 * SYSTEM_PAGE_SIZE);
        assert!(recommit_system_pages(
            addr,
            2 * SYSTEM_PAGE_SIZE,
            PageAccess::ReadWrite
        ));
        // Decommitted pages come back zeroed.
        unsafe {
            assert_eq!(*(addr as *const u8), 0);
        }

        free_pages(addr, 4 * SYSTEM_PAGE_SIZE);
    }

    #[test]
    fn aligned_reservation_is_aligned() {
        let addr = alloc_pages(
            None,
            SUPER_PAGE_SIZE,
            SUPER_PAGE_SIZE,
            PageAccess::Inaccessible,
            0,
        )
        .expect("reserve super page");
        assert_eq!(addr % SUPER_PAGE_SIZE, 0);
        free_pages(addr, SUPER_PAGE_SIZE);
    }

    #[test]
    fn align_offset_reservation() {
        let offset = 3 * SYSTEM_PAGE_SIZE;
        let addr = alloc_pages_with_align_offset(
            None,
            SYSTEM_PAGE_SIZE * 8,
            SUPER_PAGE_SIZE,
            offset,
            PageAccess::Inaccessible,
            0,
        )
        .expect("reserve with offset");
        assert_eq!(addr % SUPER_PAGE_SIZE, offset);
        free_pages(addr, SYSTEM_PAGE_SIZE * 8);
    }

    #[test]
    fn discard_keeps_access() {
        let addr = alloc_pages(
            None,
            2 * SYSTEM_PAGE_SIZE,
            SYSTEM_PAGE_SIZE,
            PageAccess::ReadWrite,
            0,
        )
        .expect("reserve rw");
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0x5a, SYSTEM_PAGE_SIZE);
        }
        discard_system_pages(addr, SYSTEM_PAGE_SIZE);
        // Still accessible after the discard hint.
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0x11, SYSTEM_PAGE_SIZE);
            assert_eq!(*(addr as *const u8), 0x11);
        }
        free_pages(addr, 2 * SYSTEM_PAGE_SIZE);
    }
}
