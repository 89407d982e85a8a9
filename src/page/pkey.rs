// Memory-protection-key tagging. A pool tagged with a pkey is only
// accessible from threads whose PKRU grants that key; everything else takes
// the plain `mprotect` fallback path.

use super::PageAccess;

/// Allocates a protection key for a pool. Returns 0 when keys are
/// unsupported (key 0 is the untagged default key on every platform).
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn pkey_alloc_for_pool() -> u32 {
    if !crate::build_config::ENABLE_PKEYS {
        return 0;
    }
    let key = unsafe { libc::syscall(libc::SYS_pkey_alloc, 0usize, 0usize) };
    if key < 0 {
        // Older kernels and non-MPK hardware land here.
        return 0;
    }
    key as u32
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub fn pkey_alloc_for_pool() -> u32 {
    0
}

/// Protects `[address, address + length)` read-write under `pkey`. Falls
/// back to a plain protect when the key is 0 or the kernel rejects the
/// tagged call.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[must_use]
pub fn tag_memory_with_pkey(pkey: u32, address: usize, length: usize) -> bool {
    if pkey == 0 {
        return super::set_system_pages_access(address, length, PageAccess::ReadWrite);
    }
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pkey_mprotect,
            address,
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            pkey as usize,
        )
    };
    if ret == 0 {
        return true;
    }
    super::set_system_pages_access(address, length, PageAccess::ReadWrite)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
#[must_use]
pub fn tag_memory_with_pkey(_pkey: u32, address: usize, length: usize) -> bool {
    super::set_system_pages_access(address, length, PageAccess::ReadWrite)
}
