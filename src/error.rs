// # Error Types and Crash Sinks
//
// Two failure classes exist: resource exhaustion, which is recoverable only
// when the caller opts in via `ALLOC_RETURN_NULL`, and corruption, which is
// never recoverable. Corruption-class failures funnel through the dedicated
// sink functions below so that crash stacks name the exact detector that
// fired; the sinks are deliberately not inlined and never tail-called.

use thiserror::Error;

/// Allocator-level errors for the fallible (null-returning) surface.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("out of memory: failed to commit {size} bytes")]
    OutOfMemory { size: usize },

    #[error("allocation size {size} exceeds the direct-map limit")]
    SizeTooLarge { size: usize },

    #[error("invalid alignment {alignment}: must be a power of two and a multiple of the pointer size")]
    InvalidAlignment { alignment: usize },

    #[error("address pool {handle} exhausted while reserving {size} bytes")]
    PoolExhausted { handle: u8, size: usize },
}

/// Address-pool manager errors.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("all {max} pool slots are in use")]
    NoFreePoolSlot { max: usize },

    #[error("pool region {base:#x}+{size:#x} violates alignment invariants")]
    BadPoolGeometry { base: usize, size: usize },
}

macro_rules! crash_sink {
    ($name:ident, $msg:expr) => {
        #[cold]
        #[inline(never)]
        pub fn $name() -> ! {
            // Keep the formatting allocation-free: the allocator may be
            // anywhere on the current call stack.
            log::error!($msg);
            panic!($msg);
        }
    };
}

crash_sink!(
    freelist_corruption_detected,
    "freelist corruption detected: encoded next pointer failed the shadow check"
);
crash_sink!(
    double_free_detected,
    "double free detected: quarantine bit already set for this slot"
);
crash_sink!(
    cookie_corruption_detected,
    "heap corruption detected: allocation cookie mismatch"
);
crash_sink!(
    ref_count_underflow_detected,
    "ref count underflow: released a reference that was never acquired"
);
crash_sink!(
    reentrancy_detected,
    "partition lock acquired reentrantly on the same thread"
);
crash_sink!(invalid_pool_handle, "invalid address pool handle");
crash_sink!(
    root_integrity_violated,
    "partition root integrity check failed: super page metadata does not resolve to a live root"
);
