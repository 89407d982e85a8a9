// # Out-of-Memory Handling
//
// Commit failures are fatal unless the caller passed `ALLOC_RETURN_NULL`.
// Embedders register a process-wide handler (to record crash keys, flush
// telemetry, etc.); the handler runs once and the process then crashes.

use std::sync::atomic::{AtomicUsize, Ordering};

pub type OomHandler = fn(size: usize);

static OOM_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Installs the process-wide OOM handler. The handler must not allocate.
pub fn set_partition_alloc_oom_handler(handler: OomHandler) {
    OOM_HANDLER.store(handler as usize, Ordering::Release);
}

#[cfg(test)]
pub fn reset_oom_handler_for_testing() {
    OOM_HANDLER.store(0, Ordering::Release);
}

/// Terminal out-of-memory path: invoke the registered handler, then crash.
#[cold]
#[inline(never)]
pub fn partition_oom(size: usize) -> ! {
    let raw = OOM_HANDLER.load(Ordering::Acquire);
    if raw != 0 {
        // Function pointers round-trip through usize losslessly.
        let handler: OomHandler = unsafe { core::mem::transmute(raw) };
        handler(size);
    }
    log::error!("partition allocator out of memory");
    panic!("partition allocator out of memory");
}
