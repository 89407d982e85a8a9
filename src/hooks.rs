// # Allocation Hooks
//
// Process-wide observer and override hooks. The hot paths check a single
// armed flag before touching anything else, so the disarmed cost is one
// relaxed load. Override hooks may claim an allocation or free entirely; the
// observer hook still sees claimed operations so accounting stays complete.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Observes every successful allocation (including ones claimed by the
/// override hook).
pub type AllocationObserverHook = fn(address: *mut u8, size: usize, type_name: &'static str);

/// May claim an allocation. Returning `Some(ptr)` suppresses the normal
/// path; `None` lets allocation proceed.
pub type AllocationOverrideHook =
    fn(flags: u32, size: usize, type_name: &'static str) -> Option<*mut u8>;

pub type FreeObserverHook = fn(address: *mut u8);

/// May claim a free. Returning `true` suppresses the normal path.
pub type FreeOverrideHook = fn(address: *mut u8) -> bool;

#[derive(Default, Clone, Copy)]
struct Hooks {
    allocation_observer: Option<AllocationObserverHook>,
    allocation_override: Option<AllocationOverrideHook>,
    free_observer: Option<FreeObserverHook>,
    free_override: Option<FreeOverrideHook>,
}

static HOOKS_ARMED: AtomicBool = AtomicBool::new(false);
static HOOKS: RwLock<Hooks> = RwLock::new(Hooks {
    allocation_observer: None,
    allocation_override: None,
    free_observer: None,
    free_override: None,
});

#[inline]
pub fn are_hooks_armed() -> bool {
    HOOKS_ARMED.load(Ordering::Relaxed)
}

pub fn set_observer_hooks(alloc: AllocationObserverHook, free: FreeObserverHook) {
    let mut hooks = HOOKS.write();
    hooks.allocation_observer = Some(alloc);
    hooks.free_observer = Some(free);
    HOOKS_ARMED.store(true, Ordering::Release);
}

pub fn set_override_hooks(alloc: AllocationOverrideHook, free: FreeOverrideHook) {
    let mut hooks = HOOKS.write();
    hooks.allocation_override = Some(alloc);
    hooks.free_override = Some(free);
    HOOKS_ARMED.store(true, Ordering::Release);
}

pub fn reset_hooks() {
    let mut hooks = HOOKS.write();
    *hooks = Hooks::default();
    HOOKS_ARMED.store(false, Ordering::Release);
}

/// Runs the allocation override hook, if any. Only called when armed.
pub fn allocation_override(flags: u32, size: usize, type_name: &'static str) -> Option<*mut u8> {
    let hooks = HOOKS.read();
    hooks.allocation_override.and_then(|hook| hook(flags, size, type_name))
}

pub fn allocation_observed(address: *mut u8, size: usize, type_name: &'static str) {
    let hooks = HOOKS.read();
    if let Some(hook) = hooks.allocation_observer {
        hook(address, size, type_name);
    }
}

/// Runs the free override hook; returns true if the free was claimed.
pub fn free_override(address: *mut u8) -> bool {
    let hooks = HOOKS.read();
    hooks.free_override.map(|hook| hook(address)).unwrap_or(false)
}

pub fn free_observed(address: *mut u8) {
    let hooks = HOOKS.read();
    if let Some(hook) = hooks.free_observer {
        hook(address);
    }
}
