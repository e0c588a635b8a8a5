//! Process-wide allocation hooks.
//!
//! Observer hooks see every allocation and free (for leak tracking or
//! profiling) without influencing them. Override hooks may service an
//! allocation themselves; when an override handles an alloc, the matching
//! free must be handled by its free override.
//!
//! Hooks are `&'static` tables swapped in atomically; install once near
//! startup. `AllocFlags::NO_HOOKS` skips both kinds for a single call.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

pub struct ObserverHooks {
    pub allocation: fn(address: *mut u8, usable_size: usize, type_name: Option<&'static str>),
    pub free: fn(address: *mut u8),
}

pub struct OverrideHooks {
    /// Return `Some` to service the allocation instead of the partition.
    pub alloc: fn(size: usize, type_name: Option<&'static str>) -> Option<*mut u8>,
    /// Return `true` if this pointer belongs to the override and was freed.
    pub free: fn(address: *mut u8) -> bool,
    /// Return `Some` to service the reallocation instead of the partition.
    pub realloc: fn(address: *mut u8, new_size: usize) -> Option<*mut u8>,
}

static OBSERVER: AtomicPtr<ObserverHooks> = AtomicPtr::new(ptr::null_mut());
static OVERRIDE: AtomicPtr<OverrideHooks> = AtomicPtr::new(ptr::null_mut());

pub fn set_observer_hooks(hooks: &'static ObserverHooks) {
    OBSERVER.store(hooks as *const ObserverHooks as *mut _, Ordering::Release);
}

pub fn clear_observer_hooks() {
    OBSERVER.store(ptr::null_mut(), Ordering::Release);
}

pub fn set_override_hooks(hooks: &'static OverrideHooks) {
    OVERRIDE.store(hooks as *const OverrideHooks as *mut _, Ordering::Release);
}

pub fn clear_override_hooks() {
    OVERRIDE.store(ptr::null_mut(), Ordering::Release);
}

#[inline]
fn observer() -> Option<&'static ObserverHooks> {
    let p = OBSERVER.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

#[inline]
fn overrides() -> Option<&'static OverrideHooks> {
    let p = OVERRIDE.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

#[inline]
pub fn notify_allocation(address: *mut u8, usable_size: usize, type_name: Option<&'static str>) {
    if let Some(h) = observer() {
        (h.allocation)(address, usable_size, type_name);
    }
}

#[inline]
pub fn notify_free(address: *mut u8) {
    if let Some(h) = observer() {
        (h.free)(address);
    }
}

#[inline]
pub fn try_override_alloc(size: usize, type_name: Option<&'static str>) -> Option<*mut u8> {
    overrides().and_then(|h| (h.alloc)(size, type_name))
}

#[inline]
pub fn try_override_free(address: *mut u8) -> bool {
    overrides().map_or(false, |h| (h.free)(address))
}

#[inline]
pub fn try_override_realloc(address: *mut u8, new_size: usize) -> Option<*mut u8> {
    overrides().and_then(|h| (h.realloc)(address, new_size))
}
