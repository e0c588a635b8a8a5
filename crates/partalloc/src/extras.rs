//! In-slot extras: guard cookies and the per-slot reference count.
//!
//! When enabled, a slot is laid out as
//!
//! ```text
//! | ref count (8) | cookie (16) | payload | cookie (16) | slack |
//! ```
//!
//! with each piece present only when its option is on. The usable size the
//! caller sees is the slot capacity minus all extras; that subtraction
//! happens in exactly one place (`usable_from_capacity`) so the fast path,
//! the slow path and `get_usable_size` can never disagree.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::PartitionOptions;
use crate::util::abort_with_message;

pub const COOKIE_SIZE: usize = 16;
pub const REF_COUNT_SIZE: usize = 8;

const COOKIE_VALUE: [u8; COOKIE_SIZE] = [
    0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xD0, 0x0D, 0x13, 0x37, 0xF0, 0x0D, 0xDE, 0xAD, 0xBE,
    0xEF,
];

/// Sizes of the extras carried by every slot of a root, fixed at root init.
#[derive(Clone, Copy, Debug, Default)]
pub struct Extras {
    /// Bytes between the slot start and the payload.
    pub before: usize,
    /// Total extras bytes (before + trailing cookie).
    pub total: usize,
    pub cookie: bool,
    pub ref_count: bool,
}

impl Extras {
    pub fn from_options(options: &PartitionOptions) -> Extras {
        let ref_count = if options.ref_count { REF_COUNT_SIZE } else { 0 };
        let cookie = if options.cookie { COOKIE_SIZE } else { 0 };
        Extras {
            before: ref_count + cookie,
            total: ref_count + 2 * cookie,
            cookie: options.cookie,
            ref_count: options.ref_count,
        }
    }

    #[inline(always)]
    pub fn none(&self) -> bool {
        self.total == 0
    }
}

/// The one place capacity turns into usable size.
#[inline(always)]
pub fn usable_from_capacity(slot_capacity: usize, extras: &Extras) -> usize {
    debug_assert!(slot_capacity >= extras.total);
    slot_capacity - extras.total
}

/// Stamp the leading and trailing cookies around a payload of `usable` bytes.
///
/// # Safety
/// `slot_start` must point to a slot with at least `extras.total + usable`
/// writable bytes.
#[inline]
pub unsafe fn write_cookies(slot_start: *mut u8, extras: &Extras, usable: usize) {
    if !extras.cookie {
        return;
    }
    let lead = slot_start.add(extras.before - COOKIE_SIZE);
    lead.copy_from_nonoverlapping(COOKIE_VALUE.as_ptr(), COOKIE_SIZE);
    let trail = slot_start.add(extras.before + usable);
    trail.copy_from_nonoverlapping(COOKIE_VALUE.as_ptr(), COOKIE_SIZE);
}

/// Verify both cookies; a mismatch means the payload was over- or
/// underflowed, which is unrecoverable.
///
/// # Safety
/// Same slot contract as `write_cookies`.
#[inline]
pub unsafe fn check_cookies(slot_start: *const u8, extras: &Extras, usable: usize) {
    if !extras.cookie {
        return;
    }
    let lead = core::slice::from_raw_parts(slot_start.add(extras.before - COOKIE_SIZE), COOKIE_SIZE);
    let trail = core::slice::from_raw_parts(slot_start.add(extras.before + usable), COOKIE_SIZE);
    if lead != COOKIE_VALUE || trail != COOKIE_VALUE {
        abort_with_message("partalloc: cookie check failed (heap under/overflow)\n");
    }
}

// ---------------------------------------------------------------------------
// Slot reference count
// ---------------------------------------------------------------------------

const ALLOCATOR_BIT: u32 = 1 << 31;
const COUNT_MASK: u32 = ALLOCATOR_BIT - 1;

/// Outcome of dropping a reference to a slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReleaseOutcome {
    /// Other references remain; the slot stays reachable.
    StillReferenced,
    /// Last reference gone; the caller must release the slot's memory.
    FreeNow,
}

/// Per-slot reference count, stored in the first 8 bytes of the slot when
/// the option is on.
///
/// The high bit tracks whether the allocator itself still considers the slot
/// live; the low 31 bits count outstanding external references. A slot moves
/// through three states: live (high bit set), pending free (high bit clear,
/// count nonzero, payload already poisoned) and freed (word reaches zero and
/// the memory is released).
#[repr(transparent)]
pub struct SlotRefCount(AtomicU32);

impl SlotRefCount {
    /// # Safety
    /// `slot_start` must be the start of a slot whose root has ref counts on.
    #[inline(always)]
    pub unsafe fn from_slot<'a>(slot_start: *mut u8) -> &'a SlotRefCount {
        &*(slot_start as *const SlotRefCount)
    }

    /// Reset to the live state at allocation.
    #[inline]
    pub fn init_live(&self) {
        self.0.store(ALLOCATOR_BIT, Ordering::Release);
    }

    /// Take an external reference. Only valid on live slots.
    #[inline]
    pub fn acquire_ref(&self) {
        let old = self.0.fetch_add(1, Ordering::Relaxed);
        if old & ALLOCATOR_BIT == 0 {
            abort_with_message("partalloc: acquire_ref on freed slot\n");
        }
        if old & COUNT_MASK == COUNT_MASK {
            abort_with_message("partalloc: slot reference count overflow\n");
        }
    }

    /// Drop an external reference.
    #[inline]
    pub fn release_ref(&self) -> ReleaseOutcome {
        let old = self.0.fetch_sub(1, Ordering::AcqRel);
        if old & COUNT_MASK == 0 {
            abort_with_message("partalloc: release_ref without a reference\n");
        }
        if old == 1 {
            ReleaseOutcome::FreeNow
        } else {
            ReleaseOutcome::StillReferenced
        }
    }

    /// The allocator releases its claim on `free`. Detects double frees: the
    /// bit can only be cleared once per allocation.
    #[inline]
    pub fn release_allocator(&self) -> ReleaseOutcome {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            if old & ALLOCATOR_BIT == 0 {
                abort_with_message("partalloc: double free detected\n");
            }
            match self.0.compare_exchange_weak(
                old,
                old & COUNT_MASK,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return if old & COUNT_MASK == 0 {
                        ReleaseOutcome::FreeNow
                    } else {
                        ReleaseOutcome::StillReferenced
                    };
                }
                Err(current) => old = current,
            }
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Relaxed) & ALLOCATOR_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(cookie: bool, ref_count: bool) -> PartitionOptions {
        PartitionOptions {
            cookie,
            ref_count,
            ..PartitionOptions::default()
        }
    }

    #[test]
    fn extras_sizes() {
        let none = Extras::from_options(&options(false, false));
        assert!(none.none());
        assert_eq!(usable_from_capacity(64, &none), 64);

        let cookie = Extras::from_options(&options(true, false));
        assert_eq!(cookie.before, COOKIE_SIZE);
        assert_eq!(cookie.total, 2 * COOKIE_SIZE);

        let both = Extras::from_options(&options(true, true));
        assert_eq!(both.before, REF_COUNT_SIZE + COOKIE_SIZE);
        assert_eq!(both.total, REF_COUNT_SIZE + 2 * COOKIE_SIZE);
        assert_eq!(usable_from_capacity(112, &both), 112 - both.total);
    }

    #[test]
    fn cookies_round_trip() {
        let extras = Extras::from_options(&options(true, false));
        let usable = 32;
        let mut slot = vec![0u8; extras.total + usable];
        unsafe {
            write_cookies(slot.as_mut_ptr(), &extras, usable);
            check_cookies(slot.as_ptr(), &extras, usable);
        }
        assert_eq!(&slot[..COOKIE_SIZE], &COOKIE_VALUE);
        assert_eq!(&slot[COOKIE_SIZE + usable..], &COOKIE_VALUE);
    }

    #[test]
    fn ref_count_lifecycle() {
        let rc = SlotRefCount(AtomicU32::new(0));
        rc.init_live();
        assert!(rc.is_live());
        // No external refs: free releases immediately.
        assert_eq!(rc.release_allocator(), ReleaseOutcome::FreeNow);
        assert!(!rc.is_live());

        rc.init_live();
        rc.acquire_ref();
        rc.acquire_ref();
        assert_eq!(rc.release_ref(), ReleaseOutcome::StillReferenced);
        // Free with one ref outstanding: slot lingers as pending.
        assert_eq!(rc.release_allocator(), ReleaseOutcome::StillReferenced);
        assert!(!rc.is_live());
        assert_eq!(rc.release_ref(), ReleaseOutcome::FreeNow);
    }
}
