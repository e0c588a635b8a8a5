//! Global address -> metadata registry.
//!
//! A two-level radix table keyed by super-page-granule index (address bits
//! above the 2 MiB granule, within a 48-bit virtual address space). Every
//! super page and every direct-map reservation registers the granules it
//! covers; `lookup` then resolves any interior pointer to its owning
//! metadata without touching the memory near the pointer.
//!
//! Reads are lock-free (acquire loads); writers install second-level blocks
//! with a CAS and never remove them. One process-wide table serves all roots;
//! the entry carries the owning root via its metadata header.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::direct_map::DirectMapExtent;
use crate::slot_span::SuperPageHeader;
use crate::util::{SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE};

const VA_BITS: usize = 48;
const INDEX_BITS: usize = VA_BITS - SUPER_PAGE_SHIFT; // 27
const L2_BITS: usize = 13;
const L1_BITS: usize = INDEX_BITS - L2_BITS; // 14
const L1_ENTRIES: usize = 1 << L1_BITS;
const L2_ENTRIES: usize = 1 << L2_BITS;

const TAG_MASK: usize = 0b11;
const TAG_SUPER_PAGE: usize = 0b01;
const TAG_DIRECT_MAP: usize = 0b10;

struct L2Block {
    entries: [AtomicUsize; L2_ENTRIES],
}

static L1: [AtomicPtr<L2Block>; L1_ENTRIES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; L1_ENTRIES];

/// What a registered granule resolves to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanMapEntry {
    SuperPage(*mut SuperPageHeader),
    DirectMap(*mut DirectMapExtent),
}

#[inline(always)]
fn granule_index(addr: usize) -> usize {
    debug_assert!(addr >> VA_BITS == 0, "address beyond mapped VA range");
    addr >> SUPER_PAGE_SHIFT
}

fn l2_for(index: usize, create: bool) -> Option<&'static L2Block> {
    let slot = &L1[index >> L2_BITS];
    let mut block = slot.load(Ordering::Acquire);
    if block.is_null() {
        if !create {
            return None;
        }
        let fresh = Box::into_raw(Box::new(L2Block {
            entries: [const { AtomicUsize::new(0) }; L2_ENTRIES],
        }));
        match slot.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => block = fresh,
            Err(existing) => {
                // Lost the race; another thread installed a block.
                unsafe { drop(Box::from_raw(fresh)) };
                block = existing;
            }
        }
    }
    Some(unsafe { &*block })
}

fn set_entry(addr: usize, value: usize) {
    let index = granule_index(addr);
    let block = l2_for(index, true).unwrap_or_else(|| {
        crate::util::abort_with_message("partalloc: span map exhausted\n")
    });
    block.entries[index & (L2_ENTRIES - 1)].store(value, Ordering::Release);
}

/// Register a super page. `base` must be super-page-aligned.
pub fn register_super_page(base: usize, header: *mut SuperPageHeader) {
    debug_assert!(base & (SUPER_PAGE_SIZE - 1) == 0);
    set_entry(base, header as usize | TAG_SUPER_PAGE);
}

/// Register every granule a direct-map reservation covers. `base` must be
/// super-page-aligned so the reservation owns all of its granules.
pub fn register_direct_map(base: usize, size: usize, extent: *mut DirectMapExtent) {
    debug_assert!(base & (SUPER_PAGE_SIZE - 1) == 0);
    let value = extent as usize | TAG_DIRECT_MAP;
    let mut addr = base;
    while addr < base + size {
        set_entry(addr, value);
        addr += SUPER_PAGE_SIZE;
    }
}

/// Drop the registration for `[base, base + size)`.
pub fn unregister(base: usize, size: usize) {
    debug_assert!(base & (SUPER_PAGE_SIZE - 1) == 0);
    let mut addr = base;
    while addr < base + size {
        set_entry(addr, 0);
        addr += SUPER_PAGE_SIZE;
    }
}

/// Resolve an arbitrary address to its owning registration, if any.
#[inline]
pub fn lookup(addr: usize) -> Option<SpanMapEntry> {
    if addr >> VA_BITS != 0 {
        return None;
    }
    let index = granule_index(addr);
    let block = l2_for(index, false)?;
    let raw = block.entries[index & (L2_ENTRIES - 1)].load(Ordering::Acquire);
    let target = raw & !TAG_MASK;
    match raw & TAG_MASK {
        TAG_SUPER_PAGE => Some(SpanMapEntry::SuperPage(target as *mut SuperPageHeader)),
        TAG_DIRECT_MAP => Some(SpanMapEntry::DirectMap(target as *mut DirectMapExtent)),
        _ => None,
    }
}
