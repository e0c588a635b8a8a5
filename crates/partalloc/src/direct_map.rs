//! Direct-mapped allocations: anything larger than the largest bucket gets
//! its own reservation instead of a slot span.
//!
//! A reservation is laid out as
//!
//! ```text
//! | extent header page (16 KiB) | payload (page-rounded) | guard page |
//! ```
//!
//! with the base super-page-aligned so the span map granules it covers
//! belong to it alone. The header page doubles as the metadata home: the
//! `DirectMapExtent` lives at the reservation base, never adjacent to user
//! data in another mapping.

use core::ptr;

use crate::page_provider::{self, Reservation};
use crate::root::PartitionRoot;
use crate::span_map;
use crate::util::{
    align_up, system_page_size, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE, abort_with_message,
};

const EXTENT_MARKER: u32 = 0xD1_8E_C7_A1;

/// Metadata for one direct-mapped allocation, stored in the reservation's
/// header page.
pub struct DirectMapExtent {
    pub root: *mut PartitionRoot,
    /// Links in the root's extent list.
    pub next: *mut DirectMapExtent,
    pub prev: *mut DirectMapExtent,
    pub reservation_base: *mut u8,
    pub reservation_size: usize,
    /// Offset of the payload slot from the base; `PARTITION_PAGE_SIZE`
    /// unless an aligned allocation demanded more.
    pub payload_offset: usize,
    /// Current extras-adjusted size of the allocation.
    pub raw_size: usize,
    /// Payload bytes currently committed (raw size rounded to system pages).
    pub committed_payload: usize,
    marker: u32,
}

impl DirectMapExtent {
    #[inline]
    pub fn slot_start(&self) -> *mut u8 {
        unsafe { self.reservation_base.add(self.payload_offset) }
    }

    /// Largest raw size this reservation can hold without remapping.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.reservation_size - self.payload_offset - system_page_size()
    }

    pub fn check_marker(&self) {
        if self.marker != EXTENT_MARKER {
            abort_with_message("partalloc: direct map extent corruption\n");
        }
    }
}

/// Reservation size needed for a raw allocation of `raw_size` at
/// `payload_offset`. `None` on arithmetic overflow.
pub fn reservation_size_for(raw_size: usize, payload_offset: usize) -> Option<usize> {
    let page = system_page_size();
    let payload = raw_size.checked_add(page - 1)? & !(page - 1);
    payload_offset
        .checked_add(payload)?
        .checked_add(page)
}

/// Reserve and initialize a direct-map extent. `alignment` beyond
/// `PARTITION_PAGE_SIZE` grows the payload offset; the super-page-aligned
/// base makes any power-of-two offset up to the super page size land the
/// payload on that alignment. Returns null on reservation failure.
///
/// The extent is registered in the span map but not yet linked into the
/// root's extent list; the caller does that under its lock.
pub fn create(
    root: *mut PartitionRoot,
    raw_size: usize,
    alignment: usize,
) -> *mut DirectMapExtent {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(alignment <= SUPER_PAGE_SIZE);
    let payload_offset = alignment.max(PARTITION_PAGE_SIZE);
    let Some(size) = reservation_size_for(raw_size, payload_offset) else {
        return ptr::null_mut();
    };
    let Some(reservation) = page_provider::reserve_direct_map(size) else {
        return ptr::null_mut();
    };
    unsafe { init_extent(reservation, root, raw_size, payload_offset) }
}

unsafe fn init_extent(
    reservation: Reservation,
    root: *mut PartitionRoot,
    raw_size: usize,
    payload_offset: usize,
) -> *mut DirectMapExtent {
    let page = system_page_size();
    let extent = reservation.base as *mut DirectMapExtent;
    (*extent) = DirectMapExtent {
        root,
        next: ptr::null_mut(),
        prev: ptr::null_mut(),
        reservation_base: reservation.base,
        reservation_size: reservation.size,
        payload_offset,
        raw_size,
        committed_payload: align_up(raw_size, page),
        marker: EXTENT_MARKER,
    };
    let guard = reservation.base.add(reservation.size - page);
    page_provider::guard_pages(guard, page);
    span_map::register_direct_map(reservation.base as usize, reservation.size, extent);
    extent
}

/// Unmap the whole reservation. Direct-mapped memory goes back to the OS
/// immediately; there is no empty-span parking for it.
///
/// # Safety
/// `extent` must be live and already unlinked from its root's extent list.
pub unsafe fn destroy(extent: *mut DirectMapExtent) {
    let base = (*extent).reservation_base;
    let size = (*extent).reservation_size;
    span_map::unregister(base as usize, size);
    page_provider::free_reservation(Reservation { base, size });
}

/// Resize in place within the existing reservation. Returns `false` when the
/// new size does not fit; the extent is unchanged in that case.
///
/// # Safety
/// `extent` must be live; caller holds the root lock.
pub unsafe fn resize_in_place(extent: *mut DirectMapExtent, new_raw_size: usize) -> bool {
    let e = &mut *extent;
    if new_raw_size > e.payload_capacity() {
        return false;
    }
    let page = system_page_size();
    let new_committed = align_up(new_raw_size, page);
    if new_committed < e.committed_payload {
        // Give the tail back; the reservation keeps the address space.
        let tail = e.slot_start().add(new_committed);
        page_provider::decommit_pages(tail, e.committed_payload - new_committed);
    }
    e.raw_size = new_raw_size;
    e.committed_payload = new_committed;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_sizing() {
        let page = system_page_size();
        let size = reservation_size_for(1, PARTITION_PAGE_SIZE).unwrap();
        assert_eq!(size, PARTITION_PAGE_SIZE + page + page);
        let size = reservation_size_for(page + 1, PARTITION_PAGE_SIZE).unwrap();
        assert_eq!(size, PARTITION_PAGE_SIZE + 2 * page + page);
        assert!(reservation_size_for(usize::MAX - page, PARTITION_PAGE_SIZE).is_none());
    }
}
