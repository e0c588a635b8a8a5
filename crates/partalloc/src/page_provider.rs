//! The page provider: the allocator's single seam to the OS virtual memory
//! layer. Roots reserve whole super pages (and direct-map reservations)
//! through this module and commit/decommit page ranges inside them; nothing
//! above this layer issues raw mmap calls.
//!
//! On POSIX, "reserve" and "commit" collapse into one operation because
//! anonymous mappings are committed lazily by the kernel; "decommit" is an
//! madvise that releases the physical pages while keeping the reservation.

use crate::platform;
use crate::util::{self, is_aligned, SUPER_PAGE_SIZE};

/// A page-aligned reservation handed out by the provider.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    pub base: *mut u8,
    pub size: usize,
}

/// Reserve one super page, aligned to the super-page size so interior
/// pointers can be masked back to the base. Returns `None` on exhaustion.
pub fn reserve_super_page() -> Option<Reservation> {
    // Super pages are always reserved aligned; the span map depends on a
    // super page never straddling a lookup granule.
    let base = unsafe { platform::map_aligned(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE) };
    if base.is_null() {
        log::warn!("page provider: super page reservation failed");
        return None;
    }
    Some(Reservation {
        base,
        size: SUPER_PAGE_SIZE,
    })
}

/// Reserve an arbitrary-size region for a direct-mapped allocation. The base
/// is aligned to the super-page size so the reservation owns every span-map
/// granule it touches.
pub fn reserve_direct_map(size: usize) -> Option<Reservation> {
    debug_assert!(is_aligned(size, util::system_page_size()));
    let base = unsafe { platform::map_aligned(size, SUPER_PAGE_SIZE) };
    if base.is_null() {
        log::warn!("page provider: direct-map reservation of {size} bytes failed");
        return None;
    }
    Some(Reservation { base, size })
}

/// Release the physical pages backing `[ptr, ptr + len)` while keeping the
/// address-space reservation. Pages read back as zero when touched again.
///
/// # Safety
/// The range must lie inside a live reservation and be system-page-aligned.
pub unsafe fn decommit_pages(ptr: *mut u8, len: usize) {
    debug_assert!(is_aligned(ptr as usize, util::system_page_size()));
    debug_assert!(is_aligned(len, util::system_page_size()));
    platform::advise_free(ptr, len);
}

/// Make a page range inaccessible permanently (guard pages).
///
/// # Safety
/// The range must lie inside a live reservation and be system-page-aligned.
pub unsafe fn guard_pages(ptr: *mut u8, len: usize) {
    platform::protect_none(ptr, len);
}

/// Return a whole reservation to the OS.
///
/// # Safety
/// `r` must have been obtained from this module and not freed before.
pub unsafe fn free_reservation(r: Reservation) {
    platform::unmap(r.base, r.size);
}
