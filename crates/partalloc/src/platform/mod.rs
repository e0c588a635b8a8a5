//! Thin wrappers over the OS virtual memory interface.
//!
//! Everything here is page-granularity; the allocator never assumes sub-page
//! reservations. Higher layers go through `page_provider` rather than calling
//! this module directly.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use crate::util::{align_up, is_aligned};

/// Map anonymous memory whose base is aligned to `align` (a power of two,
/// at least the page size). Over-maps by `align` and trims the head and tail
/// so exactly `size` bytes stay mapped.
///
/// # Safety
/// `size` must be page-aligned and non-zero; `align` a power of two.
pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let raw = sys::map_anonymous(size + align);
    if raw.is_null() {
        return core::ptr::null_mut();
    }
    let base = align_up(raw as usize, align);
    let head = base - raw as usize;
    if head > 0 {
        sys::unmap(raw, head);
    }
    let tail = (raw as usize + size + align) - (base + size);
    if tail > 0 {
        sys::unmap((base + size) as *mut u8, tail);
    }
    debug_assert!(is_aligned(base, align));
    base as *mut u8
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr`/`size` must describe a region obtained from this module.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Mark a region inaccessible (guard page).
///
/// # Safety
/// Region must be valid mapped memory and page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    sys::protect_none(ptr, size);
}

/// Tell the kernel the physical pages backing this range can be reclaimed.
/// The address-space reservation stays intact and the pages read back as
/// zero after reclamation.
///
/// # Safety
/// Region must be valid mapped memory and page-aligned.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise_free(ptr, size);
}
