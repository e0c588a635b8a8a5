/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Natural alignment for all allocations (matches max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 16;

/// Granularity at which slot spans are carved out of a super page.
pub const PARTITION_PAGE_SHIFT: usize = 14;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT; // 16 KiB

/// The unit of address-space reservation. Super pages are reserved aligned to
/// their own size so that any interior pointer maps back to the reservation
/// base with a single mask.
pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT; // 2 MiB

pub const PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

/// Hard ceiling on a single request. Anything above this is rejected before
/// any memory work happens.
pub const MAX_DIRECT_MAPPED: usize = 1 << 30; // 1 GiB

/// Runtime system page size, initialized from sysconf on first root init.
/// Pre-seeded with 4096 so reads before init stay valid.
static PAGE_SIZE_CACHED: core::sync::atomic::AtomicUsize =
    core::sync::atomic::AtomicUsize::new(4096);

/// Read the system page size from the OS and cache it.
pub fn init_page_size() {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps > 0 { ps as usize } else { 4096 };
    PAGE_SIZE_CACHED.store(ps, core::sync::atomic::Ordering::Release);
}

/// Get the system page size.
#[inline(always)]
pub fn system_page_size() -> usize {
    PAGE_SIZE_CACHED.load(core::sync::atomic::Ordering::Relaxed)
}

/// Byte written over the user region of a freed slot. Turns use-after-free
/// reads into recognizable garbage and write-after-free into detectable
/// corruption.
pub const FREED_BYTE: u8 = 0xCD;

/// Byte used to fill fresh non-zeroed allocations in debug builds, to surface
/// reads of uninitialized memory.
pub const UNINITIALIZED_BYTE: u8 = 0xAB;

/// Abort with a diagnostic message to stderr.
/// Used when unrecoverable heap corruption is detected; the heap can no
/// longer be trusted, so there is no error return.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

/// Abort with formatted diagnostics (bucket/size/operation context).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        unsafe { libc::abort() }
    }};
}
pub(crate) use fatal;
