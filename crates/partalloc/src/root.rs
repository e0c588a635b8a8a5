//! The partition root: the per-heap handle every operation goes through.
//!
//! A root owns its buckets, super pages and direct-map extents. The hot
//! state is split in two: lock-free counters live directly on the root,
//! everything structural sits behind one `parking_lot::Mutex`. The thread
//! cache (when enabled) sits in front of the lock and services small
//! allocations without touching it.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bucket::{self, Bucket, BUCKET_SIZES, NUM_BUCKETS};
use crate::config::{PartitionOptions, Tuning};
use crate::direct_map::{self, DirectMapExtent};
use crate::extras::{self, Extras, ReleaseOutcome, SlotRefCount};
use crate::hooks;
use crate::page_provider::{self, Reservation};
use crate::slot_span::{self, SlotSpan, SpanState, SuperPageHeader, FIRST_PAYLOAD_PAGE,
    PAYLOAD_PAGE_LIMIT};
use crate::span_map::{self, SpanMapEntry};
use crate::stats::{BucketStats, PartitionStats, StatsDumper};
use crate::thread_cache;
use crate::util::{self, abort_with_message, FREED_BYTE, MAX_DIRECT_MAPPED, MIN_ALIGN,
    PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE, UNINITIALIZED_BYTE};

/// Flags for `alloc_flags` and `realloc_with_flags`.
pub mod alloc_flags {
    /// Return null on failure instead of aborting the process.
    pub const RETURN_NULL: u32 = 1 << 0;
    /// Hand back zeroed memory.
    pub const ZERO_FILL: u32 = 1 << 1;
    /// Skip observer and override hooks for this call.
    pub const NO_HOOKS: u32 = 1 << 2;
}

/// Flags for `purge_memory`.
pub mod purge_flags {
    /// Decommit every span parked in the empty-span ring.
    pub const DECOMMIT_EMPTY_SLOT_SPANS: u32 = 1 << 0;
    /// Release the never-provisioned tails of partially used spans.
    pub const DISCARD_UNUSED_SYSTEM_PAGES: u32 = 1 << 1;
    /// Everything above, plus flush the calling thread's cache first.
    pub const AGGRESSIVE_RECLAIM: u32 = 1 << 2;
}

struct RootInner {
    buckets: Box<[Bucket; NUM_BUCKETS]>,
    /// All super pages ever reserved, newest first.
    super_pages: *mut SuperPageHeader,
    /// Super page the bump cursor currently carves spans from.
    current_super: *mut SuperPageHeader,
    /// Next free partition page in `current_super`.
    next_page: usize,
    direct_map_head: *mut DirectMapExtent,
    /// Ring of recently emptied spans kept committed for reuse. Overwriting
    /// a live entry decommits the evicted span.
    empty_ring: Vec<*mut SlotSpan>,
    empty_ring_cursor: usize,
}

// All pointers in RootInner reference memory owned by the root and are only
// touched under the root lock.
unsafe impl Send for RootInner {}

pub struct PartitionRoot {
    /// Bitwise complement of this root's own address, written once at
    /// construction. A free whose metadata does not lead back here hits
    /// garbage or a stale root and aborts.
    inverted_self: AtomicUsize,
    options: PartitionOptions,
    extras: Extras,
    tuning: Tuning,

    total_committed: AtomicUsize,
    max_committed: AtomicUsize,
    total_allocated: AtomicUsize,
    max_allocated: AtomicUsize,
    total_super_page_bytes: AtomicUsize,
    total_direct_map_bytes: AtomicUsize,
    num_direct_mapped: AtomicUsize,

    inner: Mutex<RootInner>,
}

unsafe impl Send for PartitionRoot {}
unsafe impl Sync for PartitionRoot {}

impl PartitionRoot {
    /// Create a root. The box address is the root's identity; the root must
    /// not be moved out of it.
    pub fn new(options: PartitionOptions) -> Box<PartitionRoot> {
        util::init_page_size();
        let extras = Extras::from_options(&options);
        if options.aligned_alloc && !extras.none() {
            util::fatal!(
                "partalloc: aligned_alloc cannot be combined with cookies or ref counts"
            );
        }
        let tuning = Tuning::from_env();
        let root = Box::new(PartitionRoot {
            inverted_self: AtomicUsize::new(0),
            options,
            extras,
            tuning,
            total_committed: AtomicUsize::new(0),
            max_committed: AtomicUsize::new(0),
            total_allocated: AtomicUsize::new(0),
            max_allocated: AtomicUsize::new(0),
            total_super_page_bytes: AtomicUsize::new(0),
            total_direct_map_bytes: AtomicUsize::new(0),
            num_direct_mapped: AtomicUsize::new(0),
            inner: Mutex::new(RootInner {
                buckets: Box::new(core::array::from_fn(|i| {
                    let mut b = Bucket::new();
                    b.slot_size = BUCKET_SIZES[i];
                    b
                })),
                super_pages: ptr::null_mut(),
                current_super: ptr::null_mut(),
                next_page: 0,
                direct_map_head: ptr::null_mut(),
                empty_ring: vec![ptr::null_mut(); tuning.empty_span_ring_size],
                empty_ring_cursor: 0,
            }),
        });
        root.inverted_self
            .store(!(&*root as *const PartitionRoot as usize), Ordering::Release);
        if root.options.thread_cache {
            thread_cache::register_root(&*root as *const PartitionRoot as usize);
        }
        log::debug!(
            "partition root created (thread_cache={}, extras={} bytes)",
            root.options.thread_cache,
            root.extras.total
        );
        root
    }

    #[inline(always)]
    fn self_check(&self) {
        let expected = !(self as *const PartitionRoot as usize);
        if self.inverted_self.load(Ordering::Relaxed) != expected {
            abort_with_message("partalloc: root integrity check failed\n");
        }
    }

    #[inline(always)]
    pub(crate) fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    // -- counters -----------------------------------------------------------

    fn bump_max(slot: &AtomicUsize, value: usize) {
        let mut cur = slot.load(Ordering::Relaxed);
        while value > cur {
            match slot.compare_exchange_weak(cur, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
    }

    fn add_allocated(&self, n: usize) {
        let v = self.total_allocated.fetch_add(n, Ordering::Relaxed) + n;
        Self::bump_max(&self.max_allocated, v);
    }

    fn sub_allocated(&self, n: usize) {
        self.total_allocated.fetch_sub(n, Ordering::Relaxed);
    }

    fn add_committed(&self, n: usize) {
        let v = self.total_committed.fetch_add(n, Ordering::Relaxed) + n;
        Self::bump_max(&self.max_committed, v);
    }

    fn sub_committed(&self, n: usize) {
        self.total_committed.fetch_sub(n, Ordering::Relaxed);
    }

    // -- allocation ---------------------------------------------------------

    pub fn alloc(&self, size: usize, type_name: Option<&'static str>) -> *mut u8 {
        self.alloc_flags(0, size, type_name)
    }

    pub fn alloc_flags(&self, flags: u32, size: usize, type_name: Option<&'static str>) -> *mut u8 {
        if flags & alloc_flags::NO_HOOKS == 0 {
            if let Some(p) = hooks::try_override_alloc(size, type_name) {
                return p;
            }
        }
        let ptr = self.alloc_inner(flags, size);
        if !ptr.is_null() && flags & alloc_flags::NO_HOOKS == 0 {
            hooks::notify_allocation(ptr, self.get_usable_size(ptr), type_name);
        }
        ptr
    }

    fn alloc_inner(&self, flags: u32, size: usize) -> *mut u8 {
        self.self_check();
        // Zero-size requests are legal and get a distinct pointer.
        let size = if size == 0 { 1 } else { size };
        if size > MAX_DIRECT_MAPPED {
            return self.alloc_failure(flags, size, "request beyond maximum size");
        }
        let raw = match size.checked_add(self.extras.total) {
            Some(r) => r,
            // Overflow here means the caller's size math already went wrong;
            // serving it would hand out a slot smaller than requested.
            None => util::fatal!("partalloc: allocation size overflow ({size} bytes)"),
        };
        match bucket::size_to_bucket_index(raw) {
            Some(index) => self.alloc_bucketed(flags, index, raw, size),
            None => self.alloc_direct(flags, raw, size, MIN_ALIGN),
        }
    }

    fn alloc_bucketed(&self, flags: u32, index: usize, raw: usize, size: usize) -> *mut u8 {
        let slot_size = bucket::bucket_slot_size(index);
        if self.options.thread_cache && slot_size <= thread_cache::CACHEABLE_SLOT_LIMIT {
            if let Some(slot) = thread_cache::try_alloc(self, index) {
                return self.finish_alloc(slot, slot_size, flags);
            }
        }
        let needs_raw = bucket::can_store_raw_size(slot_size);
        let slot = {
            let mut inner = self.inner.lock();
            match unsafe { self.alloc_slot_locked(&mut inner, index) } {
                Some((slot, span)) => {
                    if needs_raw {
                        unsafe { (*span).raw_size = raw };
                    }
                    slot
                }
                None => ptr::null_mut(),
            }
        };
        if slot.is_null() {
            return self.alloc_failure(flags, size, "out of memory");
        }
        let capacity = if needs_raw { raw } else { slot_size };
        self.finish_alloc(slot, capacity, flags)
    }

    fn alloc_direct(&self, flags: u32, raw: usize, size: usize, alignment: usize) -> *mut u8 {
        let extent = direct_map::create(self as *const PartitionRoot as *mut _, raw, alignment);
        if extent.is_null() {
            return self.alloc_failure(flags, size, "out of memory");
        }
        unsafe {
            {
                let mut inner = self.inner.lock();
                (*extent).next = inner.direct_map_head;
                if !inner.direct_map_head.is_null() {
                    (*inner.direct_map_head).prev = extent;
                }
                inner.direct_map_head = extent;
            }
            self.add_committed(PARTITION_PAGE_SIZE + (*extent).committed_payload);
            self.total_direct_map_bytes
                .fetch_add((*extent).reservation_size, Ordering::Relaxed);
            self.num_direct_mapped.fetch_add(1, Ordering::Relaxed);
            self.add_allocated(raw);
            self.finish_alloc((*extent).slot_start(), raw, flags)
        }
    }

    /// Stamp extras and fill policy onto a fresh slot, returning the payload.
    fn finish_alloc(&self, slot_start: *mut u8, capacity: usize, flags: u32) -> *mut u8 {
        let usable = extras::usable_from_capacity(capacity, &self.extras);
        unsafe {
            if self.extras.ref_count {
                SlotRefCount::from_slot(slot_start).init_live();
            }
            extras::write_cookies(slot_start, &self.extras, usable);
            let payload = slot_start.add(self.extras.before);
            if flags & alloc_flags::ZERO_FILL != 0 {
                ptr::write_bytes(payload, 0, usable);
            } else if cfg!(debug_assertions) {
                ptr::write_bytes(payload, UNINITIALIZED_BYTE, usable);
            }
            payload
        }
    }

    #[cold]
    fn alloc_failure(&self, flags: u32, size: usize, reason: &str) -> *mut u8 {
        if flags & alloc_flags::RETURN_NULL != 0 {
            log::warn!("allocation of {size} bytes failed: {reason}");
            return ptr::null_mut();
        }
        util::fatal!("partalloc: allocation of {size} bytes failed: {reason}");
    }

    /// Allocate with an alignment above the natural one. Requires the
    /// `aligned_alloc` option (which forbids extras ahead of the payload).
    pub fn aligned_alloc(&self, flags: u32, alignment: usize, size: usize) -> *mut u8 {
        self.self_check();
        if !self.options.aligned_alloc {
            util::fatal!("partalloc: aligned_alloc requires the aligned_alloc option");
        }
        debug_assert!(self.extras.none());
        if !alignment.is_power_of_two()
            || alignment % core::mem::size_of::<*mut u8>() != 0
            || alignment > SUPER_PAGE_SIZE
        {
            return self.alloc_failure(flags, size, "unsupported alignment");
        }
        if alignment <= MIN_ALIGN {
            return self.alloc_flags(flags, size, None);
        }
        let size = size.max(1);
        if alignment <= PARTITION_PAGE_SIZE {
            return match bucket::size_to_bucket_index(size) {
                Some(index) if bucket::bucket_slot_size(index) <= PARTITION_PAGE_SIZE => {
                    // Power-of-two slots in a partition-page-aligned span are
                    // naturally aligned to their own size.
                    let adjusted = size.max(alignment).next_power_of_two();
                    self.alloc_flags(flags, adjusted, None)
                }
                // Single-slot spans and direct maps both start on a
                // partition page boundary.
                _ => self.alloc_flags(flags, size, None),
            };
        }
        if size > MAX_DIRECT_MAPPED {
            return self.alloc_failure(flags, size, "request beyond maximum size");
        }
        let ptr = self.alloc_direct(flags, size, size, alignment);
        if !ptr.is_null() && flags & alloc_flags::NO_HOOKS == 0 {
            hooks::notify_allocation(ptr, self.get_usable_size(ptr), None);
        }
        ptr
    }

    // -- free ---------------------------------------------------------------

    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if hooks::try_override_free(ptr) {
            return;
        }
        hooks::notify_free(ptr);
        self.free_no_hooks(ptr);
    }

    pub fn free_no_hooks(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match span_map::lookup(ptr as usize) {
            Some(SpanMapEntry::SuperPage(header)) => unsafe { self.free_in_span(header, ptr) },
            Some(SpanMapEntry::DirectMap(extent)) => unsafe { self.free_direct(extent, ptr) },
            None => abort_with_message("partalloc: free of foreign pointer\n"),
        }
    }

    unsafe fn free_in_span(&self, header: *mut SuperPageHeader, ptr: *mut u8) {
        slot_span::check_header_marker(header);
        if (*header).root != self as *const PartitionRoot as *mut _ {
            abort_with_message("partalloc: pointer freed to wrong partition\n");
        }
        self.self_check();
        let span = (*header).span_for_addr(ptr as usize);
        let span_start = (*span).span_start();
        let slot_start = (ptr as usize).wrapping_sub(self.extras.before);
        let slot_size = (*span).slot_size();
        if slot_start < span_start || (slot_start - span_start) % slot_size != 0 {
            abort_with_message("partalloc: free of misaligned pointer\n");
        }
        let slot_start = slot_start as *mut u8;
        // The freelist head is already free; freeing it again is the classic
        // immediate double free. The first free overwrote the slot's leading
        // word with an encoded link, so the ref count below cannot be
        // trusted to catch this case.
        if (*span).freelist_head == slot_start as usize {
            abort_with_message("partalloc: double free detected\n");
        }
        let usable = self.usable_for_slot(&*span);
        extras::check_cookies(slot_start, &self.extras, usable);
        if let Some(hook) = self.options.quarantine_hook {
            if hook(ptr, usable) {
                return;
            }
        }
        if self.extras.ref_count {
            match SlotRefCount::from_slot(slot_start).release_allocator() {
                ReleaseOutcome::StillReferenced => {
                    // Pending free: neutralize the payload, keep the slot
                    // until the last reference drops.
                    ptr::write_bytes(ptr, FREED_BYTE, usable);
                    return;
                }
                ReleaseOutcome::FreeNow => {}
            }
        }
        // Poison before taking the lock; a page fault here must not stall
        // other threads.
        ptr::write_bytes(ptr, FREED_BYTE, usable);
        let index = (*span).bucket_index as usize;
        if self.options.thread_cache
            && slot_size <= thread_cache::CACHEABLE_SLOT_LIMIT
            && thread_cache::try_free(self, index, slot_start)
        {
            return;
        }
        let mut inner = self.inner.lock();
        self.release_slot_inner(&mut inner, span, slot_start);
    }

    unsafe fn free_direct(&self, extent: *mut DirectMapExtent, ptr: *mut u8) {
        (*extent).check_marker();
        if (*extent).root != self as *const PartitionRoot as *mut _ {
            abort_with_message("partalloc: pointer freed to wrong partition\n");
        }
        self.self_check();
        let slot_start = (*extent).slot_start();
        if ptr != slot_start.add(self.extras.before) {
            abort_with_message("partalloc: free of misaligned pointer\n");
        }
        let usable = extras::usable_from_capacity((*extent).raw_size, &self.extras);
        extras::check_cookies(slot_start, &self.extras, usable);
        if let Some(hook) = self.options.quarantine_hook {
            if hook(ptr, usable) {
                return;
            }
        }
        if self.extras.ref_count {
            match SlotRefCount::from_slot(slot_start).release_allocator() {
                ReleaseOutcome::StillReferenced => {
                    ptr::write_bytes(ptr, FREED_BYTE, usable);
                    return;
                }
                ReleaseOutcome::FreeNow => {}
            }
        }
        self.destroy_direct(extent);
    }

    unsafe fn destroy_direct(&self, extent: *mut DirectMapExtent) {
        {
            let mut inner = self.inner.lock();
            let e = &mut *extent;
            if e.prev.is_null() {
                inner.direct_map_head = e.next;
            } else {
                (*e.prev).next = e.next;
            }
            if !e.next.is_null() {
                (*e.next).prev = e.prev;
            }
        }
        self.sub_committed(PARTITION_PAGE_SIZE + (*extent).committed_payload);
        self.total_direct_map_bytes
            .fetch_sub((*extent).reservation_size, Ordering::Relaxed);
        self.num_direct_mapped.fetch_sub(1, Ordering::Relaxed);
        self.sub_allocated((*extent).raw_size);
        direct_map::destroy(extent);
    }

    // -- reference counting -------------------------------------------------

    /// Take an out-of-band reference to a live allocation.
    pub fn acquire_ref(&self, ptr: *mut u8) {
        if !self.extras.ref_count {
            util::fatal!("partalloc: acquire_ref without the ref_count option");
        }
        self.self_check();
        unsafe {
            SlotRefCount::from_slot(ptr.sub(self.extras.before)).acquire_ref();
        }
    }

    /// Drop a reference taken with `acquire_ref`. When the allocation was
    /// already freed and this was the last reference, the slot's memory is
    /// released here.
    pub fn release_ref(&self, ptr: *mut u8) {
        if !self.extras.ref_count {
            util::fatal!("partalloc: release_ref without the ref_count option");
        }
        self.self_check();
        let slot_start = unsafe { ptr.sub(self.extras.before) };
        let outcome = unsafe { SlotRefCount::from_slot(slot_start).release_ref() };
        if outcome != ReleaseOutcome::FreeNow {
            return;
        }
        match span_map::lookup(ptr as usize) {
            Some(SpanMapEntry::SuperPage(header)) => unsafe {
                let span = (*header).span_for_addr(ptr as usize);
                let mut inner = self.inner.lock();
                self.release_slot_inner(&mut inner, span, slot_start);
            },
            Some(SpanMapEntry::DirectMap(extent)) => unsafe { self.destroy_direct(extent) },
            None => abort_with_message("partalloc: release_ref of foreign pointer\n"),
        }
    }

    // -- realloc ------------------------------------------------------------

    pub fn realloc(&self, ptr: *mut u8, new_size: usize, type_name: Option<&'static str>) -> *mut u8 {
        self.realloc_with_flags(0, ptr, new_size, type_name)
    }

    /// Like `realloc`, but failure returns null and leaves the original
    /// allocation untouched and valid.
    pub fn try_realloc(&self, ptr: *mut u8, new_size: usize, type_name: Option<&'static str>) -> *mut u8 {
        self.realloc_with_flags(alloc_flags::RETURN_NULL, ptr, new_size, type_name)
    }

    pub fn realloc_with_flags(
        &self,
        flags: u32,
        ptr: *mut u8,
        new_size: usize,
        type_name: Option<&'static str>,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_flags(flags, new_size, type_name);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if flags & alloc_flags::NO_HOOKS == 0 {
            if let Some(p) = hooks::try_override_realloc(ptr, new_size) {
                return p;
            }
        }
        self.self_check();
        if new_size > MAX_DIRECT_MAPPED {
            return self.alloc_failure(flags, new_size, "request beyond maximum size");
        }
        let raw_new = match new_size.checked_add(self.extras.total) {
            Some(r) => r,
            None => util::fatal!("partalloc: allocation size overflow ({new_size} bytes)"),
        };
        if let Some(p) = self.try_realloc_in_place(ptr, raw_new) {
            if flags & alloc_flags::NO_HOOKS == 0 {
                hooks::notify_free(ptr);
                hooks::notify_allocation(p, self.get_usable_size(p), type_name);
            }
            return p;
        }
        let old_usable = self.get_usable_size(ptr);
        let new_ptr = self.alloc_flags(flags, new_size, type_name);
        if new_ptr.is_null() {
            // RETURN_NULL path: the original allocation stays valid.
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
        }
        self.free(ptr);
        new_ptr
    }

    fn try_realloc_in_place(&self, ptr: *mut u8, raw_new: usize) -> Option<*mut u8> {
        match span_map::lookup(ptr as usize) {
            Some(SpanMapEntry::DirectMap(extent)) => unsafe {
                (*extent).check_marker();
                if (*extent).root != self as *const PartitionRoot as *mut _ {
                    abort_with_message("partalloc: realloc of pointer from wrong partition\n");
                }
                // Stay direct-mapped; a shrink into bucket range moves.
                if bucket::size_to_bucket_index(raw_new).is_some() {
                    return None;
                }
                let old_raw = (*extent).raw_size;
                let old_committed = (*extent).committed_payload;
                let inner = self.inner.lock();
                if !direct_map::resize_in_place(extent, raw_new) {
                    drop(inner);
                    return None;
                }
                drop(inner);
                let new_committed = (*extent).committed_payload;
                if new_committed > old_committed {
                    self.add_committed(new_committed - old_committed);
                } else {
                    self.sub_committed(old_committed - new_committed);
                }
                if raw_new > old_raw {
                    self.add_allocated(raw_new - old_raw);
                } else {
                    self.sub_allocated(old_raw - raw_new);
                }
                let slot_start = (*extent).slot_start();
                let usable = extras::usable_from_capacity(raw_new, &self.extras);
                extras::write_cookies(slot_start, &self.extras, usable);
                Some(ptr)
            },
            Some(SpanMapEntry::SuperPage(header)) => unsafe {
                slot_span::check_header_marker(header);
                if (*header).root != self as *const PartitionRoot as *mut _ {
                    abort_with_message("partalloc: realloc of pointer from wrong partition\n");
                }
                let span = (*header).span_for_addr(ptr as usize);
                let index = (*span).bucket_index as usize;
                if bucket::size_to_bucket_index(raw_new) != Some(index) {
                    return None;
                }
                let slot_size = (*span).slot_size();
                if bucket::can_store_raw_size(slot_size) {
                    let _inner = self.inner.lock();
                    (*span).raw_size = raw_new;
                    drop(_inner);
                    let slot_start = ptr.sub(self.extras.before);
                    let usable = extras::usable_from_capacity(raw_new, &self.extras);
                    extras::write_cookies(slot_start, &self.extras, usable);
                }
                Some(ptr)
            },
            None => abort_with_message("partalloc: realloc of foreign pointer\n"),
        }
    }

    // -- usable size --------------------------------------------------------

    /// Capacity of the allocation behind `ptr`, net of extras. Always at
    /// least the requested size.
    pub fn get_usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        match span_map::lookup(ptr as usize) {
            Some(SpanMapEntry::SuperPage(header)) => unsafe {
                let span = (*header).span_for_addr(ptr as usize);
                self.usable_for_slot(&*span)
            },
            Some(SpanMapEntry::DirectMap(extent)) => unsafe {
                extras::usable_from_capacity((*extent).raw_size, &self.extras)
            },
            None => abort_with_message("partalloc: usable size of foreign pointer\n"),
        }
    }

    /// What `get_usable_size` would report for a fresh allocation of `size`
    /// bytes, without allocating.
    pub fn usable_size_for_request(&self, size: usize) -> usize {
        let size = if size == 0 { 1 } else { size };
        let raw = size
            .checked_add(self.extras.total)
            .unwrap_or_else(|| util::fatal!("partalloc: allocation size overflow"));
        let capacity = match bucket::size_to_bucket_index(raw) {
            Some(index) => {
                let slot_size = bucket::bucket_slot_size(index);
                if bucket::can_store_raw_size(slot_size) {
                    raw
                } else {
                    slot_size
                }
            }
            None => raw,
        };
        extras::usable_from_capacity(capacity, &self.extras)
    }

    fn usable_for_slot(&self, span: &SlotSpan) -> usize {
        let slot_size = span.slot_size();
        let capacity = if bucket::can_store_raw_size(slot_size) && span.raw_size != 0 {
            span.raw_size
        } else {
            slot_size
        };
        extras::usable_from_capacity(capacity, &self.extras)
    }

    // -- locked slot management --------------------------------------------

    /// Produce one slot for `index`, refilling the bucket's active list from
    /// decommitted spans or fresh carving as needed. Returns the slot and
    /// its span.
    unsafe fn alloc_slot_locked(
        &self,
        inner: &mut RootInner,
        index: usize,
    ) -> Option<(*mut u8, *mut SlotSpan)> {
        loop {
            // Drain the active list front: reactivate parked empty spans,
            // unlink spans that turn out full.
            loop {
                let head = inner.buckets[index].active_head;
                if head.is_null() {
                    break;
                }
                let s = &mut *head;
                if s.state == SpanState::Empty {
                    if s.empty_ring_index >= 0 {
                        inner.empty_ring[s.empty_ring_index as usize] = ptr::null_mut();
                        s.empty_ring_index = -1;
                    }
                    s.state = SpanState::Active;
                }
                let slot = s.take_slot();
                if !slot.is_null() {
                    if s.is_full() {
                        inner.buckets[index].active_head = s.next_span;
                        s.next_span = ptr::null_mut();
                        s.state = SpanState::Full;
                        inner.buckets[index].num_full_spans += 1;
                    }
                    self.add_allocated(s.slot_size());
                    return Some((slot, head));
                }
                inner.buckets[index].active_head = s.next_span;
                s.next_span = ptr::null_mut();
                s.state = SpanState::Full;
                inner.buckets[index].num_full_spans += 1;
            }
            // Refill: a decommitted span is the cheapest (its pages fault
            // back in zeroed), otherwise carve from the bump cursor.
            let bucket = &mut inner.buckets[index];
            if !bucket.decommitted_head.is_null() {
                let span = bucket.decommitted_head;
                bucket.decommitted_head = (*span).next_span;
                (*span).next_span = bucket.active_head;
                bucket.active_head = span;
                (*span).reset_decommitted();
                self.add_committed(bucket::span_bytes((*span).slot_size()));
                continue;
            }
            self.carve_span_locked(inner, index)?;
        }
    }

    /// Carve a fresh span for `index` out of super-page headroom, reserving
    /// a new super page when the current one is spent.
    unsafe fn carve_span_locked(
        &self,
        inner: &mut RootInner,
        index: usize,
    ) -> Option<*mut SlotSpan> {
        let slot_size = bucket::bucket_slot_size(index);
        let pages = bucket::partition_pages_per_span(slot_size);
        if inner.current_super.is_null() || inner.next_page + pages > PAYLOAD_PAGE_LIMIT {
            if !self.new_super_page_locked(inner) {
                return None;
            }
        }
        let header = &mut *inner.current_super;
        let span = header.init_span(inner.next_page, index);
        inner.next_page += pages;
        self.add_committed(bucket::span_bytes(slot_size));
        (*span).next_span = inner.buckets[index].active_head;
        inner.buckets[index].active_head = span;
        Some(span)
    }

    fn new_super_page_locked(&self, inner: &mut RootInner) -> bool {
        let Some(reservation) = page_provider::reserve_super_page() else {
            return false;
        };
        let header = unsafe {
            slot_span::init_super_page(reservation.base, self as *const PartitionRoot as *mut _)
        };
        span_map::register_super_page(reservation.base as usize, header);
        unsafe { (*header).next = inner.super_pages };
        inner.super_pages = header;
        inner.current_super = header;
        inner.next_page = FIRST_PAYLOAD_PAGE;
        self.total_super_page_bytes
            .fetch_add(SUPER_PAGE_SIZE, Ordering::Relaxed);
        // The metadata page is the only part committed up front.
        self.add_committed(PARTITION_PAGE_SIZE);
        true
    }

    /// Return one slot to its span, handling Full -> Active and
    /// Active -> Empty transitions.
    unsafe fn release_slot_inner(
        &self,
        inner: &mut RootInner,
        span: *mut SlotSpan,
        slot_start: *mut u8,
    ) {
        let s = &mut *span;
        let was_full = s.state == SpanState::Full;
        s.push_slot(slot_start);
        self.sub_allocated(s.slot_size());
        if was_full {
            s.state = SpanState::Active;
            let bucket = &mut inner.buckets[s.bucket_index as usize];
            s.next_span = bucket.active_head;
            bucket.active_head = span;
            bucket.num_full_spans -= 1;
        }
        if s.is_empty() && s.state == SpanState::Active {
            s.raw_size = 0;
            self.ring_push(inner, span);
        }
    }

    /// Park a newly empty span in the ring, decommitting whichever span the
    /// ring slot evicts.
    unsafe fn ring_push(&self, inner: &mut RootInner, span: *mut SlotSpan) {
        (*span).state = SpanState::Empty;
        let pos = inner.empty_ring_cursor;
        let evicted = inner.empty_ring[pos];
        if !evicted.is_null()
            && evicted != span
            && (*evicted).state == SpanState::Empty
            && (*evicted).empty_ring_index == pos as i16
        {
            self.decommit_span_locked(inner, evicted);
        }
        inner.empty_ring[pos] = span;
        (*span).empty_ring_index = pos as i16;
        inner.empty_ring_cursor = (pos + 1) % inner.empty_ring.len();
    }

    /// Release an empty span's pages to the OS and move it to its bucket's
    /// decommitted list.
    unsafe fn decommit_span_locked(&self, inner: &mut RootInner, span: *mut SlotSpan) {
        debug_assert_eq!((*span).state, SpanState::Empty);
        let index = (*span).bucket_index as usize;
        let bucket = &mut inner.buckets[index];
        // Unlink from the active list; empty spans stay linked there until
        // they are decommitted or reused.
        let mut cursor = &mut bucket.active_head as *mut *mut SlotSpan;
        while !(*cursor).is_null() {
            if *cursor == span {
                *cursor = (*span).next_span;
                break;
            }
            cursor = &mut (**cursor).next_span;
        }
        let start = (*span).span_start();
        let bytes = bucket::span_bytes((*span).slot_size());
        page_provider::decommit_pages(start as *mut u8, bytes);
        self.sub_committed(bytes);
        (*span).state = SpanState::Decommitted;
        (*span).empty_ring_index = -1;
        (*span).freelist_head = 0;
        (*span).next_span = bucket.decommitted_head;
        bucket.decommitted_head = span;
    }

    // -- thread cache back end ---------------------------------------------

    /// Fill `out` with slots for `index` under a single lock acquisition.
    pub(crate) fn cache_batch_alloc(&self, index: usize, out: &mut [*mut u8]) -> usize {
        let mut inner = self.inner.lock();
        let mut n = 0;
        while n < out.len() {
            match unsafe { self.alloc_slot_locked(&mut inner, index) } {
                Some((slot, _)) => {
                    out[n] = slot;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Return a batch of cached slots under a single lock acquisition.
    pub(crate) fn cache_batch_free(&self, slots: &[*mut u8]) {
        let mut inner = self.inner.lock();
        for &slot in slots {
            match span_map::lookup(slot as usize) {
                Some(SpanMapEntry::SuperPage(header)) => unsafe {
                    let span = (*header).span_for_addr(slot as usize);
                    self.release_slot_inner(&mut inner, span, slot);
                },
                _ => abort_with_message("partalloc: cached slot with no span\n"),
            }
        }
    }

    // -- purge and stats ----------------------------------------------------

    pub fn purge_memory(&self, flags: u32) {
        self.self_check();
        if flags & purge_flags::AGGRESSIVE_RECLAIM != 0 {
            thread_cache::flush_current_thread(self);
        }
        let decommit_empty =
            flags & (purge_flags::DECOMMIT_EMPTY_SLOT_SPANS | purge_flags::AGGRESSIVE_RECLAIM) != 0;
        let discard =
            flags & (purge_flags::DISCARD_UNUSED_SYSTEM_PAGES | purge_flags::AGGRESSIVE_RECLAIM) != 0;
        let mut inner = self.inner.lock();
        if decommit_empty {
            for pos in 0..inner.empty_ring.len() {
                let span = inner.empty_ring[pos];
                if span.is_null() {
                    continue;
                }
                unsafe {
                    if (*span).state == SpanState::Empty
                        && (*span).empty_ring_index == pos as i16
                    {
                        self.decommit_span_locked(&mut inner, span);
                    }
                }
                inner.empty_ring[pos] = ptr::null_mut();
            }
        }
        if discard {
            self.discard_unprovisioned_locked(&mut inner);
        }
    }

    /// Hand never-provisioned span tails back to the OS. The slots stay
    /// unprovisioned, so nothing reads those pages before they are handed
    /// out again (at which point they fault in zeroed).
    fn discard_unprovisioned_locked(&self, inner: &mut RootInner) {
        let page = util::system_page_size();
        for index in 0..NUM_BUCKETS {
            let mut span = inner.buckets[index].active_head;
            while !span.is_null() {
                unsafe {
                    let s = &*span;
                    if s.state == SpanState::Active && s.num_unprovisioned_slots > 0 {
                        let provisioned =
                            s.num_slots() - s.num_unprovisioned_slots as usize;
                        let watermark = s.span_start() + provisioned * s.slot_size();
                        let discard_from = util::align_up(watermark, page);
                        let span_end = s.span_start()
                            + bucket::span_bytes(s.slot_size());
                        if discard_from < span_end {
                            page_provider::decommit_pages(
                                discard_from as *mut u8,
                                span_end - discard_from,
                            );
                        }
                    }
                    span = s.next_span;
                }
            }
        }
    }

    /// Snapshot statistics into `dumper`. Light dumps skip the per-bucket
    /// walk and its lock acquisition.
    pub fn dump_stats(&self, partition_name: &str, is_light: bool, dumper: &mut dyn StatsDumper) {
        self.self_check();
        let totals = PartitionStats {
            total_committed_bytes: self.total_committed.load(Ordering::Relaxed),
            max_committed_bytes: self.max_committed.load(Ordering::Relaxed),
            total_allocated_bytes: self.total_allocated.load(Ordering::Relaxed),
            max_allocated_bytes: self.max_allocated.load(Ordering::Relaxed),
            total_super_page_bytes: self.total_super_page_bytes.load(Ordering::Relaxed),
            total_direct_map_bytes: self.total_direct_map_bytes.load(Ordering::Relaxed),
            num_direct_mapped: self.num_direct_mapped.load(Ordering::Relaxed),
        };
        if !is_light {
            let inner = self.inner.lock();
            for index in 0..NUM_BUCKETS {
                let bucket = &inner.buckets[index];
                let mut stats = BucketStats {
                    slot_size: bucket.slot_size,
                    num_full_spans: bucket.num_full_spans,
                    ..BucketStats::default()
                };
                let span_bytes = bucket::span_bytes(bucket.slot_size);
                stats.active_bytes += bucket.num_full_spans
                    * bucket::slots_per_span(bucket.slot_size)
                    * bucket.slot_size;
                stats.committed_bytes += bucket.num_full_spans * span_bytes;
                let mut span = bucket.active_head;
                while !span.is_null() {
                    unsafe {
                        let s = &*span;
                        match s.state {
                            SpanState::Empty => stats.num_empty_spans += 1,
                            _ => stats.num_active_spans += 1,
                        }
                        stats.active_bytes += s.num_allocated_slots as usize * s.slot_size();
                        stats.committed_bytes += span_bytes;
                        span = s.next_span;
                    }
                }
                let mut span = bucket.decommitted_head;
                while !span.is_null() {
                    unsafe {
                        stats.num_decommitted_spans += 1;
                        span = (*span).next_span;
                    }
                }
                let has_spans = stats.num_active_spans
                    + stats.num_full_spans
                    + stats.num_empty_spans
                    + stats.num_decommitted_spans
                    > 0;
                if has_spans {
                    dumper.dump_bucket_stats(partition_name, &stats);
                }
            }
        }
        dumper.dump_totals(partition_name, &totals);
    }
}

impl Drop for PartitionRoot {
    fn drop(&mut self) {
        thread_cache::flush_current_thread(self);
        if self.options.thread_cache {
            thread_cache::unregister_root(self as *const PartitionRoot as usize);
        }
        let live = self.total_allocated.load(Ordering::Relaxed);
        if live != 0 {
            // Other threads' caches legitimately hold slots that still count
            // as allocated; without caching a nonzero count is a leak.
            debug_assert!(
                self.options.thread_cache,
                "dropping partition root with {live} bytes still allocated"
            );
            log::warn!("dropping partition root with {live} bytes still allocated");
        }
        let inner = self.inner.get_mut();
        unsafe {
            let mut extent = inner.direct_map_head;
            while !extent.is_null() {
                let next = (*extent).next;
                direct_map::destroy(extent);
                extent = next;
            }
            let mut header = inner.super_pages;
            while !header.is_null() {
                let next = (*header).next;
                let base = header as *mut u8;
                span_map::unregister(base as usize, SUPER_PAGE_SIZE);
                page_provider::free_reservation(Reservation {
                    base,
                    size: SUPER_PAGE_SIZE,
                });
                header = next;
            }
        }
        self.inverted_self.store(0, Ordering::Release);
    }
}
