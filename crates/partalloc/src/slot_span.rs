//! Super page layout and slot span metadata.
//!
//! A super page is a 2 MiB, self-aligned reservation split into 128 partition
//! pages. Page 0 holds the `SuperPageHeader` with a metadata entry per
//! partition page; page 127 is a permanent guard; pages 1..=126 are payload,
//! carved into slot spans.
//!
//! Metadata never lives next to payload slots. Resolving a user pointer goes
//! through the span map to the header, then indexes the metadata table; a
//! buffer overflow in payload memory cannot reach span metadata.

use core::ptr;

use crate::bucket;
use crate::freelist;
use crate::page_provider;
use crate::root::PartitionRoot;
use crate::util::{
    PARTITION_PAGES_PER_SUPER_PAGE, PARTITION_PAGE_SHIFT, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE,
    abort_with_message,
};

/// First payload partition page of a super page.
pub const FIRST_PAYLOAD_PAGE: usize = 1;
/// One past the last payload partition page (page 127 is the guard).
pub const PAYLOAD_PAGE_LIMIT: usize = PARTITION_PAGES_PER_SUPER_PAGE - 1;

const SUPER_PAGE_MARKER: u32 = 0x50_41_9E_AD;
const SPAN_MARKER: u32 = 0x51_0A_4D_A9;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SpanState {
    /// Has (or can provision) free slots and is reachable from its bucket.
    Active = 0,
    /// Every slot is handed out; unlinked from the bucket until a free.
    Full = 1,
    /// No live slots; parked in the root's empty-span ring, memory still
    /// committed for instant reuse.
    Empty = 2,
    /// Pages returned to the OS; reservation still owned by the bucket.
    Decommitted = 3,
}

/// Metadata for one slot span, stored in the owning super page's header.
///
/// Entries for the second and later pages of a multi-page span are not spans
/// themselves; they only carry `page_offset` back to the head entry.
pub struct SlotSpan {
    /// Head of this span's freelist (slot address), 0 when none.
    pub freelist_head: usize,
    /// Link in the bucket's active or decommitted list.
    pub next_span: *mut SlotSpan,
    /// Extras-adjusted request size, recorded only by single-slot spans.
    pub raw_size: usize,
    pub bucket_index: u16,
    pub num_allocated_slots: u16,
    /// Slots past the provisioning watermark: never touched, not yet on the
    /// freelist. Fresh spans start fully unprovisioned so carving a span
    /// does not fault in its pages.
    pub num_unprovisioned_slots: u16,
    /// Partition pages back to the head entry; 0 on head entries.
    pub page_offset: u8,
    pub state: SpanState,
    /// Position in the root's empty-span ring, -1 when not parked there.
    pub empty_ring_index: i16,
    marker: u32,
}

impl SlotSpan {
    #[inline]
    pub fn slot_size(&self) -> usize {
        bucket::bucket_slot_size(self.bucket_index as usize)
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        bucket::slots_per_span(self.slot_size())
    }

    /// Address of the first slot. Metadata entries live at a fixed offset
    /// from their super page base, so the base falls out of the entry's own
    /// address.
    #[inline]
    pub fn span_start(&self) -> usize {
        let self_addr = self as *const SlotSpan as usize;
        let header = crate::util::align_down(self_addr, SUPER_PAGE_SIZE) as *const SuperPageHeader;
        let index = unsafe {
            (self as *const SlotSpan).offset_from(&(*header).spans[0] as *const SlotSpan) as usize
        };
        header as usize + (index << PARTITION_PAGE_SHIFT)
    }

    #[inline]
    pub fn payload_end(&self) -> usize {
        self.span_start() + self.num_slots() * self.slot_size()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_allocated_slots as usize == self.num_slots()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_allocated_slots == 0
    }

    /// Pop one slot: freelist first, then the provisioning watermark.
    /// Returns null when the span is exhausted.
    ///
    /// # Safety
    /// Must be a head entry of a committed span; caller holds the root lock.
    pub unsafe fn take_slot(&mut self) -> *mut u8 {
        if self.freelist_head != 0 {
            let slot = self.freelist_head;
            let encoded = freelist::read_entry(slot as *const u8);
            self.freelist_head = freelist::decode_checked(
                encoded,
                self.span_start(),
                self.payload_end(),
                self.slot_size(),
            );
            self.num_allocated_slots += 1;
            return slot as *mut u8;
        }
        if self.num_unprovisioned_slots > 0 {
            let provisioned = self.num_slots() - self.num_unprovisioned_slots as usize;
            let slot = self.span_start() + provisioned * self.slot_size();
            self.num_unprovisioned_slots -= 1;
            self.num_allocated_slots += 1;
            return slot as *mut u8;
        }
        ptr::null_mut()
    }

    /// Push a slot back onto the freelist.
    ///
    /// # Safety
    /// `slot` must be a live slot of this span; caller holds the root lock.
    pub unsafe fn push_slot(&mut self, slot: *mut u8) {
        debug_assert!((slot as usize) >= self.span_start());
        debug_assert!((slot as usize) < self.payload_end());
        // The list head is by definition already free; pushing it again is
        // an immediate double free.
        if self.freelist_head == slot as usize {
            abort_with_message("partalloc: double free detected\n");
        }
        freelist::write_entry(slot, self.freelist_head);
        self.freelist_head = slot as usize;
        debug_assert!(self.num_allocated_slots > 0);
        self.num_allocated_slots -= 1;
    }

    /// Reset for reuse after its pages were decommitted and recommitted.
    pub fn reset_decommitted(&mut self) {
        debug_assert_eq!(self.state, SpanState::Decommitted);
        self.freelist_head = 0;
        self.num_allocated_slots = 0;
        self.num_unprovisioned_slots = self.num_slots() as u16;
        self.raw_size = 0;
        self.state = SpanState::Active;
    }
}

/// Header at the base of every super page (partition page 0).
pub struct SuperPageHeader {
    /// Owning root. Verified against the root's `inverted_self` on free.
    pub root: *mut PartitionRoot,
    /// Link in the root's list of super pages.
    pub next: *mut SuperPageHeader,
    marker: u32,
    pub spans: [SlotSpan; PARTITION_PAGES_PER_SUPER_PAGE],
}

impl SuperPageHeader {
    #[inline]
    pub fn base(&self) -> usize {
        self as *const SuperPageHeader as usize
    }

    /// Resolve an address inside this super page to its head span entry.
    /// Aborts when the address does not point into a payload span.
    ///
    /// # Safety
    /// `addr` must lie inside this super page.
    pub unsafe fn span_for_addr(&mut self, addr: usize) -> *mut SlotSpan {
        let mut index = (addr - self.base()) >> PARTITION_PAGE_SHIFT;
        if !(FIRST_PAYLOAD_PAGE..PAYLOAD_PAGE_LIMIT).contains(&index) {
            abort_with_message("partalloc: free of non-payload address\n");
        }
        let offset = self.spans[index].page_offset as usize;
        index -= offset;
        let span = &mut self.spans[index];
        if span.marker != SPAN_MARKER || span.page_offset != 0 {
            abort_with_message("partalloc: span metadata corruption\n");
        }
        span as *mut SlotSpan
    }

    /// Initialize the head entry (and trailing page entries) for a span
    /// carved at partition page `page_index`.
    ///
    /// # Safety
    /// The page range must lie in the payload area and be unused.
    pub unsafe fn init_span(&mut self, page_index: usize, bucket_index: usize) -> *mut SlotSpan {
        let slot_size = bucket::bucket_slot_size(bucket_index);
        let pages = bucket::partition_pages_per_span(slot_size);
        debug_assert!(page_index >= FIRST_PAYLOAD_PAGE);
        debug_assert!(page_index + pages <= PAYLOAD_PAGE_LIMIT);
        for i in 1..pages {
            let entry = &mut self.spans[page_index + i];
            entry.page_offset = i as u8;
            entry.marker = SPAN_MARKER;
        }
        let span = &mut self.spans[page_index];
        span.freelist_head = 0;
        span.next_span = ptr::null_mut();
        span.raw_size = 0;
        span.bucket_index = bucket_index as u16;
        span.num_allocated_slots = 0;
        span.num_unprovisioned_slots = bucket::slots_per_span(slot_size) as u16;
        span.page_offset = 0;
        span.state = SpanState::Active;
        span.empty_ring_index = -1;
        span.marker = SPAN_MARKER;
        span as *mut SlotSpan
    }
}

/// Set up a fresh super page: write the header, arm the trailing guard page.
/// Registration in the span map and extent linking are the caller's job.
///
/// # Safety
/// `base` must be a super-page-aligned, committed reservation of
/// `SUPER_PAGE_SIZE` bytes owned by `root`.
pub unsafe fn init_super_page(base: *mut u8, root: *mut PartitionRoot) -> *mut SuperPageHeader {
    let header = base as *mut SuperPageHeader;
    debug_assert!(core::mem::size_of::<SuperPageHeader>() <= PARTITION_PAGE_SIZE);
    (*header).root = root;
    (*header).next = ptr::null_mut();
    (*header).marker = SUPER_PAGE_MARKER;
    for entry in (*header).spans.iter_mut() {
        *entry = SlotSpan {
            freelist_head: 0,
            next_span: ptr::null_mut(),
            raw_size: 0,
            bucket_index: 0,
            num_allocated_slots: 0,
            num_unprovisioned_slots: 0,
            page_offset: 0,
            state: SpanState::Decommitted,
            empty_ring_index: -1,
            marker: 0,
        };
    }
    let guard = base.add((PARTITION_PAGES_PER_SUPER_PAGE - 1) << PARTITION_PAGE_SHIFT);
    page_provider::guard_pages(guard, PARTITION_PAGE_SIZE);
    header
}

/// Verify a header looks like one we wrote. Cheap sanity check on the free
/// path before trusting `root`.
#[inline]
pub fn check_header_marker(header: *const SuperPageHeader) {
    let ok = unsafe { (*header).marker == SUPER_PAGE_MARKER };
    if !ok {
        abort_with_message("partalloc: super page header corruption\n");
    }
}
