//! Bucket size schedule and the size -> bucket index lookup.
//!
//! Buckets are spaced 8 per size doubling, which bounds worst-case internal
//! waste to one step, i.e. 12.5% of the slot size. Small doublings whose step
//! would fall under the 16-byte slot alignment contribute fewer entries
//! (16, 32, 48, 64, 80, ... up to 512 KiB).

use crate::slot_span::SlotSpan;
use crate::util::{PARTITION_PAGE_SIZE, MIN_ALIGN};
use core::ptr;

pub const MIN_BUCKET_SIZE: usize = 16;
pub const MAX_BUCKETED_SIZE: usize = 512 * 1024;
const BUCKETS_PER_DOUBLING: usize = 8;

const fn count_buckets() -> usize {
    let mut count = 0;
    let mut prev = 0usize;
    let mut base = MIN_BUCKET_SIZE;
    while base <= MAX_BUCKETED_SIZE {
        let step = base / BUCKETS_PER_DOUBLING;
        let mut i = 0;
        while i < BUCKETS_PER_DOUBLING {
            let s = base + i * step;
            if s <= MAX_BUCKETED_SIZE && s % MIN_ALIGN == 0 && s > prev {
                count += 1;
                prev = s;
            }
            i += 1;
        }
        base *= 2;
    }
    count
}

pub const NUM_BUCKETS: usize = count_buckets();

const fn build_bucket_sizes() -> [usize; NUM_BUCKETS] {
    let mut table = [0usize; NUM_BUCKETS];
    let mut idx = 0;
    let mut prev = 0usize;
    let mut base = MIN_BUCKET_SIZE;
    while base <= MAX_BUCKETED_SIZE {
        let step = base / BUCKETS_PER_DOUBLING;
        let mut i = 0;
        while i < BUCKETS_PER_DOUBLING {
            let s = base + i * step;
            if s <= MAX_BUCKETED_SIZE && s % MIN_ALIGN == 0 && s > prev {
                table[idx] = s;
                idx += 1;
                prev = s;
            }
            i += 1;
        }
        base *= 2;
    }
    table
}

/// The bucket size table, sorted ascending.
pub const BUCKET_SIZES: [usize; NUM_BUCKETS] = build_bucket_sizes();

// The order of a size is its bit length; bucketed sizes span orders 5..=20
// (17..32 byte requests up to 512 KiB). One lookup row per order, one column
// per sub-order step.
const MIN_ORDER: usize = 5;
const MAX_ORDER: usize = 20;
const NUM_ORDERS: usize = MAX_ORDER - MIN_ORDER + 1;

const fn build_order_lookup() -> [u16; NUM_ORDERS * BUCKETS_PER_DOUBLING] {
    let sizes = build_bucket_sizes();
    let mut table = [0u16; NUM_ORDERS * BUCKETS_PER_DOUBLING];
    let mut order = MIN_ORDER;
    while order <= MAX_ORDER {
        let base = 1usize << (order - 1);
        let step = 1usize << (order - 4);
        let mut sub = 0;
        while sub < BUCKETS_PER_DOUBLING {
            let target = base + sub * step;
            // Smallest bucket >= target; unreachable cells get the sentinel
            // last index.
            let mut found = (NUM_BUCKETS - 1) as u16;
            let mut i = 0;
            while i < NUM_BUCKETS {
                if sizes[i] >= target {
                    found = i as u16;
                    break;
                }
                i += 1;
            }
            table[(order - MIN_ORDER) * BUCKETS_PER_DOUBLING + sub] = found;
            sub += 1;
        }
        order += 1;
    }
    table
}

static ORDER_LOOKUP: [u16; NUM_ORDERS * BUCKETS_PER_DOUBLING] = build_order_lookup();

/// Map an (extras-adjusted) size to the index of the smallest bucket that
/// holds it. Returns `None` for sizes that must go to the direct map.
#[inline]
pub fn size_to_bucket_index(size: usize) -> Option<usize> {
    if size > MAX_BUCKETED_SIZE {
        return None;
    }
    let size = if size < MIN_BUCKET_SIZE {
        MIN_BUCKET_SIZE
    } else {
        size
    };
    let order = (usize::BITS - size.leading_zeros()) as usize;
    let base = 1usize << (order - 1);
    let shift = order - 4;
    let sub = (size - base + (1 << shift) - 1) >> shift;
    let (order, sub) = if sub == BUCKETS_PER_DOUBLING {
        (order + 1, 0)
    } else {
        (order, sub)
    };
    debug_assert!((MIN_ORDER..=MAX_ORDER).contains(&order));
    Some(ORDER_LOOKUP[(order - MIN_ORDER) * BUCKETS_PER_DOUBLING + sub] as usize)
}

/// Slot size of a bucket.
#[inline(always)]
pub fn bucket_slot_size(index: usize) -> usize {
    BUCKET_SIZES[index]
}

// ---------------------------------------------------------------------------
// Span geometry
// ---------------------------------------------------------------------------

/// Payload target for multi-slot spans: 4 partition pages.
const SPAN_TARGET_PAGES: usize = 4;

/// Number of partition pages a slot span of this bucket occupies.
#[inline]
pub const fn partition_pages_per_span(slot_size: usize) -> usize {
    if slot_size <= PARTITION_PAGE_SIZE {
        SPAN_TARGET_PAGES
    } else {
        (slot_size + PARTITION_PAGE_SIZE - 1) / PARTITION_PAGE_SIZE
    }
}

/// Total bytes of a slot span of this bucket.
#[inline]
pub const fn span_bytes(slot_size: usize) -> usize {
    partition_pages_per_span(slot_size) * PARTITION_PAGE_SIZE
}

/// Slots carved per span.
#[inline]
pub const fn slots_per_span(slot_size: usize) -> usize {
    span_bytes(slot_size) / slot_size
}

/// Single-slot spans record the raw (extras-adjusted) request so usable-size
/// queries report the true capacity rather than the bucket's nominal size.
#[inline]
pub const fn can_store_raw_size(slot_size: usize) -> bool {
    slots_per_span(slot_size) == 1
}

/// One bucket: the set of slot spans sharing one nominal slot size.
/// Lives in the root's fixed bucket array; all fields are guarded by the
/// root lock.
pub struct Bucket {
    pub slot_size: usize,
    /// Head of the active span list. May transiently contain full or empty
    /// spans; the slow path prunes them while scanning.
    pub active_head: *mut SlotSpan,
    /// Spans whose pages have been returned to the OS but whose address
    /// space is still reserved for this bucket.
    pub decommitted_head: *mut SlotSpan,
    pub num_full_spans: usize,
}

impl Bucket {
    pub const fn new() -> Self {
        Bucket {
            slot_size: 0,
            active_head: ptr::null_mut(),
            decommitted_head: ptr::null_mut(),
            num_full_spans: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_sizes_sorted_and_aligned() {
        for i in 1..NUM_BUCKETS {
            assert!(
                BUCKET_SIZES[i] > BUCKET_SIZES[i - 1],
                "bucket {} ({}) <= bucket {} ({})",
                i,
                BUCKET_SIZES[i],
                i - 1,
                BUCKET_SIZES[i - 1]
            );
        }
        for &s in &BUCKET_SIZES {
            assert_eq!(s % MIN_ALIGN, 0, "bucket size {} not aligned", s);
        }
        assert_eq!(BUCKET_SIZES[0], MIN_BUCKET_SIZE);
        assert_eq!(BUCKET_SIZES[NUM_BUCKETS - 1], MAX_BUCKETED_SIZE);
    }

    #[test]
    fn lookup_returns_minimal_bucket() {
        for &s in &[1usize, 15, 16, 17, 31, 32, 33, 100, 4000, 4096, 5000] {
            let idx = size_to_bucket_index(s).unwrap();
            assert!(BUCKET_SIZES[idx] >= s, "bucket too small for {}", s);
            if idx > 0 {
                assert!(
                    BUCKET_SIZES[idx - 1] < s.max(MIN_BUCKET_SIZE),
                    "bucket for {} is not minimal",
                    s
                );
            }
        }
    }

    #[test]
    fn lookup_matches_linear_scan_exhaustively() {
        let mut s = 1;
        while s <= MAX_BUCKETED_SIZE {
            let idx = size_to_bucket_index(s).unwrap();
            let want = BUCKET_SIZES
                .iter()
                .position(|&b| b >= s.max(MIN_BUCKET_SIZE))
                .unwrap();
            assert_eq!(idx, want, "mismatch at size {}", s);
            // Stride grows so the test stays fast while still probing every
            // region of the table; boundaries get probed via s and s+1.
            let next = BUCKET_SIZES[idx];
            s = if s == next { next + 1 } else { next };
        }
    }

    #[test]
    fn boundary_sizes() {
        assert_eq!(size_to_bucket_index(0), Some(0));
        assert_eq!(size_to_bucket_index(MAX_BUCKETED_SIZE), Some(NUM_BUCKETS - 1));
        assert_eq!(size_to_bucket_index(MAX_BUCKETED_SIZE + 1), None);
    }

    #[test]
    fn worst_case_waste_bounded() {
        // One-past-a-bucket lands in the next bucket; waste must stay within
        // ~12.5% plus the alignment floor for tiny sizes.
        for i in 0..NUM_BUCKETS - 1 {
            let s = BUCKET_SIZES[i] + 1;
            let idx = size_to_bucket_index(s).unwrap();
            let waste = BUCKET_SIZES[idx] - s;
            assert!(
                waste * 8 <= BUCKET_SIZES[idx] || BUCKET_SIZES[idx] <= 128,
                "waste {} too high for size {} (bucket {})",
                waste,
                s,
                BUCKET_SIZES[idx]
            );
        }
    }

    #[test]
    fn span_geometry() {
        // Small buckets share a multi-slot span; huge buckets get one slot.
        assert_eq!(slots_per_span(16), 4096);
        assert!(slots_per_span(MAX_BUCKETED_SIZE) == 1);
        assert!(can_store_raw_size(MAX_BUCKETED_SIZE));
        assert!(!can_store_raw_size(16));
        for &s in &BUCKET_SIZES {
            assert!(slots_per_span(s) >= 1);
            assert!(slots_per_span(s) <= u16::MAX as usize);
            assert!(span_bytes(s) % PARTITION_PAGE_SIZE == 0);
        }
    }
}
