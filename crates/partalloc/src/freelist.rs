//! Encoded intrusive free list.
//!
//! Free slots double as list nodes: the first word of a free slot holds the
//! address of the next free slot, encoded so that the raw bytes are neither a
//! valid pointer nor null. The encoding is the byte-swapped complement of the
//! address; a heap overflow that scribbles plausible pointer values into a
//! free slot will fail validation on decode.

use crate::util::abort_with_message;

/// Encoded next-pointer word, as stored in the first bytes of a free slot.
/// `0` as a plain pointer never occurs; the encoded null constant below is
/// what a list tail looks like in memory.
pub type EncodedPtr = usize;

/// What encoded null looks like: complement then byte swap of 0.
pub const ENCODED_NULL: EncodedPtr = (!0usize).swap_bytes();

#[inline(always)]
pub const fn encode(ptr: usize) -> EncodedPtr {
    (!ptr).swap_bytes()
}

#[inline(always)]
const fn decode_raw(encoded: EncodedPtr) -> usize {
    !encoded.swap_bytes()
}

/// Decode an entry read from a free slot, validating that the target lies in
/// `[payload_base, payload_end)` on a `slot_size` stride. A tail entry decodes
/// to 0. Any other out-of-range or misaligned value means the freelist was
/// overwritten, which is unrecoverable.
#[inline]
pub fn decode_checked(
    encoded: EncodedPtr,
    payload_base: usize,
    payload_end: usize,
    slot_size: usize,
) -> usize {
    let ptr = decode_raw(encoded);
    if ptr == 0 {
        return 0;
    }
    if ptr < payload_base || ptr >= payload_end || (ptr - payload_base) % slot_size != 0 {
        abort_with_message("partalloc: freelist corruption detected\n");
    }
    ptr
}

/// Write the encoded next-pointer into the slot at `slot`.
///
/// # Safety
/// `slot` must point to at least `size_of::<usize>()` writable bytes of a
/// free slot.
#[inline(always)]
pub unsafe fn write_entry(slot: *mut u8, next: usize) {
    (slot as *mut EncodedPtr).write(encode(next));
}

/// Read the encoded next-pointer stored in the slot at `slot`.
///
/// # Safety
/// `slot` must point to a free slot previously written by `write_entry`.
#[inline(always)]
pub unsafe fn read_entry(slot: *const u8) -> EncodedPtr {
    (slot as *const EncodedPtr).read()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_involutive() {
        for &p in &[0usize, 16, 0x7f00_1234_5600, usize::MAX & !0xf] {
            assert_eq!(decode_raw(encode(p)), p);
        }
    }

    #[test]
    fn encoded_values_are_not_plausible_pointers() {
        // A canonical x86-64 user pointer has its top bytes zero; the
        // encoding complements them, so encoded values land in kernel-ish
        // ranges once byte-swapped back.
        let p = 0x7f00_1234_5600usize;
        assert_ne!(encode(p), p);
        assert_ne!(encode(p), 0);
        assert_eq!(encode(0), ENCODED_NULL);
        assert_ne!(ENCODED_NULL, 0);
    }

    #[test]
    fn decode_checked_accepts_members() {
        let base = 0x10_0000usize;
        let end = base + 64 * 16;
        assert_eq!(decode_checked(encode(0), base, end, 16), 0);
        assert_eq!(decode_checked(encode(base), base, end, 16), base);
        assert_eq!(decode_checked(encode(base + 32), base, end, 16), base + 32);
        assert_eq!(
            decode_checked(encode(end - 16), base, end, 16),
            end - 16
        );
    }

    #[test]
    fn slot_round_trip_through_memory() {
        let mut slot = [0u8; 16];
        let next = 0x5555_0000usize;
        unsafe {
            write_entry(slot.as_mut_ptr(), next);
            let enc = read_entry(slot.as_ptr());
            assert_eq!(enc, encode(next));
        }
        // The raw bytes in the slot are not the pointer itself.
        assert_ne!(&slot[..8], &next.to_ne_bytes()[..]);
    }
}
