//! Block layout: packing/unpacking the boundary-tag header word and
//! navigating between physically adjacent blocks.
//!
//! Every block is addressed by its *payload pointer*, the address handed
//! to clients by `alloc`. The header lives [`WORD`] bytes before that
//! pointer; the footer duplicates the header and lives at
//! `payload + size - WORD`, where `size` is the block's total size
//! (header + payload + footer). All reads/writes go through
//! [`ptr::read_unaligned`]/[`ptr::write_unaligned`] since a header address
//! is only word-aligned, not necessarily double-word-aligned.

use core::ptr::{self, NonNull};

/// A word: the size of the packed header/footer tag.
pub const WORD: usize = 4;
/// A double word: the alignment unit for block sizes and payload pointers.
pub const DWORD: usize = 8;
/// The smallest legal block size (header + footer + zero payload, rounded
/// up to a double word).
pub const MIN_BLOCK: usize = 2 * DWORD;

const ALLOC_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

/// Pack a block size and allocated flag into a boundary-tag word.
#[inline]
pub fn pack(size: usize, allocated: bool) -> u32 {
    debug_assert_eq!(size & 0x7, 0, "block size must be a multiple of 8");
    size as u32 | (allocated as u32 * ALLOC_BIT)
}

/// Extract the block size encoded in a boundary-tag word.
#[inline]
pub fn size_of_tag(tag: u32) -> usize {
    (tag & SIZE_MASK) as usize
}

/// Extract the allocated flag encoded in a boundary-tag word.
#[inline]
pub fn is_allocated(tag: u32) -> bool {
    tag & ALLOC_BIT != 0
}

/// Address of the header word for the block whose payload starts at `bp`.
#[inline]
pub fn header_ptr(bp: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: callers only ever pass payload pointers that have at least
    // `WORD` bytes of header preceding them (the prologue/heap layout
    // guarantees this for every block reachable via the public API).
    unsafe { NonNull::new_unchecked(bp.as_ptr().sub(WORD)) }
}

/// Address of the footer word for a block of `size` bytes starting at `bp`.
#[inline]
pub fn footer_ptr(bp: NonNull<u8>, size: usize) -> NonNull<u8> {
    // SAFETY: `size` is the block's own total size. The header occupies
    // `[bp - WORD, bp)` and the footer is the last word of the block, i.e.
    // `bp + size - 2*WORD` (`size - DWORD`), which stays in bounds for any
    // block written by this crate.
    unsafe { NonNull::new_unchecked(bp.as_ptr().add(size - DWORD)) }
}

/// Read the boundary-tag word at `header` (or `footer`) `p`.
///
/// # Safety
/// `p` must point at a valid, initialized boundary-tag word.
#[inline]
pub unsafe fn read_tag(p: NonNull<u8>) -> u32 {
    // SAFETY: delegated to the caller.
    unsafe { ptr::read_unaligned(p.as_ptr().cast::<u32>()) }
}

/// Write a boundary-tag word at `p`.
///
/// # Safety
/// `p` must point at writable memory large enough for one [`WORD`].
#[inline]
pub unsafe fn write_tag(p: NonNull<u8>, tag: u32) {
    // SAFETY: delegated to the caller.
    unsafe { ptr::write_unaligned(p.as_ptr().cast::<u32>(), tag) }
}

/// Read the size encoded in the header of the block at payload pointer `bp`.
///
/// # Safety
/// `bp` must be a valid payload pointer of an initialized block.
#[inline]
pub unsafe fn block_size(bp: NonNull<u8>) -> usize {
    // SAFETY: delegated to the caller.
    size_of_tag(unsafe { read_tag(header_ptr(bp)) })
}

/// Read the allocated flag from the header of the block at `bp`.
///
/// # Safety
/// `bp` must be a valid payload pointer of an initialized block.
#[inline]
pub unsafe fn block_allocated(bp: NonNull<u8>) -> bool {
    // SAFETY: delegated to the caller.
    is_allocated(unsafe { read_tag(header_ptr(bp)) })
}

/// Write matching header and footer tags for the block at `bp` with the
/// given `size` and `allocated` flag.
///
/// # Safety
/// `bp` must address `size` writable bytes, including room for the header
/// one word before `bp`.
#[inline]
pub unsafe fn write_block_tags(bp: NonNull<u8>, size: usize, allocated: bool) {
    let tag = pack(size, allocated);
    // SAFETY: delegated to the caller; `header_ptr`/`footer_ptr` compute
    // in-bounds addresses given a correctly sized block.
    unsafe {
        write_tag(header_ptr(bp), tag);
        write_tag(footer_ptr(bp, size), tag);
    }
}

/// Payload pointer of the block physically following the block at `bp`
/// (whose size is `size`).
///
/// # Safety
/// `bp + size` must address the header of another block (i.e. `bp` must
/// not be the last block before the region's current high-water mark).
#[inline]
pub unsafe fn next_block(bp: NonNull<u8>, size: usize) -> NonNull<u8> {
    // SAFETY: delegated to the caller.
    unsafe { NonNull::new_unchecked(bp.as_ptr().add(size)) }
}

/// Payload pointer of the block physically preceding the block at `bp`,
/// found by reading the previous block's footer at `bp - DWORD`.
///
/// # Safety
/// `bp` must not be the first block after the prologue (the prologue's own
/// footer must exist at `bp - DWORD`).
#[inline]
pub unsafe fn prev_block(bp: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: delegated to the caller.
    unsafe {
        let prev_footer = NonNull::new_unchecked(bp.as_ptr().sub(DWORD));
        let prev_size = size_of_tag(read_tag(prev_footer));
        NonNull::new_unchecked(bp.as_ptr().sub(prev_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let tag = pack(32, true);
        assert_eq!(size_of_tag(tag), 32);
        assert!(is_allocated(tag));

        let tag = pack(16, false);
        assert_eq!(size_of_tag(tag), 16);
        assert!(!is_allocated(tag));
    }

    #[test]
    fn header_footer_and_neighbor_math() {
        // A standalone 64-byte buffer playing the role of a tiny region;
        // place a fake block of size 32 starting 4 bytes in so there is
        // room for a fake prologue footer before it.
        let mut buf = [0u8; 64];
        // SAFETY: `buf` is 64 bytes, offset 8 + 32 = 40 <= 64.
        let bp = unsafe { NonNull::new_unchecked(buf.as_mut_ptr().add(8)) };
        unsafe {
            write_block_tags(bp, 32, true);
            assert_eq!(block_size(bp), 32);
            assert!(block_allocated(bp));

            let next = next_block(bp, 32);
            assert_eq!(next.as_ptr(), bp.as_ptr().add(32));

            write_block_tags(next, 16, false);
            let back = prev_block(next);
            assert_eq!(back, bp);
        }
    }
}
