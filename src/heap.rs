//! The allocator core: the boundary-tag implicit block list and the
//! `init`/`alloc`/`free`/`calloc`/`realloc` algorithms built on top of it.

use core::cmp::min;
use core::ptr::{self, NonNull};

use crate::block::{
    self, block_allocated, block_size, footer_ptr, header_ptr, next_block, prev_block, read_tag,
    write_block_tags, write_tag, DWORD, MIN_BLOCK, WORD,
};
use crate::error::AllocError;
use crate::region::Region;

/// Default amount (bytes) the heap grows by when no free block fits a
/// request and the region must be extended.
pub const DEFAULT_CHUNK: usize = 4096;

enum State {
    Uninitialized,
    Ready {
        region: Region,
        /// Canonical heap-start pointer: the prologue block's payload
        /// address (equivalently, the prologue's footer address).
        heap_start: NonNull<u8>,
    },
}

/// The implicit free-list allocator core, parameterized by the region's
/// capacity ceiling and the chunk size used when extending the heap.
pub(crate) struct Heap<const CAP: usize, const CHUNK: usize> {
    state: State,
}

// SAFETY: a `Heap` owns its `Region` exclusively; all access goes through
// `&mut self`, and the crate's public surface serializes access with a
// `spin::Mutex` (see `Allocator`). There is no thread-local state.
unsafe impl<const CAP: usize, const CHUNK: usize> Send for Heap<CAP, CHUNK> {}

/// A read-only snapshot of the heap's block list, for tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub region_size: usize,
    pub live_blocks: usize,
    pub free_blocks: usize,
}

impl<const CAP: usize, const CHUNK: usize> Heap<CAP, CHUNK> {
    pub const fn new() -> Self {
        Self {
            state: State::Uninitialized,
        }
    }

    fn region_mut(&mut self) -> &mut Region {
        match &mut self.state {
            State::Ready { region, .. } => region,
            State::Uninitialized => unreachable!("heap accessed before init"),
        }
    }

    fn heap_start(&self) -> NonNull<u8> {
        match &self.state {
            State::Ready { heap_start, .. } => *heap_start,
            State::Uninitialized => unreachable!("heap accessed before init"),
        }
    }

    /// Payload pointer of the first real block after the permanent
    /// prologue sentinel (always exactly `DWORD` bytes, so it can never be
    /// mistaken for a real block, which is always at least `MIN_BLOCK`).
    fn first_block(&self) -> NonNull<u8> {
        // SAFETY: the prologue is always a valid block of size `DWORD`
        // immediately at `heap_start`.
        unsafe { next_block(self.heap_start(), DWORD) }
    }

    /// Reserve the region and lay down the prologue/epilogue sentinels
    /// plus one initial free chunk. Idempotent: a second call is a no-op.
    pub fn init(&mut self) -> Result<(), AllocError> {
        if matches!(self.state, State::Ready { .. }) {
            return Ok(());
        }

        let mut region = Region::init(CAP)?;
        // 4 words: alignment padding, prologue header, prologue footer,
        // epilogue header.
        let base = region.extend(4 * WORD)?;
        // SAFETY: `base` addresses 4 freshly-reserved, writable words.
        unsafe {
            write_tag(base, 0);
            write_tag(offset(base, WORD), block::pack(DWORD, true));
            write_tag(offset(base, 2 * WORD), block::pack(DWORD, true));
            write_tag(offset(base, 3 * WORD), block::pack(0, true));
        }
        let heap_start = offset(base, 2 * WORD);

        self.state = State::Ready { region, heap_start };
        log::debug!("init: prologue/epilogue written, heap_start={heap_start:p}");

        self.extend_heap(CHUNK / WORD)?;
        Ok(())
    }

    /// Grow the region by `words` words (rounded up to an even count),
    /// turning the new space into a free block coalesced with whatever
    /// preceded it. Returns the payload pointer of the resulting free
    /// block.
    fn extend_heap(&mut self, words: usize) -> Result<NonNull<u8>, AllocError> {
        let words = if words % 2 != 0 { words + 1 } else { words };
        let bytes = words * WORD;

        let bp = self.region_mut().extend(bytes)?;
        // SAFETY: `region.extend` just reserved `bytes` writable bytes
        // starting at `bp`, which is exactly the layout a free block of
        // size `bytes` needs (header + payload + footer), followed
        // immediately by one more word for the new epilogue header, which
        // is the word the old epilogue header occupied, now one past the
        // new block.
        unsafe {
            write_block_tags(bp, bytes, false);
            let epilogue = header_ptr(next_block(bp, bytes));
            write_tag(epilogue, block::pack(0, true));
        }
        log::trace!("extend_heap: grew region by {bytes} bytes at {bp:p}");

        Ok(self.coalesce(bp))
    }

    /// First-fit search for a free block of at least `asize` bytes,
    /// starting just after the prologue.
    fn find_fit(&self, asize: usize) -> Option<NonNull<u8>> {
        let mut bp = self.first_block();
        loop {
            // SAFETY: `bp` is always a valid payload pointer of a block
            // reachable from `first_block` by repeated `next_block` steps,
            // terminating at the epilogue (size 0).
            let size = unsafe { block_size(bp) };
            if size == 0 {
                return None;
            }
            // SAFETY: see above.
            if !unsafe { block_allocated(bp) } && size >= asize {
                return Some(bp);
            }
            // SAFETY: see above.
            bp = unsafe { next_block(bp, size) };
        }
    }

    /// Place an allocation of `asize` bytes into the free block at `bp`,
    /// splitting off the remainder if it is large enough to host another
    /// block.
    fn place(&mut self, bp: NonNull<u8>, asize: usize) {
        // SAFETY: `bp` is a free block just returned by `find_fit` or
        // `extend_heap`.
        let csize = unsafe { block_size(bp) };
        if csize - asize >= MIN_BLOCK {
            // SAFETY: `bp` has `csize >= asize + MIN_BLOCK` writable bytes.
            unsafe {
                write_block_tags(bp, asize, true);
                let rest = next_block(bp, asize);
                write_block_tags(rest, csize - asize, false);
            }
        } else {
            // SAFETY: `bp` has exactly `csize` writable bytes.
            unsafe { write_block_tags(bp, csize, true) };
        }
    }

    /// Merge the (now-free) block at `bp` with any free physical
    /// neighbors, restoring the no-two-adjacent-free-blocks invariant.
    /// Returns the payload pointer of the (possibly merged) free block.
    fn coalesce(&mut self, bp: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: `bp` is never the first block after the prologue without
        // a valid predecessor footer, since the prologue itself occupies
        // that slot and is permanently allocated.
        let size = unsafe { block_size(bp) };
        // SAFETY: the prologue's footer always precedes the first real
        // block, so reading `bp - DWORD` is always in bounds.
        let prev_alloc = unsafe { block::is_allocated(read_tag(offset_neg(bp, DWORD))) };
        // SAFETY: `bp + size` is always the header of another block: a
        // real successor block or the epilogue.
        let next_bp = unsafe { next_block(bp, size) };
        let next_alloc = unsafe { block_allocated(next_bp) };

        let merged = match (prev_alloc, next_alloc) {
            (true, true) => bp,
            (true, false) => {
                // SAFETY: `next_bp` is a free block with a valid header.
                let next_size = unsafe { block_size(next_bp) };
                let new_size = size + next_size;
                // SAFETY: `bp` now spans both blocks, all of which was
                // previously-mapped, writable memory.
                unsafe { write_block_tags(bp, new_size, false) };
                bp
            }
            (false, true) => {
                // SAFETY: the predecessor's footer is readable at
                // `bp - DWORD` and encodes a free block.
                let prev_bp = unsafe { prev_block(bp) };
                let prev_size = unsafe { block_size(prev_bp) };
                let new_size = prev_size + size;
                unsafe { write_block_tags(prev_bp, new_size, false) };
                prev_bp
            }
            (false, false) => {
                let prev_bp = unsafe { prev_block(bp) };
                let prev_size = unsafe { block_size(prev_bp) };
                let next_size = unsafe { block_size(next_bp) };
                let new_size = prev_size + size + next_size;
                unsafe { write_block_tags(prev_bp, new_size, false) };
                prev_bp
            }
        };
        log::trace!("coalesce: {bp:p} (size {size}) -> {merged:p}");
        merged
    }

    /// Round a requested payload size up to the block size that must be
    /// carved out to host it (header + footer + D-aligned payload).
    fn adjusted_size(n: usize) -> Option<usize> {
        if n <= DWORD {
            return Some(MIN_BLOCK);
        }
        let padded = n.checked_add(DWORD)?.checked_add(DWORD - 1)?;
        Some(DWORD * (padded / DWORD))
    }

    pub fn alloc(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        self.init()?;
        if n == 0 {
            return Err(AllocError::InvalidArg);
        }
        let Some(asize) = Self::adjusted_size(n) else {
            return Err(AllocError::OutOfMemory);
        };

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize);
            return Ok(bp);
        }

        let extend_words = asize.max(CHUNK) / WORD;
        log::debug!("alloc: no fit for {asize} bytes, extending heap");
        let bp = self.extend_heap(extend_words)?;
        self.place(bp, asize);
        Ok(bp)
    }

    pub fn free(&mut self, p: Option<NonNull<u8>>) {
        let Some(bp) = p else { return };
        // SAFETY: the public contract requires `bp` to be a live payload
        // pointer previously returned by this heap; this crate does not
        // (and per the spec's non-goals, cannot) validate that.
        let size = unsafe { block_size(bp) };
        // SAFETY: see above; `size` is the block's own recorded size.
        unsafe { write_block_tags(bp, size, false) };
        self.coalesce(bp);
    }

    pub fn calloc(&mut self, nitems: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if nitems == 0 || size == 0 {
            return Err(AllocError::InvalidArg);
        }
        let total = nitems.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
        let bp = self.alloc(total)?;
        // SAFETY: `alloc` guarantees at least `total` writable payload
        // bytes at `bp`.
        unsafe { ptr::write_bytes(bp.as_ptr(), 0, total) };
        Ok(bp)
    }

    pub fn realloc(
        &mut self,
        p: Option<NonNull<u8>>,
        n: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        match (p, n) {
            (None, 0) => Ok(None),
            (None, n) => self.alloc(n).map(Some),
            (Some(bp), 0) => {
                self.free(Some(bp));
                Ok(None)
            }
            (Some(bp), n) => {
                // SAFETY: `bp` is a live payload pointer by contract.
                let old_size = unsafe { block_size(bp) };
                let old_payload = old_size - 2 * WORD;
                let new_bp = self.alloc(n)?;
                let copy_len = min(n, old_payload);
                // SAFETY: both `bp` and `new_bp` address at least
                // `copy_len` bytes of initialized/writable payload, and
                // `alloc` never returns a block overlapping a still-live
                // one.
                unsafe {
                    ptr::copy_nonoverlapping(bp.as_ptr(), new_bp.as_ptr(), copy_len);
                }
                self.free(Some(bp));
                Ok(Some(new_bp))
            }
        }
    }

    /// Walk the block list once, counting live and free blocks.
    pub fn stats(&self) -> Stats {
        if !matches!(self.state, State::Ready { .. }) {
            return Stats::default();
        }
        let mut bp = self.first_block();
        let mut live_blocks = 0;
        let mut free_blocks = 0;
        loop {
            // SAFETY: see `find_fit`; the walk terminates at the epilogue.
            let size = unsafe { block_size(bp) };
            if size == 0 {
                break;
            }
            // SAFETY: see above.
            if unsafe { block_allocated(bp) } {
                live_blocks += 1;
            } else {
                free_blocks += 1;
            }
            // SAFETY: see above.
            bp = unsafe { next_block(bp, size) };
        }
        let region_size = match &self.state {
            State::Ready { region, .. } => region.size(),
            State::Uninitialized => 0,
        };
        Stats {
            region_size,
            live_blocks,
            free_blocks,
        }
    }

    /// Walk the block list and panic if any structural invariant from the
    /// spec is violated. Compiled out entirely in release builds.
    #[cfg(debug_assertions)]
    pub fn debug_assert_invariants(&self) {
        if !matches!(self.state, State::Ready { .. }) {
            return;
        }
        let mut bp = self.first_block();
        let mut prev_was_free = false;
        loop {
            // SAFETY: see `find_fit`.
            let header = unsafe { read_tag(header_ptr(bp)) };
            let size = block::size_of_tag(header);
            if size == 0 {
                break;
            }
            // SAFETY: `footer_ptr` computes an in-bounds address for any
            // block written by this crate.
            let footer = unsafe { read_tag(footer_ptr(bp, size)) };
            assert_eq!(header, footer, "header/footer mismatch at {bp:p}");
            assert!(size >= MIN_BLOCK, "block at {bp:p} smaller than minimum");
            assert_eq!(size % DWORD, 0, "block at {bp:p} not double-word sized");

            let allocated = block::is_allocated(header);
            assert!(
                !(prev_was_free && !allocated),
                "two adjacent free blocks at/around {bp:p}"
            );
            prev_was_free = !allocated;

            // SAFETY: see `find_fit`.
            bp = unsafe { next_block(bp, size) };
        }
    }
}

/// Offset a pointer forward by `delta` bytes.
///
/// # Safety
/// `ptr + delta` must stay within the bounds of the same allocation.
unsafe fn offset(ptr: NonNull<u8>, delta: usize) -> NonNull<u8> {
    // SAFETY: delegated to the caller.
    unsafe { NonNull::new_unchecked(ptr.as_ptr().add(delta)) }
}

/// Offset a pointer backward by `delta` bytes.
///
/// # Safety
/// `ptr - delta` must stay within the bounds of the same allocation.
unsafe fn offset_neg(ptr: NonNull<u8>, delta: usize) -> NonNull<u8> {
    // SAFETY: delegated to the caller.
    unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(delta)) }
}
