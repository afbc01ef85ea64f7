//! A boundary-tag, first-fit dynamic memory allocator over a single,
//! fixed-capacity region of anonymous virtual memory.
//!
//! This crate provides [`Allocator`], a `malloc`/`free`/`calloc`/`realloc`
//! family implemented as an implicit free list: every block carries a
//! header and a duplicate footer boundary tag, which lets the allocator
//! walk the block sequence in either direction and coalesce adjacent free
//! blocks without an explicit free-list data structure.
//!
//! # Usage
//! ```
//! use implicit_heap::Allocator;
//!
//! static HEAP: Allocator = Allocator::new();
//!
//! let p = HEAP.alloc(12).expect("allocation failed");
//! unsafe {
//!     p.as_ptr().copy_from(b"Hello\0".as_ptr(), 6);
//! }
//! HEAP.free(Some(p));
//! ```
//!
//! The allocator manages a single region reserved once, up front, with an
//! anonymous `mmap` of up to `CAP` bytes (2 MiB by default, see
//! [`MAX_REGION`]). It never shrinks that reservation; `alloc`/`free`/
//! `calloc`/`realloc` only move a high-water mark within it and manage the
//! boundary tags of the blocks carved out below that mark.
//!
//! # Safety and concurrency
//! This allocator is **not** safe to use from more than one thread at a
//! time without external synchronization: the underlying block list is
//! mutated in place with no atomics beyond the outer lock, and that lock
//! exists only to give [`Allocator`]'s methods a `&self` signature, not to
//! make concurrent mutation correct.
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod block;
mod error;
mod heap;
mod region;

use core::ptr::NonNull;

pub use error::{last_error, AllocError};
pub use heap::{Stats, DEFAULT_CHUNK};
pub use region::MAX_REGION;

use error::{clear_last_error, set_last_error};
use heap::Heap;

/// The memory allocator.
///
/// `CAP` bounds the region's total size (defaults to [`MAX_REGION`], 2
/// MiB); `CHUNK` is how many bytes the heap grows by on a first-fit miss
/// (defaults to [`DEFAULT_CHUNK`], 4 KiB). Both are compile-time knobs, the
/// way an embedding crate sizes this allocator's arena for its workload.
///
/// Construct one as a `static` and call its methods through a shared
/// reference; see the crate-level docs for a complete example.
pub struct Allocator<const CAP: usize = MAX_REGION, const CHUNK: usize = DEFAULT_CHUNK> {
    inner: spin::Mutex<Heap<CAP, CHUNK>>,
}

impl<const CAP: usize, const CHUNK: usize> Default for Allocator<CAP, CHUNK> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize, const CHUNK: usize> Allocator<CAP, CHUNK> {
    /// Create a new, uninitialized allocator.
    ///
    /// Initialization (reserving the region and writing the prologue and
    /// epilogue sentinels) happens lazily on the first call to [`init`],
    /// [`alloc`], [`calloc`], or [`realloc`].
    ///
    /// [`init`]: Allocator::init
    /// [`alloc`]: Allocator::alloc
    /// [`calloc`]: Allocator::calloc
    /// [`realloc`]: Allocator::realloc
    #[must_use = "assign the allocator to a static or a binding before calling its methods"]
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Heap::new()),
        }
    }

    /// Reserve the region and lay down the initial free block.
    ///
    /// Idempotent: calling this more than once, or calling it after a
    /// prior `alloc`/`calloc`/`realloc` already triggered lazy
    /// initialization, is a no-op that returns `Ok(())`.
    pub fn init(&self) -> Result<(), AllocError> {
        let mut heap = self.inner.lock();
        let result = heap.init();
        #[cfg(debug_assertions)]
        heap.debug_assert_invariants();
        record(result)
    }

    /// Allocate a block with payload capacity of at least `n` bytes,
    /// D-aligned. `n == 0` fails with [`AllocError::InvalidArg`].
    pub fn alloc(&self, n: usize) -> Option<NonNull<u8>> {
        let mut heap = self.inner.lock();
        let result = heap.alloc(n);
        #[cfg(debug_assertions)]
        heap.debug_assert_invariants();
        to_option(result)
    }

    /// Release a block previously returned by `alloc`/`calloc`/`realloc`.
    /// `p == None` is a no-op. Passing a pointer not currently live is
    /// undefined behavior; this function performs no validation.
    pub fn free(&self, p: Option<NonNull<u8>>) {
        let mut heap = self.inner.lock();
        heap.free(p);
        #[cfg(debug_assertions)]
        heap.debug_assert_invariants();
        clear_last_error();
    }

    /// Allocate `nitems * size` bytes and zero them. Either operand being
    /// zero fails with [`AllocError::InvalidArg`]; an overflowing product
    /// fails with [`AllocError::OutOfMemory`].
    pub fn calloc(&self, nitems: usize, size: usize) -> Option<NonNull<u8>> {
        let mut heap = self.inner.lock();
        let result = heap.calloc(nitems, size);
        #[cfg(debug_assertions)]
        heap.debug_assert_invariants();
        to_option(result)
    }

    /// Resize the block at `p` to hold at least `n` bytes, preserving the
    /// first `min(n, old_payload)` bytes of content. See the crate's
    /// module docs for the full `NULL`/`0`-argument semantics.
    pub fn realloc(&self, p: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        let mut heap = self.inner.lock();
        let result = heap.realloc(p, n);
        #[cfg(debug_assertions)]
        heap.debug_assert_invariants();
        match result {
            Ok(result) => {
                clear_last_error();
                result
            }
            Err(e) => {
                set_last_error(e);
                None
            }
        }
    }

    /// A read-only snapshot of the block list: current region size, and
    /// the number of live and free blocks. Performs a single forward walk
    /// and mutates no state.
    pub fn stats(&self) -> Stats {
        self.inner.lock().stats()
    }

    /// Panics if any structural invariant of the block list is violated.
    /// Compiled out entirely when `debug_assertions` is off.
    #[cfg(debug_assertions)]
    pub fn debug_assert_invariants(&self) {
        self.inner.lock().debug_assert_invariants();
    }
}

fn to_option<T>(result: Result<T, AllocError>) -> Option<T> {
    match result {
        Ok(value) => {
            clear_last_error();
            Some(value)
        }
        Err(e) => {
            set_last_error(e);
            None
        }
    }
}

fn record(result: Result<(), AllocError>) -> Result<(), AllocError> {
    match &result {
        Ok(()) => clear_last_error(),
        Err(e) => set_last_error(*e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn alloc_zero_is_invalid_arg() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        assert_eq!(heap.alloc(0), None);
        assert_eq!(last_error(), Some(AllocError::InvalidArg));
    }

    #[test]
    fn write_and_read_back_payload() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.alloc(12).unwrap();
        let msg = b"Hello\0";
        // SAFETY: `p` addresses at least 12 writable bytes.
        unsafe { p.as_ptr().copy_from(msg.as_ptr(), msg.len()) };
        // SAFETY: we just wrote `msg.len()` bytes there.
        let read = unsafe { core::slice::from_raw_parts(p.as_ptr(), 5) };
        assert_eq!(read, b"Hello");
    }

    #[test]
    fn two_live_allocations_do_not_alias() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p1 = heap.alloc(12).unwrap();
        // SAFETY: 12 writable bytes.
        unsafe { p1.as_ptr().copy_from(b"Hello".as_ptr(), 5) };
        let p2 = heap.alloc(8).unwrap();
        let n: i32 = 13;
        // SAFETY: 8 writable bytes, i32 fits and p2 is D-aligned (>= 4).
        unsafe { p2.as_ptr().cast::<i32>().write_unaligned(n) };

        // SAFETY: still valid, `p1` wasn't touched by the second alloc.
        let read = unsafe { core::slice::from_raw_parts(p1.as_ptr(), 5) };
        assert_eq!(read, b"Hello");
        // SAFETY: see above.
        assert_eq!(unsafe { p2.as_ptr().cast::<i32>().read_unaligned() }, n);
        assert_ne!(p1, p2);
    }

    #[test]
    fn free_then_alloc_reuses_first_fit() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.alloc(12).unwrap();
        heap.free(Some(p));
        let q = heap.alloc(12).unwrap();
        // first fit should reuse the just-freed block
        assert_eq!(p, q);
        let msg = b"World";
        // SAFETY: 12 writable bytes.
        unsafe { q.as_ptr().copy_from(msg.as_ptr(), msg.len()) };
        // SAFETY: see above.
        let read = unsafe { core::slice::from_raw_parts(q.as_ptr(), 5) };
        assert_eq!(read, b"World");
    }

    #[test]
    fn freeing_two_adjacent_blocks_coalesces() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p1 = heap.alloc(12).unwrap();
        let p2 = heap.alloc(12).unwrap();
        heap.free(Some(p1));
        // freeing p1 alone leaves it and the unused tail of the initial
        // chunk as two separate free blocks (p1 is boxed in by p2, which
        // is still live, so there is nothing to its right to merge with).
        assert_eq!(heap.stats().free_blocks, 2);

        heap.free(Some(p2));
        // freeing p2 merges p1, p2 and the tail into a single free block.
        assert_eq!(heap.stats().free_blocks, 1);

        let q = heap.alloc(24);
        assert!(q.is_some());
    }

    #[test]
    fn alloc_larger_than_region_fails_out_of_memory() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        assert_eq!(heap.alloc(64 * 1024), None);
        assert_eq!(last_error(), Some(AllocError::OutOfMemory));
    }

    #[test]
    fn calloc_zeroes_payload() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.calloc(10, size_of::<u8>()).unwrap();
        // SAFETY: 10 writable, zeroed bytes.
        let read = unsafe { core::slice::from_raw_parts(p.as_ptr(), 10) };
        assert_eq!(read, &[0u8; 10]);
    }

    #[test]
    fn calloc_rejects_zero_operands() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        assert_eq!(heap.calloc(0, 4), None);
        assert_eq!(heap.calloc(4, 0), None);
        assert_eq!(heap.calloc(0, 0), None);
        assert_eq!(last_error(), Some(AllocError::InvalidArg));
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.alloc(10).unwrap();
        // SAFETY: 10 writable bytes.
        unsafe { core::ptr::write_bytes(p.as_ptr(), 15, 10) };
        let q = heap.realloc(Some(p), 20).unwrap();
        // SAFETY: `realloc` guarantees the first 10 bytes survive.
        let read = unsafe { core::slice::from_raw_parts(q.as_ptr(), 10) };
        assert_eq!(read, &[15u8; 10]);
    }

    #[test]
    fn realloc_null_zero_is_null() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        assert_eq!(heap.realloc(None, 0), None);
        assert_eq!(last_error(), None);
    }

    #[test]
    fn realloc_null_nonzero_behaves_like_alloc() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.realloc(None, 16).unwrap();
        // SAFETY: freshly allocated 16-byte payload.
        unsafe { p.as_ptr().write(7) };
    }

    #[test]
    fn realloc_nonnull_zero_frees_and_returns_null() {
        let heap: Allocator<{ 64 * 1024 }> = Allocator::new();
        let p = heap.alloc(16).unwrap();
        assert_eq!(heap.realloc(Some(p), 0), None);
        // the freed block should be reusable by a subsequent allocation
        let q = heap.alloc(16).unwrap();
        assert_eq!(p, q);
    }
}
