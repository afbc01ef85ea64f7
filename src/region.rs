//! The region layer: a fixed-capacity, bump-allocated byte range backed by
//! a single anonymous `mmap` reservation.
//!
//! The region only grows. [`Region::extend`] never calls into the kernel;
//! it just moves the high-water mark within the mapping reserved once at
//! [`Region::init`] time. This is the same `sbrk`-over-a-fixed-reservation
//! technique the system this crate's algorithm is drawn from uses, adapted
//! so that a `Region` is an ordinary owned value that unmaps itself on drop
//! instead of a single process-global mapping.

use core::ffi::c_void;
use core::ptr::{self, NonNull};

use crate::error::AllocError;

/// Default ceiling on the region's size: 2 MiB.
pub const MAX_REGION: usize = 2 * 1024 * 1024;

/// A fixed-capacity, growable-only byte region reserved with `mmap`.
pub struct Region {
    base: NonNull<u8>,
    /// Offset of the high-water mark relative to `base`. Never exceeds
    /// `capacity`.
    size: usize,
    capacity: usize,
}

// SAFETY: `Region` owns its mapping exclusively and exposes no aliasing
// beyond the raw pointers it hands back to the allocator core, which itself
// guarantees single-threaded access (see the crate-level concurrency note).
unsafe impl Send for Region {}

impl Region {
    /// Reserve `capacity` bytes of anonymous, readable/writable virtual
    /// memory. Fails with [`AllocError::InitFailed`] if the kernel rejects
    /// the mapping.
    pub fn init(capacity: usize) -> Result<Self, AllocError> {
        // SAFETY: the arguments describe a private, anonymous mapping with
        // no backing file descriptor (fd = -1, offset = 0), which is the
        // documented safe usage of `mmap` for this purpose.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::error!("region_init: mmap({capacity}) failed");
            return Err(AllocError::InitFailed);
        }
        // SAFETY: `mmap` succeeded, so `addr` is a valid non-null pointer to
        // `capacity` bytes of mapped memory.
        let base = unsafe { NonNull::new_unchecked(addr.cast::<u8>()) };
        log::debug!("region_init: reserved {capacity} bytes at {base:p}");
        Ok(Self {
            base,
            size: 0,
            capacity,
        })
    }

    /// Advance the high-water mark by `delta` bytes if doing so would not
    /// cross the capacity ceiling. Returns the address of the high-water
    /// mark *before* the advance (the start of the newly-usable range).
    pub fn extend(&mut self, delta: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(new_size) = self.size.checked_add(delta) else {
            log::warn!("region_extend: delta {delta} overflows region size");
            return Err(AllocError::OutOfMemory);
        };
        if new_size > self.capacity {
            log::debug!(
                "region_extend: {delta} bytes would exceed capacity ({} > {})",
                new_size,
                self.capacity
            );
            return Err(AllocError::OutOfMemory);
        }
        // SAFETY: `self.size <= self.capacity` is an invariant maintained by
        // this type, so the resulting pointer stays within the mapping.
        let old_end = unsafe { self.base.as_ptr().add(self.size) };
        self.size = new_size;
        // SAFETY: `old_end` is non-null because it is an offset from the
        // non-null `base` within the mapped range.
        Ok(unsafe { NonNull::new_unchecked(old_end) })
    }

    /// Rewind the high-water mark back to the base without unmapping.
    pub fn reset(&mut self) {
        self.size = 0;
    }

    /// Current logical size of the region (high-water mark minus base).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity ceiling this region was reserved with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The first address of the region.
    pub fn lo(&self) -> NonNull<u8> {
        self.base
    }

    /// The current high-water mark (one past the last valid byte).
    pub fn hi(&self) -> NonNull<u8> {
        // SAFETY: offsetting by `self.size <= self.capacity` stays within
        // (or one-past-the-end of) the mapped range, which is valid for a
        // pointer computation even when it lands exactly at the end.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.size)) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `self.base` was returned by a successful `mmap` of
        // `self.capacity` bytes in `init`, and this is the only place that
        // unmaps it.
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<c_void>(), self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_reports_zero_size() {
        let region = Region::init(4096).unwrap();
        assert_eq!(region.size(), 0);
        assert_eq!(region.capacity(), 4096);
    }

    #[test]
    fn extend_advances_and_returns_old_end() {
        let mut region = Region::init(4096).unwrap();
        let lo = region.lo();
        let first = region.extend(64).unwrap();
        assert_eq!(first, lo);
        let second = region.extend(64).unwrap();
        // SAFETY: test-only pointer arithmetic within the mapped range.
        assert_eq!(second, unsafe { NonNull::new_unchecked(lo.as_ptr().add(64)) });
        assert_eq!(region.size(), 128);
    }

    #[test]
    fn extend_past_capacity_fails() {
        let mut region = Region::init(128).unwrap();
        assert!(region.extend(64).is_ok());
        assert_eq!(region.extend(128), Err(AllocError::OutOfMemory));
        // the high-water mark must not have moved on failure
        assert_eq!(region.size(), 64);
    }

    #[test]
    fn reset_rewinds_without_unmapping() {
        let mut region = Region::init(4096).unwrap();
        region.extend(256).unwrap();
        region.reset();
        assert_eq!(region.size(), 0);
        // the mapping is still valid; we can extend again from scratch
        assert!(region.extend(256).is_ok());
    }
}
