//! The ambient error taxonomy.
//!
//! The public entry points in [`crate::Allocator`] report failure the same
//! way the C `malloc` family does: a NULL-equivalent return plus an ambient
//! "what went wrong" indicator, recorded here and retrievable via
//! [`last_error`]. Internally the crate uses [`AllocError`] as an ordinary
//! [`core::fmt::Display`]-able error type composed with `?`; only the
//! outermost calls flatten it back down to the NULL-plus-indicator
//! convention.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Why an allocator operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-size request was made where that is defined to fail, e.g.
    /// `alloc(0)` or `calloc` with either operand zero.
    InvalidArg,
    /// The region's fixed ceiling was reached, or extending it was
    /// otherwise rejected (including an overflowing `calloc` product).
    OutOfMemory,
    /// The region layer could not reserve its initial range.
    InitFailed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidArg => "invalid argument (zero-size request)",
            AllocError::OutOfMemory => "out of memory: region ceiling reached",
            AllocError::InitFailed => "failed to initialize the backing region",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for AllocError {}

// `0` means "no error recorded". The three variants are packed starting at
// `1` so that the sentinel never collides with a real value.
const NONE: u8 = 0;
const INVALID_ARG: u8 = 1;
const OUT_OF_MEMORY: u8 = 2;
const INIT_FAILED: u8 = 3;

static LAST_ERROR: AtomicU8 = AtomicU8::new(NONE);

pub(crate) fn set_last_error(err: AllocError) {
    let code = match err {
        AllocError::InvalidArg => INVALID_ARG,
        AllocError::OutOfMemory => OUT_OF_MEMORY,
        AllocError::InitFailed => INIT_FAILED,
    };
    LAST_ERROR.store(code, Ordering::Relaxed);
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.store(NONE, Ordering::Relaxed);
}

/// Return the error recorded by the most recent failing call made by this
/// crate, mirroring `errno` for callers who need the C-family contract.
///
/// `None` means the most recent call (if any) succeeded.
pub fn last_error() -> Option<AllocError> {
    match LAST_ERROR.load(Ordering::Relaxed) {
        INVALID_ARG => Some(AllocError::InvalidArg),
        OUT_OF_MEMORY => Some(AllocError::OutOfMemory),
        INIT_FAILED => Some(AllocError::InitFailed),
        _ => None,
    }
}
