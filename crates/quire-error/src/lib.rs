#![forbid(unsafe_code)]
//! Error types for quire.
//!
//! # Error Taxonomy
//!
//! quire distinguishes four classes of failure, and the class decides how an
//! error travels:
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Transient/retryable | pool exhaustion, lock contention | retried internally; surfaces only as `WouldBlock` when the caller asked for non-blocking semantics |
//! | Sticky I/O | `DeviceIo`, `NoSpace` | reported on the failing call *and* latched on the owning `AddressSpace`; the latch is drained exactly once by a later sync/wait caller |
//! | Consistency | `Corruption` | fatal for the operation; logged and never swallowed |
//! | Policy rejection | (no variant) | not errors; a refused merge allocates a new request, a full pool blocks for a slot |
//!
//! ## errno mapping
//!
//! Every variant maps to exactly one POSIX errno via [`QuireError::to_errno`].
//! The match is exhaustive so adding a variant without an errno is a compile
//! error.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS errno, else `EIO` |
//! | `DeviceIo` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `WouldBlock` | `EWOULDBLOCK` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `BusFault` | `EFAULT` |
//! | `Corruption` | `EIO` |
//! | `BadRequest` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all quire operations.
#[derive(Debug, Error)]
pub enum QuireError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-level transfer failure at a known sector.
    ///
    /// Raised by a driver's completion path. The sector identifies the
    /// smallest completed unit that failed, not the whole request.
    #[error("device I/O error at sector {sector}: {detail}")]
    DeviceIo { sector: u64, detail: String },

    /// Block allocation failed: the backing store is out of space.
    #[error("no space left on device")]
    NoSpace,

    /// The operation would need to block and the caller asked not to.
    ///
    /// Readahead submissions carry this instead of sleeping for a request
    /// slot; it is also the non-blocking lookup result.
    #[error("operation would block")]
    WouldBlock,

    /// Page allocation failed under memory pressure.
    #[error("out of memory")]
    OutOfMemory,

    /// A fault landed beyond end-of-file.
    #[error("access beyond end of file")]
    BusFault,

    /// An in-memory invariant check failed.
    ///
    /// Indicates corruption risk; must never be silently swallowed.
    #[error("consistency error: {0}")]
    Corruption(String),

    /// Malformed request: bad geometry, out-of-bounds transfer, invalid
    /// configuration.
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl QuireError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceIo { .. } | Self::Corruption(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::OutOfMemory => libc::ENOMEM,
            Self::BusFault => libc::EFAULT,
            Self::BadRequest(_) => libc::EINVAL,
        }
    }

    /// Whether this error should latch as `NoSpace` (as opposed to the
    /// generic I/O latch) on an address space.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

impl Clone for QuireError {
    fn clone(&self) -> Self {
        match self {
            // std::io::Error is not Clone; keep the kind and message.
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::DeviceIo { sector, detail } => Self::DeviceIo {
                sector: *sector,
                detail: detail.clone(),
            },
            Self::NoSpace => Self::NoSpace,
            Self::WouldBlock => Self::WouldBlock,
            Self::OutOfMemory => Self::OutOfMemory,
            Self::BusFault => Self::BusFault,
            Self::Corruption(detail) => Self::Corruption(detail.clone()),
            Self::BadRequest(detail) => Self::BadRequest(detail.clone()),
        }
    }
}

/// Result alias using `QuireError`.
pub type Result<T> = std::result::Result<T, QuireError>;
