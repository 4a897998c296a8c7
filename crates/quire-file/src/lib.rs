#![forbid(unsafe_code)]
//! Buffered file I/O over the quire page cache.
//!
//! A [`CachedFile`] binds an address space (from `quire-cache`) to a disk
//! (from `quire-block`) through a [`BlockMapper`], the seam where a real
//! filesystem would plug in its allocation tables. On top of that binding
//! this crate implements the buffered I/O paths:
//!
//! - reads with sequential readahead ([`FileHandle::read`]),
//! - two-phase writes ([`CachedFile::write`], [`WriteTransaction`]),
//! - the memory-fault path with read-around ([`FileHandle::fault`]),
//! - the writeback engine ([`CachedFile::flush`], [`FlushMode`]),
//! - and the sync front end ([`CachedFile::fsync`], [`sync_all`]).
//!
//! Speculative reads are submitted fail-fast: when the device's request
//! pool is full they are dropped, never queued behind it, and a later
//! demand read repairs the page.

mod buffer;
mod fault;
mod mapping;
mod read;
mod sync;
mod write;
mod writeback;

pub use fault::AccessHint;
pub use mapping::{BlockMapper, CachedFile, FileHandle, LinearMapper, MappedBlock};
pub use read::ReadaheadConfig;
pub use sync::sync_all;
pub use write::WriteTransaction;
pub use writeback::FlushMode;
