#![forbid(unsafe_code)]
//! The page cache core: pages, per-block buffer state, and address spaces.
//!
//! This crate holds state and synchronization only; it issues no I/O.
//! A [`CachedPage`] is one page of file data with an atomic flag word; a
//! [`BufferHead`] tracks one block-sized window of a page; an
//! [`AddressSpace`] indexes one file's pages and files each on a clean,
//! dirty, or under-I/O list. Sleeping on page and buffer bits goes through
//! the [`CacheContext`] wait table, which is built once per cache instance
//! and shared by every space.
//!
//! The I/O half, filling pages from disk and writing dirty ones back,
//! lives in `quire-file`, layered over `quire-block`.

mod page;
mod space;
mod wait;

pub use page::{BufferHead, CachedPage};
pub use space::{AddressSpace, SpaceStats};
pub use wait::CacheContext;
