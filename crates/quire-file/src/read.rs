//! Buffered reads and the readahead engine.

use crate::buffer::{read_full_page, ReadKind};
use crate::mapping::{CachedFile, FileHandle};
use quire_cache::CachedPage;
use quire_error::{QuireError, Result};
use quire_types::{ByteOffset, PageIndex, PAGE_SIZE};
use std::sync::Arc;
use tracing::trace;

/// Readahead tunables, fixed per file at construction.
#[derive(Debug, Clone)]
pub struct ReadaheadConfig {
    /// Window after the first sequential hit, in pages.
    pub initial_pages: usize,
    /// Ceiling the window doubles up to.
    pub max_pages: usize,
    /// Fault misses tolerated before read-around turns off for a handle.
    pub miss_limit: u32,
    /// Pages pulled around a faulting page.
    pub readaround_pages: usize,
}

impl Default for ReadaheadConfig {
    fn default() -> Self {
        Self {
            initial_pages: 4,
            max_pages: 32,
            miss_limit: 100,
            readaround_pages: 16,
        }
    }
}

/// Per-handle readahead cursor.
pub(crate) struct ReadaheadState {
    /// Next page index a sequential reader would touch.
    next_expected: u64,
    /// Current window, in pages.
    window: usize,
    /// Fault misses, decayed by hits; read-around stops past the limit.
    pub(crate) fault_misses: u32,
}

impl ReadaheadState {
    pub(crate) fn new(config: &ReadaheadConfig) -> Self {
        Self {
            next_expected: 0,
            window: config.initial_pages,
            fault_misses: 0,
        }
    }
}

/// Track the access at `index` and speculatively start reads ahead of it.
fn sequential_readahead(handle: &FileHandle, index: PageIndex) {
    let file = handle.file();
    let config = file.ra_config();
    let (start, count) = {
        let mut ra = handle.ra().lock();
        if index.0 == ra.next_expected {
            ra.window = (ra.window * 2).min(config.max_pages);
        } else {
            ra.window = config.initial_pages;
        }
        ra.next_expected = index.0 + 1;
        (index.next(), ra.window)
    };
    issue_readahead(file, start, count);
}

/// Start fail-fast reads for up to `count` uncached pages from `start`,
/// clamped to the file's size. Never waits; never reports failure.
pub(crate) fn issue_readahead(file: &CachedFile, start: PageIndex, count: usize) {
    let space = file.space();
    let last = file.nr_pages();
    let end = (start.0 + count as u64).min(last);
    let mut started = 0_usize;
    for i in start.0..end {
        let index = PageIndex(i);
        if space.lookup(index).is_some() {
            continue;
        }
        let (page, created) = space.find_or_create(index);
        if created {
            read_full_page(file, &page, ReadKind::Ahead);
            started += 1;
        }
    }
    if started > 0 {
        trace!(start = start.0, started, "readahead issued");
    }
}

/// Get the page at `index` with its contents valid, sleeping on I/O.
pub(crate) fn obtain_uptodate_page(file: &CachedFile, index: PageIndex) -> Result<Arc<CachedPage>> {
    let space = file.space();
    let ctx = space.context();
    let (page, created) = space.find_or_create(index);
    if created {
        read_full_page(file, &page, ReadKind::Demand);
    }
    if page.is_uptodate() {
        return Ok(page);
    }
    // A read may still be in flight behind a plug; release it, then sleep.
    file.disk().queue().unplug();
    ctx.wait_on_page_locked(&page);
    if page.is_uptodate() {
        return Ok(page);
    }
    // Not uptodate and unlocked: an earlier read failed (or was dropped as
    // fail-fast readahead). Take the lock and read again, once.
    ctx.lock_page(&page);
    if page.is_uptodate() {
        ctx.unlock_page(&page);
        return Ok(page);
    }
    page.test_clear_error();
    read_full_page(file, &page, ReadKind::Demand);
    file.disk().queue().unplug();
    ctx.wait_on_page_locked(&page);
    if page.is_uptodate() {
        Ok(page)
    } else {
        Err(QuireError::DeviceIo {
            sector: file
                .block_size()
                .first_sector_of_block(file.block_size().first_block_of_page(index))
                .map_or(0, |s| s.0),
            detail: "page read failed".to_string(),
        })
    }
}

/// Copy up to `buf.len()` bytes at `offset` out of the cache.
pub(crate) fn buffered_read(handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let file = handle.file();
    let size = file.size();
    if offset >= size || buf.is_empty() {
        return Ok(0);
    }
    let end = size.min(offset + buf.len() as u64);
    let mut copied = 0_usize;
    while offset + (copied as u64) < end {
        let pos = offset + copied as u64;
        let index = PageIndex::containing(ByteOffset(pos));
        sequential_readahead(handle, index);
        let page = obtain_uptodate_page(file, index)?;

        let page_off = ByteOffset(pos).page_offset();
        let n = (PAGE_SIZE - page_off).min((end - pos) as usize);
        buf[copied..copied + n].copy_from_slice(&page.data()[page_off..page_off + n]);
        copied += n;
    }
    Ok(copied)
}

/// Populate the cache for a byte range without copying anything out.
pub(crate) fn readahead(handle: &FileHandle, offset: u64, len: u64) {
    if len == 0 {
        return;
    }
    let file = handle.file();
    let first = PageIndex::containing(ByteOffset(offset));
    let pages = PageIndex::spanning(offset + len) - first.0;
    issue_readahead(file, first, pages as usize);
    // Kick the device; the caller is prefetching for a near future, not a
    // far one.
    file.disk().queue().unplug();
}
