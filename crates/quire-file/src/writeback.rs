//! The writeback engine: pushing dirty pages at the device.

use crate::buffer::write_full_page;
use crate::mapping::CachedFile;
use quire_block::IoDir;
use quire_cache::CachedPage;
use quire_error::{QuireError, Result};
use quire_types::PageIndex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How hard a flush pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Opportunistic: skip pages whose lock is contended (they go back on
    /// the dirty list), and back off while the write side is congested.
    Background,
    /// Integrity: take every lock, write every dirty page in scope.
    SyncAll,
}

const CONGESTION_BACKOFF: Duration = Duration::from_millis(30);

fn flush_pages(file: &CachedFile, pages: Vec<Arc<CachedPage>>, mode: FlushMode) -> Result<usize> {
    let space = file.space();
    let ctx = space.context();
    let mut submitted = 0_usize;
    let mut first_err: Option<QuireError> = None;
    for page in pages {
        let locked = match mode {
            FlushMode::Background => page.try_lock(),
            FlushMode::SyncAll => {
                ctx.lock_page(&page);
                true
            }
        };
        if !locked {
            // Someone is working the page; it keeps its dirt and comes
            // back on the next pass.
            space.refile(&page);
            continue;
        }
        if !page.is_dirty() {
            ctx.unlock_page(&page);
            space.refile(&page);
            continue;
        }
        if page.is_writeback() {
            // Already in flight from an earlier pass; SyncAll waits so the
            // new write orders behind the old one, Background skips.
            if mode == FlushMode::Background {
                ctx.unlock_page(&page);
                space.refile(&page);
                continue;
            }
            ctx.wait_on_page_writeback(&page);
        }
        match write_full_page(file, &page) {
            Ok(()) => submitted += 1,
            Err(err) => {
                debug!(index = page.index().0, %err, "writeback failed to map");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    file.disk().queue().unplug();
    match first_err {
        Some(err) => Err(err),
        None => Ok(submitted),
    }
}

/// Write back up to `max_pages` dirty pages of `file`.
///
/// Returns the number of pages whose writes were started. Mapping failures
/// are latched on the space as well as returned, so a sync that follows
/// still observes them.
pub(crate) fn flush(file: &CachedFile, mode: FlushMode, max_pages: usize) -> Result<usize> {
    if mode == FlushMode::Background {
        let ctx = file.disk().queue().context();
        // Background writers yield while the device is drowning; integrity
        // writers push through regardless.
        let _ = ctx.wait_for_uncongested(IoDir::Write, CONGESTION_BACKOFF);
    }
    let batch = file.space().take_dirty_batch(max_pages);
    if batch.is_empty() {
        return Ok(0);
    }
    flush_pages(file, batch, mode)
}

/// Write back dirty pages covering `start..end` only. Always integrity
/// mode; ranged flushes come from sync callers.
pub(crate) fn flush_range(file: &CachedFile, start: PageIndex, end: PageIndex) -> Result<usize> {
    let batch = file.space().take_dirty_range(start, end, usize::MAX);
    if batch.is_empty() {
        return Ok(0);
    }
    flush_pages(file, batch, FlushMode::SyncAll)
}

/// Wait for every page currently under I/O, then surface any latched
/// writeback error. No-space beats I/O error when both are pending.
pub(crate) fn wait_all(file: &CachedFile) -> Result<()> {
    wait_span(file, None)
}

/// Range-limited wait; `None` spans the whole file.
pub(crate) fn wait_span(file: &CachedFile, span: Option<(PageIndex, PageIndex)>) -> Result<()> {
    let space = file.space();
    let ctx = space.context();
    // Whatever we are about to wait on may still sit behind a plug.
    file.disk().queue().unplug();
    for page in space.io_snapshot() {
        if let Some((start, end)) = span {
            if page.index() < start || page.index() >= end {
                continue;
            }
        }
        ctx.wait_on_page_writeback(&page);
    }
    space.drain_error()
}
