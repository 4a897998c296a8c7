//! The sync front end: fsync, fdatasync, ranged sync, and sync-everything.

use crate::mapping::CachedFile;
use crate::writeback::{flush, flush_range, wait_all, wait_span, FlushMode};
use quire_error::Result;
use quire_types::{ByteOffset, PageIndex};
use std::sync::Arc;
use tracing::debug;

/// Flush everything, wait for it, and force the device's volatile cache.
///
/// A flush failure does not skip the wait: whatever I/O did start must
/// still settle before the error is reported, or the caller could touch
/// pages with writes still in flight.
pub(crate) fn fsync(file: &CachedFile) -> Result<()> {
    debug!(size = file.size(), dirty = file.space().nr_dirty(), "fsync");
    let flushed = flush(file, FlushMode::SyncAll, usize::MAX);
    let waited = wait_all(file);
    flushed?;
    waited?;
    file.disk().queue().flush_device()
}

/// Like fsync without the device cache flush: data reaches the device, but
/// its volatile cache is the device's problem.
pub(crate) fn fdatasync(file: &CachedFile) -> Result<()> {
    let flushed = flush(file, FlushMode::SyncAll, usize::MAX);
    let waited = wait_all(file);
    flushed?;
    waited
}

/// Synchronize the pages covering `offset..offset + len`, the msync
/// shape: dirty pages in the range are written and waited for, pages
/// outside it are left alone.
pub(crate) fn sync_range(file: &CachedFile, offset: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let start = PageIndex::containing(ByteOffset(offset));
    let end = PageIndex(PageIndex::spanning(offset.saturating_add(len)));
    let flushed = flush_range(file, start, end);
    let waited = wait_span(file, Some((start, end)));
    flushed?;
    waited
}

/// Sync several files, visiting every one even after a failure; the first
/// error wins.
pub fn sync_all(files: &[Arc<CachedFile>]) -> Result<()> {
    let mut first_err = None;
    for file in files {
        if let Err(err) = file.fsync() {
            debug!(%err, "sync_all: file failed");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
