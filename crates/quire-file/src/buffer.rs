//! Block-sized I/O against pages: filling pages from disk and writing
//! dirty pages out, one buffer at a time.
//!
//! Completion is last-one-out: each buffer's `end_io` clears its own async
//! bit under the page's buffer set, then scans its siblings; the completion
//! that finds no other buffer still busy settles the page (read: mark
//! uptodate and unlock; write: end writeback).

use crate::mapping::CachedFile;
use quire_block::{IoDescriptor, IoDir, IoFlags, IoTarget};
use quire_cache::{AddressSpace, BufferHead, CachedPage};
use quire_error::{QuireError, Result};
use quire_types::{BlockNumber, BlockSize, PAGE_SIZE};
use std::sync::Arc;
use tracing::{debug, trace};

/// How a page read was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadKind {
    /// Someone is waiting on the data: sleep for request slots if needed.
    Demand,
    /// Speculative: submitted fail-fast, dropped instead of queued behind a
    /// full pool.
    Ahead,
}

/// Make sure `page` carries a buffer ring for `block_size`, returning it.
///
/// Attachment is lazy and sticky. Fresh buffers inherit the page's state:
/// uptodate pages yield uptodate buffers; if the page is dirty when the ring
/// is born, its uptodate buffers are born dirty too, otherwise the dirt
/// would be invisible to per-buffer writeback.
pub(crate) fn attach_buffers(page: &CachedPage, block_size: BlockSize) -> Vec<Arc<BufferHead>> {
    let mut guard = page.buffers();
    if guard.is_none() {
        let size = block_size.get() as usize;
        let page_uptodate = page.is_uptodate();
        let page_dirty = page.is_dirty();
        let mut ring = Vec::with_capacity(block_size.blocks_per_page());
        for i in 0..block_size.blocks_per_page() {
            let bh = BufferHead::new(i * size, size);
            if page_uptodate {
                bh.set_uptodate();
                if page_dirty {
                    bh.mark_dirty();
                }
            }
            ring.push(bh);
        }
        *guard = Some(ring);
    }
    match guard.as_ref() {
        Some(ring) => ring.clone(),
        None => Vec::new(),
    }
}

enum BufferIoKind {
    AsyncRead,
    AsyncWrite,
    /// Read issued by prepare-write; settles only the buffer, never the
    /// page.
    SyncRead,
}

/// The memory end of one buffer's I/O.
struct BufferIoTarget {
    page: Arc<CachedPage>,
    buffer: Arc<BufferHead>,
    space: Arc<AddressSpace>,
    kind: BufferIoKind,
}

impl IoTarget for BufferIoTarget {
    fn len(&self) -> usize {
        self.buffer.size()
    }

    fn copy_out(&self, dst: &mut [u8]) {
        let off = self.buffer.offset();
        dst.copy_from_slice(&self.page.data()[off..off + self.buffer.size()]);
    }

    fn copy_in(&self, src: &[u8]) {
        let off = self.buffer.offset();
        self.page.data_mut()[off..off + self.buffer.size()].copy_from_slice(src);
    }

    fn end_io(&self, result: Result<()>) {
        let ctx = self.space.context();
        match self.kind {
            BufferIoKind::AsyncRead => {
                match result {
                    Ok(()) => self.buffer.set_uptodate(),
                    Err(err) => {
                        trace!(offset = self.buffer.offset(), %err, "buffer read failed");
                        self.buffer.clear_uptodate();
                        self.page.set_error();
                    }
                }
                let mut all_uptodate = true;
                let mut still_busy = false;
                {
                    let ring = self.page.buffers();
                    self.buffer.clear_async_read();
                    ctx.unlock_buffer(&self.page, &self.buffer);
                    if let Some(buffers) = ring.as_ref() {
                        for bh in buffers {
                            if bh.is_async_read() && bh.is_locked() {
                                still_busy = true;
                            }
                            if !bh.is_uptodate() {
                                all_uptodate = false;
                            }
                        }
                    }
                }
                if still_busy {
                    return;
                }
                if all_uptodate {
                    self.page.set_uptodate();
                }
                ctx.unlock_page(&self.page);
            }
            BufferIoKind::SyncRead => {
                match result {
                    Ok(()) => self.buffer.set_uptodate(),
                    Err(err) => {
                        trace!(offset = self.buffer.offset(), %err, "prepare read failed");
                        self.page.set_error();
                    }
                }
                ctx.unlock_buffer(&self.page, &self.buffer);
            }
            BufferIoKind::AsyncWrite => {
                if let Err(err) = &result {
                    debug!(offset = self.buffer.offset(), %err, "buffer write failed");
                    self.buffer.set_write_error();
                    self.page.set_error();
                    self.space.record_error(err);
                }
                let mut still_busy = false;
                {
                    let ring = self.page.buffers();
                    self.buffer.clear_async_write();
                    ctx.unlock_buffer(&self.page, &self.buffer);
                    if let Some(buffers) = ring.as_ref() {
                        for bh in buffers {
                            if bh.is_async_write() && bh.is_locked() {
                                still_busy = true;
                            }
                        }
                    }
                }
                if still_busy {
                    return;
                }
                self.space.end_writeback(&self.page);
            }
        }
    }
}

fn submit_buffer(
    file: &CachedFile,
    page: &Arc<CachedPage>,
    buffer: &Arc<BufferHead>,
    dir: IoDir,
    fail_fast: bool,
    kind: BufferIoKind,
) {
    let bs = file.block_size();
    let target = Arc::new(BufferIoTarget {
        page: Arc::clone(page),
        buffer: Arc::clone(buffer),
        space: Arc::clone(file.space()),
        kind,
    });
    let Some(block) = buffer.block() else {
        target.end_io(Err(QuireError::Corruption(
            "submitting an unmapped buffer".to_string(),
        )));
        return;
    };
    let Some(sector) = bs.first_sector_of_block(block) else {
        target.end_io(Err(QuireError::BadRequest(format!(
            "block {} overflows the sector space",
            block.0
        ))));
        return;
    };
    file.disk().submit(IoDescriptor {
        dir,
        sector,
        nr_sectors: bs.sectors_per_block() as u32,
        flags: IoFlags {
            barrier: false,
            fail_fast,
        },
        target,
    });
}

/// Issue a read into a page weak spot by weak spot.
///
/// Called with the page locked and not uptodate; ownership of the lock
/// passes to the last completing buffer (or back through the direct unlock
/// when nothing needs the device). Holes and blocks past end of file are
/// zero-filled in place. A mapping failure marks the page errored and
/// leaves the affected buffers not uptodate; the demand-read path turns
/// that into an I/O error, readahead just drops it.
pub(crate) fn read_full_page(file: &CachedFile, page: &Arc<CachedPage>, kind: ReadKind) {
    let ctx = file.space().context();
    let bs = file.block_size();
    let buffers = attach_buffers(page, bs);
    let first_block = bs.first_block_of_page(page.index());
    let blocks_in_file = file.blocks_in_file();

    let mut to_read = Vec::new();
    for (i, bh) in buffers.iter().enumerate() {
        if bh.is_uptodate() {
            continue;
        }
        if !bh.is_mapped() {
            let file_block = BlockNumber(first_block.0 + i as u64);
            if file_block.0 >= blocks_in_file {
                zero_buffer(page, bh);
                bh.set_uptodate();
                continue;
            }
            match file.mapper().map_block(file_block, false) {
                Ok(Some(mapped)) => bh.set_mapped(mapped.block),
                Ok(None) => {
                    // A hole reads as zeros.
                    zero_buffer(page, bh);
                    bh.set_uptodate();
                    continue;
                }
                Err(err) => {
                    debug!(block = file_block.0, %err, "map for read failed");
                    page.set_error();
                    zero_buffer(page, bh);
                    // Deliberately not uptodate: the error must surface.
                    continue;
                }
            }
        }
        to_read.push(Arc::clone(bh));
    }

    if to_read.is_empty() {
        if buffers.iter().all(|bh| bh.is_uptodate()) {
            page.set_uptodate();
        }
        ctx.unlock_page(page);
        return;
    }

    // Lock and flag every buffer before the first submission, so an early
    // completion cannot see a half-built set and settle the page early.
    for bh in &to_read {
        ctx.lock_buffer(page, bh);
        bh.set_async_read();
    }
    let fail_fast = kind == ReadKind::Ahead;
    for bh in &to_read {
        submit_buffer(file, page, bh, IoDir::Read, fail_fast, BufferIoKind::AsyncRead);
    }
}

/// Write a dirty page's buffers to disk.
///
/// Called with the page locked and filed under I/O. Clears the page dirty
/// bit, sets writeback, unlocks the page, and submits the dirty buffers;
/// the last completion ends writeback and re-files the page.
///
/// On a mapping failure the error is latched on the space and the page
/// marked errored, but buffers that did map are still written out;
/// flushing what can be flushed loses less than abandoning the page whole.
pub(crate) fn write_full_page(file: &CachedFile, page: &Arc<CachedPage>) -> Result<()> {
    let space = file.space();
    let ctx = space.context();
    let bs = file.block_size();
    let buffers = attach_buffers(page, bs);
    page.test_clear_dirty();

    let first_block = bs.first_block_of_page(page.index());
    let blocks_in_file = file.blocks_in_file();
    let size = file.size();

    // Zero the cached tail beyond end of file so a partial final block
    // writes zeros, not stale cache bytes.
    if let Some(page_start) = page.index().byte_offset() {
        if size > page_start.0 && size < page_start.0 + PAGE_SIZE as u64 {
            let tail = (size - page_start.0) as usize;
            page.data_mut()[tail..].fill(0);
        }
    }

    let mut map_err: Option<QuireError> = None;
    for (i, bh) in buffers.iter().enumerate() {
        let file_block = BlockNumber(first_block.0 + i as u64);
        if file_block.0 >= blocks_in_file {
            // Nothing past end of file goes to disk.
            bh.test_clear_dirty();
            continue;
        }
        if bh.is_mapped() || !bh.is_dirty() {
            continue;
        }
        match file.mapper().map_block(file_block, true) {
            Ok(Some(mapped)) => {
                if mapped.new {
                    bh.set_new();
                }
                bh.set_mapped(mapped.block);
            }
            Ok(None) => {
                bh.test_clear_dirty();
                if map_err.is_none() {
                    map_err = Some(QuireError::Corruption(format!(
                        "creating map of block {} returned a hole",
                        file_block.0
                    )));
                }
            }
            Err(err) => {
                debug!(block = file_block.0, %err, "map for write failed");
                bh.test_clear_dirty();
                if map_err.is_none() {
                    map_err = Some(err);
                }
            }
        }
    }
    if let Some(err) = &map_err {
        page.set_error();
        space.record_error(err);
    }

    let mut writers = Vec::new();
    for bh in &buffers {
        if bh.is_mapped() && bh.test_clear_dirty() {
            ctx.lock_buffer(page, bh);
            bh.set_async_write();
            // The cache copy is the truth being written down.
            bh.clear_new();
            bh.set_uptodate();
            writers.push(Arc::clone(bh));
        }
    }

    space.set_writeback(page);
    ctx.unlock_page(page);
    if writers.is_empty() {
        space.end_writeback(page);
    } else {
        for bh in &writers {
            submit_buffer(file, page, bh, IoDir::Write, false, BufferIoKind::AsyncWrite);
        }
    }
    match map_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) fn zero_buffer(page: &CachedPage, bh: &BufferHead) {
    let off = bh.offset();
    page.data_mut()[off..off + bh.size()].fill(0);
}

/// Read one buffer synchronously for prepare-write: lock, submit, and let
/// the caller wait on the buffer lock.
pub(crate) fn start_prepare_read(file: &CachedFile, page: &Arc<CachedPage>, bh: &Arc<BufferHead>) {
    let ctx = file.space().context();
    ctx.lock_buffer(page, bh);
    if bh.is_uptodate() {
        // Raced with another filler; nothing to read.
        ctx.unlock_buffer(page, bh);
        return;
    }
    submit_buffer(file, page, bh, IoDir::Read, false, BufferIoKind::SyncRead);
}
