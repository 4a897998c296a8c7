//! Buffered writes: prepare, fill, commit.

use crate::buffer::{attach_buffers, start_prepare_read, zero_buffer};
use crate::mapping::CachedFile;
use quire_cache::{BufferHead, CachedPage};
use quire_error::{QuireError, Result};
use quire_types::{BlockNumber, ByteOffset, PageIndex, PAGE_SIZE};
use std::sync::Arc;
use tracing::trace;

/// An open two-phase write against one locked page.
///
/// `prepare_write` maps the affected blocks, zeroes the exposed parts of
/// freshly allocated ones, and reads in partially overwritten ones.
/// Between that and [`WriteTransaction::commit`] the caller copies its
/// bytes in with [`WriteTransaction::fill`]; commit marks buffers uptodate
/// and dirty and files the page. The caller holds the page lock across the
/// whole sequence and releases it after commit.
pub struct WriteTransaction<'a> {
    file: &'a CachedFile,
    page: Arc<CachedPage>,
    from: usize,
    to: usize,
}

impl CachedFile {
    /// Open a write of bytes `from..to` within `page`. The page must be
    /// locked by the caller.
    pub fn prepare_write(
        &self,
        page: &Arc<CachedPage>,
        from: usize,
        to: usize,
    ) -> Result<WriteTransaction<'_>> {
        prepare_write(self, page, from, to)
    }
}

fn overlaps(bh: &BufferHead, from: usize, to: usize) -> bool {
    bh.offset() < to && bh.offset() + bh.size() > from
}

fn prepare_write<'a>(
    file: &'a CachedFile,
    page: &Arc<CachedPage>,
    from: usize,
    to: usize,
) -> Result<WriteTransaction<'a>> {
    if from > to || to > PAGE_SIZE {
        return Err(QuireError::BadRequest(format!(
            "write range {from}..{to} outside the page"
        )));
    }
    let ctx = file.space().context();
    let bs = file.block_size();
    let buffers = attach_buffers(page, bs);
    let first_block = bs.first_block_of_page(page.index());

    let mut pending_reads: Vec<Arc<BufferHead>> = Vec::new();
    let mut map_err: Option<QuireError> = None;

    for (i, bh) in buffers.iter().enumerate() {
        if !overlaps(bh, from, to) {
            continue;
        }
        if !bh.is_mapped() {
            let file_block = BlockNumber(first_block.0 + i as u64);
            match file.mapper().map_block(file_block, true) {
                Ok(Some(mapped)) => {
                    if mapped.new {
                        bh.set_new();
                    }
                    bh.set_mapped(mapped.block);
                }
                Ok(None) => {
                    map_err = Some(QuireError::Corruption(format!(
                        "creating map of block {} returned a hole",
                        file_block.0
                    )));
                    break;
                }
                Err(err) => {
                    map_err = Some(err);
                    break;
                }
            }
        }
        let bstart = bh.offset();
        let bend = bstart + bh.size();
        if bh.is_new() {
            // A fresh block's device contents are garbage. The write fills
            // [from, to); zero whatever of this buffer it will not cover.
            if bstart < from {
                page.data_mut()[bstart..from.min(bend)].fill(0);
            }
            if bend > to {
                page.data_mut()[to.max(bstart)..bend].fill(0);
            }
            continue;
        }
        if !bh.is_uptodate() && !(from <= bstart && bend <= to) {
            // Partially overwritten and not cached: the untouched bytes
            // must come from disk before the write lands on top.
            start_prepare_read(file, page, bh);
            pending_reads.push(Arc::clone(bh));
        }
    }

    if let Some(err) = map_err {
        // Do not expose garbage from half-prepared new blocks.
        for bh in &buffers {
            if overlaps(bh, from, to) && bh.clear_new() {
                zero_buffer(page, bh);
                bh.set_uptodate();
            }
        }
        return Err(err);
    }

    if !pending_reads.is_empty() {
        // The reads may sit behind a plug; push them at the driver before
        // sleeping.
        file.disk().queue().unplug();
        for bh in &pending_reads {
            ctx.wait_on_buffer(page, bh);
        }
        for bh in &pending_reads {
            if !bh.is_uptodate() {
                return Err(QuireError::DeviceIo {
                    sector: bh.block().map_or(0, |b| {
                        bs.first_sector_of_block(b).map_or(0, |s| s.0)
                    }),
                    detail: "read before partial overwrite failed".to_string(),
                });
            }
        }
    }

    trace!(index = page.index().0, from, to, "write prepared");
    Ok(WriteTransaction {
        file,
        page: Arc::clone(page),
        from,
        to,
    })
}

impl WriteTransaction<'_> {
    #[must_use]
    pub fn page(&self) -> &Arc<CachedPage> {
        &self.page
    }

    /// Copy the caller's bytes into the prepared range, starting at its
    /// first byte.
    pub fn fill(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.to - self.from {
            return Err(QuireError::BadRequest(format!(
                "{} bytes into a {} byte prepared range",
                data.len(),
                self.to - self.from
            )));
        }
        self.page.data_mut()[self.from..self.from + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Settle the write: the affected buffers become uptodate and dirty,
    /// the page is filed dirty, and a fully covered page goes uptodate.
    pub fn commit(self) {
        let buffers = attach_buffers(&self.page, self.file.block_size());
        for bh in &buffers {
            if overlaps(bh, self.from, self.to) {
                bh.clear_new();
                bh.set_uptodate();
                bh.mark_dirty();
            }
        }
        if buffers.iter().all(|bh| bh.is_uptodate()) {
            self.page.set_uptodate();
        }
        self.file.space().mark_dirty(&self.page);
    }
}

/// Lock (creating if needed) the page at `index` for writing.
fn lock_page_for_write(file: &CachedFile, index: PageIndex) -> Arc<CachedPage> {
    let space = file.space();
    let ctx = space.context();
    loop {
        let (page, created) = space.find_or_create(index);
        if created {
            return page;
        }
        ctx.lock_page(&page);
        match space.lookup(index) {
            Some(ref current) if Arc::ptr_eq(current, &page) => return page,
            _ => ctx.unlock_page(&page),
        }
    }
}

/// Write `data` at byte `offset`, page by page.
///
/// Returns the bytes written. A failure after some pages landed reports
/// the short count; a failure on the first page reports the error.
pub(crate) fn buffered_write(file: &CachedFile, offset: u64, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let ctx = file.space().context();
    let mut written = 0_usize;
    while written < data.len() {
        let pos = offset + written as u64;
        let index = PageIndex::containing(ByteOffset(pos));
        let from = ByteOffset(pos).page_offset();
        let take = (PAGE_SIZE - from).min(data.len() - written);

        let page = lock_page_for_write(file, index);
        let result = file
            .prepare_write(&page, from, from + take)
            .and_then(|txn| {
                txn.fill(&data[written..written + take])?;
                txn.commit();
                Ok(())
            });
        ctx.unlock_page(&page);
        match result {
            Ok(()) => {
                file.grow_size_to(pos + take as u64);
                written += take;
            }
            Err(err) if written == 0 => return Err(err),
            Err(err) => {
                trace!(%err, written, "short write");
                break;
            }
        }
    }
    Ok(written)
}
