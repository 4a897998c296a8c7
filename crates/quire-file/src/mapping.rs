//! The cached file: an address space bound to a disk through a block
//! mapper.

use crate::fault::AccessHint;
use crate::read::{ReadaheadConfig, ReadaheadState};
use crate::writeback::FlushMode;
use parking_lot::Mutex;
use quire_block::GenDisk;
use quire_cache::{AddressSpace, CacheContext, CachedPage};
use quire_error::{QuireError, Result};
use quire_types::{BlockNumber, BlockSize, ByteOffset, PageIndex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A file-logical block resolved to a device block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    pub block: BlockNumber,
    /// Freshly allocated by this call: on-device contents are garbage and
    /// must be zeroed or overwritten before they become visible.
    pub new: bool,
}

/// Resolves file-logical blocks to device blocks.
///
/// This is the seam a filesystem plugs into. `Ok(None)` from a non-creating
/// call means a hole; a creating call either allocates or fails with
/// [`QuireError::NoSpace`].
pub trait BlockMapper: Send + Sync {
    fn map_block(&self, file_block: BlockNumber, create: bool) -> Result<Option<MappedBlock>>;
}

/// The trivial mapper: file block `n` lives at device block `base + n`.
///
/// Allocation is a high-water mark, so it also models "new" blocks: the
/// first creating map of a block past the mark reports it fresh. Mainly for
/// tests and the demo CLI, but any flat image works with it.
pub struct LinearMapper {
    base: u64,
    nr_blocks: u64,
    allocated: Mutex<u64>,
}

impl LinearMapper {
    #[must_use]
    pub fn new(base: BlockNumber, nr_blocks: u64) -> Arc<Self> {
        Arc::new(Self {
            base: base.0,
            nr_blocks,
            allocated: Mutex::new(0),
        })
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }
}

impl BlockMapper for LinearMapper {
    fn map_block(&self, file_block: BlockNumber, create: bool) -> Result<Option<MappedBlock>> {
        if file_block.0 >= self.nr_blocks {
            if create {
                return Err(QuireError::NoSpace);
            }
            return Ok(None);
        }
        let mut allocated = self.allocated.lock();
        if file_block.0 < *allocated {
            return Ok(Some(MappedBlock {
                block: BlockNumber(self.base + file_block.0),
                new: false,
            }));
        }
        if !create {
            return Ok(None);
        }
        // Everything up to the new mark counts as allocated; intermediate
        // blocks read back as holes until they are mapped with create.
        *allocated = file_block.0 + 1;
        Ok(Some(MappedBlock {
            block: BlockNumber(self.base + file_block.0),
            new: true,
        }))
    }
}

/// One file's view of the cache: pages, geometry, disk, and mapper.
pub struct CachedFile {
    space: Arc<AddressSpace>,
    disk: Arc<GenDisk>,
    mapper: Arc<dyn BlockMapper>,
    block_size: BlockSize,
    size: AtomicU64,
    ra_config: ReadaheadConfig,
}

impl CachedFile {
    #[must_use]
    pub fn new(
        disk: Arc<GenDisk>,
        mapper: Arc<dyn BlockMapper>,
        block_size: BlockSize,
        ctx: Arc<CacheContext>,
        ra_config: ReadaheadConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            space: AddressSpace::new(ctx),
            disk,
            mapper,
            block_size,
            size: AtomicU64::new(0),
            ra_config,
        })
    }

    #[must_use]
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    #[must_use]
    pub fn disk(&self) -> &Arc<GenDisk> {
        &self.disk
    }

    #[must_use]
    pub fn mapper(&self) -> &Arc<dyn BlockMapper> {
        &self.mapper
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn ra_config(&self) -> &ReadaheadConfig {
        &self.ra_config
    }

    /// Current file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Extend the recorded size to at least `end`. Writes call this as
    /// they land; concurrent extenders race safely to the larger value.
    pub fn grow_size_to(&self, end: u64) {
        self.size.fetch_max(end, Ordering::SeqCst);
    }

    /// Number of pages the current size spans.
    #[must_use]
    pub fn nr_pages(&self) -> u64 {
        PageIndex::spanning(self.size())
    }

    /// First file-logical block past the data, by the current size.
    #[must_use]
    pub fn blocks_in_file(&self) -> u64 {
        let bs = u64::from(self.block_size.get());
        self.size().div_ceil(bs)
    }

    /// Open a handle carrying per-reader readahead state.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> FileHandle {
        FileHandle {
            file: Arc::clone(self),
            ra: Mutex::new(ReadaheadState::new(&self.ra_config)),
        }
    }

    /// Shrink the file: drop the size, discard cached pages past the new
    /// end, and zero the cached tail of the boundary page so stale bytes
    /// cannot resurface through a later extension.
    pub fn truncate(&self, new_size: u64) {
        let old = self.size.swap(new_size, Ordering::SeqCst);
        if new_size >= old {
            return;
        }
        debug!(old, new_size, "truncate");
        let first_dead = PageIndex::spanning(new_size);
        self.space.truncate_from(PageIndex(first_dead));
        let tail = ByteOffset(new_size).page_offset();
        if tail != 0 {
            let boundary = PageIndex::containing(ByteOffset(new_size));
            if let Some(page) = self.space.lock_page_validated(boundary) {
                page.data_mut()[tail..].fill(0);
                self.space.context().unlock_page(&page);
            }
        }
    }

    /// Write `data` at `offset`, extending the file as needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        crate::write::buffered_write(self, offset, data)
    }

    /// Mark a whole page dirty, propagating to any attached buffers. The
    /// write-fault path uses this after the fault handler returns a page
    /// the caller will scribble on.
    pub fn dirty_page(&self, page: &Arc<CachedPage>) {
        if let Some(buffers) = page.buffers().as_ref() {
            for bh in buffers {
                if bh.is_uptodate() {
                    bh.mark_dirty();
                }
            }
        }
        self.space.mark_dirty(page);
    }

    /// Push dirty pages at the device. See [`FlushMode`] for the two
    /// disciplines.
    pub fn flush(&self, mode: FlushMode, max_pages: usize) -> Result<usize> {
        crate::writeback::flush(self, mode, max_pages)
    }

    /// Wait for every page currently under writeback, then surface any
    /// latched writeback error.
    pub fn wait_writeback(&self) -> Result<()> {
        crate::writeback::wait_all(self)
    }

    /// Flush everything, wait, and flush the device's volatile cache.
    pub fn fsync(&self) -> Result<()> {
        crate::sync::fsync(self)
    }

    /// Flush everything and wait, without forcing the device cache.
    pub fn fdatasync(&self) -> Result<()> {
        crate::sync::fdatasync(self)
    }

    /// Flush and wait for the pages covering `offset..offset + len` only.
    pub fn sync_range(&self, offset: u64, len: u64) -> Result<()> {
        crate::sync::sync_range(self, offset, len)
    }
}

/// A reader's cursor state over a [`CachedFile`].
///
/// Handles are cheap; each carries its own readahead window so independent
/// streams over one file do not fight each other's heuristics.
pub struct FileHandle {
    file: Arc<CachedFile>,
    ra: Mutex<ReadaheadState>,
}

impl FileHandle {
    #[must_use]
    pub fn file(&self) -> &Arc<CachedFile> {
        &self.file
    }

    pub(crate) fn ra(&self) -> &Mutex<ReadaheadState> {
        &self.ra
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the bytes copied;
    /// zero means at or past end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        crate::read::buffered_read(self, offset, buf)
    }

    /// Populate the cache for `offset..offset + len` without copying out.
    pub fn readahead(&self, offset: u64, len: u64) {
        crate::read::readahead(self, offset, len);
    }

    /// Resolve a page for a memory fault at `index`.
    ///
    /// `foreign` marks an access on behalf of another context (a core dump
    /// walking mappings, say): past-EOF faults then report `Ok(None)`
    /// instead of [`QuireError::BusFault`].
    pub fn fault(
        &self,
        index: PageIndex,
        hint: AccessHint,
        foreign: bool,
    ) -> Result<Option<Arc<CachedPage>>> {
        crate::fault::fault(self, index, hint, foreign)
    }

    /// Write through this handle; identical to [`CachedFile::write`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.file.write(offset, data)
    }
}
