//! The cached page and its per-block buffer state.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use quire_types::{BlockNumber, PageIndex, PAGE_SIZE};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// Page flag bits.
const PG_LOCKED: u32 = 1 << 0;
const PG_UPTODATE: u32 = 1 << 1;
const PG_DIRTY: u32 = 1 << 2;
const PG_WRITEBACK: u32 = 1 << 3;
const PG_ERROR: u32 = 1 << 4;

/// One page-sized unit of cached file data.
///
/// Flags are a single atomic word so state tests never need the data lock.
/// The lock bit only marks the page locked; sleeping on it goes through the
/// cache context's wait table. Data is guarded separately so readers can
/// copy out while another thread probes flags.
pub struct CachedPage {
    index: PageIndex,
    flags: AtomicU32,
    data: RwLock<Vec<u8>>,
    buffers: Mutex<Option<Vec<Arc<BufferHead>>>>,
}

impl CachedPage {
    /// A fresh page is born locked: the creator owns it until first unlock.
    #[must_use]
    pub fn new_locked(index: PageIndex) -> Arc<Self> {
        Arc::new(Self {
            index,
            flags: AtomicU32::new(PG_LOCKED),
            data: RwLock::new(vec![0_u8; PAGE_SIZE]),
            buffers: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn index(&self) -> PageIndex {
        self.index
    }

    #[must_use]
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    #[must_use]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// The page's buffer ring, if one has been attached.
    #[must_use]
    pub fn buffers(&self) -> MutexGuard<'_, Option<Vec<Arc<BufferHead>>>> {
        self.buffers.lock()
    }

    fn test(&self, mask: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & mask != 0
    }

    fn set(&self, mask: u32) -> bool {
        self.flags.fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    fn clear(&self, mask: u32) -> bool {
        self.flags.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.test(PG_LOCKED)
    }

    /// Take the lock bit if free. Sleeping acquisition lives on
    /// `CacheContext`.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        !self.set(PG_LOCKED)
    }

    /// Drop the lock bit. Returns whether it was held. Callers must wake
    /// sleepers through the wait table; prefer `CacheContext::unlock_page`.
    pub fn clear_locked(&self) -> bool {
        self.clear(PG_LOCKED)
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.test(PG_UPTODATE)
    }

    pub fn set_uptodate(&self) {
        self.set(PG_UPTODATE);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.test(PG_DIRTY)
    }

    /// Set the dirty bit; returns whether it was already set.
    pub fn test_set_dirty(&self) -> bool {
        self.set(PG_DIRTY)
    }

    /// Clear the dirty bit; returns whether it was set.
    pub fn test_clear_dirty(&self) -> bool {
        self.clear(PG_DIRTY)
    }

    #[must_use]
    pub fn is_writeback(&self) -> bool {
        self.test(PG_WRITEBACK)
    }

    pub fn set_writeback(&self) {
        self.set(PG_WRITEBACK);
    }

    /// Clear the writeback bit without waking waiters; prefer
    /// `AddressSpace::end_writeback`.
    pub fn clear_writeback(&self) -> bool {
        self.clear(PG_WRITEBACK)
    }

    pub fn set_error(&self) {
        self.set(PG_ERROR);
    }

    /// Clear the error bit; returns whether it was set.
    pub fn test_clear_error(&self) -> bool {
        self.clear(PG_ERROR)
    }
}

impl std::fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.flags.load(Ordering::SeqCst);
        f.debug_struct("CachedPage")
            .field("index", &self.index.0)
            .field("locked", &(flags & PG_LOCKED != 0))
            .field("uptodate", &(flags & PG_UPTODATE != 0))
            .field("dirty", &(flags & PG_DIRTY != 0))
            .field("writeback", &(flags & PG_WRITEBACK != 0))
            .field("error", &(flags & PG_ERROR != 0))
            .finish()
    }
}

// Buffer flag bits.
const BH_UPTODATE: u32 = 1 << 0;
const BH_DIRTY: u32 = 1 << 1;
const BH_LOCKED: u32 = 1 << 2;
const BH_MAPPED: u32 = 1 << 3;
const BH_NEW: u32 = 1 << 4;
const BH_ASYNC_READ: u32 = 1 << 5;
const BH_ASYNC_WRITE: u32 = 1 << 6;
const BH_WRITE_ERR: u32 = 1 << 7;

/// Per-block state within a page.
///
/// A buffer head carries no data of its own; it describes one block-sized
/// window of its page (`offset..offset + size`) plus the device block it
/// maps to. The mapped block number is only meaningful while `is_mapped`.
pub struct BufferHead {
    offset: usize,
    size: usize,
    block: AtomicU64,
    flags: AtomicU32,
}

impl BufferHead {
    #[must_use]
    pub fn new(offset: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            offset,
            size,
            block: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    fn test(&self, mask: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & mask != 0
    }

    fn set(&self, mask: u32) -> bool {
        self.flags.fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    fn clear(&self, mask: u32) -> bool {
        self.flags.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.test(BH_MAPPED)
    }

    /// Record the device block this buffer maps to.
    pub fn set_mapped(&self, block: BlockNumber) {
        self.block.store(block.0, Ordering::SeqCst);
        self.set(BH_MAPPED);
    }

    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        if self.is_mapped() {
            Some(BlockNumber(self.block.load(Ordering::SeqCst)))
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.test(BH_UPTODATE)
    }

    pub fn set_uptodate(&self) {
        self.set(BH_UPTODATE);
    }

    pub fn clear_uptodate(&self) {
        self.clear(BH_UPTODATE);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.test(BH_DIRTY)
    }

    pub fn mark_dirty(&self) {
        self.set(BH_DIRTY);
    }

    /// Clear the dirty bit; returns whether it was set.
    pub fn test_clear_dirty(&self) -> bool {
        self.clear(BH_DIRTY)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.test(BH_LOCKED)
    }

    /// Take the buffer lock if free.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        !self.set(BH_LOCKED)
    }

    pub fn clear_locked(&self) {
        self.clear(BH_LOCKED);
    }

    /// Freshly allocated on disk by a mapping call: contents are garbage
    /// until someone zeroes or fills them.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.test(BH_NEW)
    }

    pub fn set_new(&self) {
        self.set(BH_NEW);
    }

    pub fn clear_new(&self) -> bool {
        self.clear(BH_NEW)
    }

    #[must_use]
    pub fn is_async_read(&self) -> bool {
        self.test(BH_ASYNC_READ)
    }

    pub fn set_async_read(&self) {
        self.set(BH_ASYNC_READ);
    }

    pub fn clear_async_read(&self) {
        self.clear(BH_ASYNC_READ);
    }

    #[must_use]
    pub fn is_async_write(&self) -> bool {
        self.test(BH_ASYNC_WRITE)
    }

    pub fn set_async_write(&self) {
        self.set(BH_ASYNC_WRITE);
    }

    pub fn clear_async_write(&self) {
        self.clear(BH_ASYNC_WRITE);
    }

    #[must_use]
    pub fn has_write_error(&self) -> bool {
        self.test(BH_WRITE_ERR)
    }

    pub fn set_write_error(&self) {
        self.set(BH_WRITE_ERR);
    }
}

impl std::fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHead")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("block", &self.block())
            .field("uptodate", &self.is_uptodate())
            .field("dirty", &self.is_dirty())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_locked_and_empty() {
        let page = CachedPage::new_locked(PageIndex(7));
        assert!(page.is_locked());
        assert!(!page.is_uptodate());
        assert!(!page.is_dirty());
        assert_eq!(page.data().len(), PAGE_SIZE);
        assert!(page.buffers().is_none());
    }

    #[test]
    fn try_lock_is_exclusive() {
        let page = CachedPage::new_locked(PageIndex(0));
        assert!(!page.try_lock());
        assert!(page.clear_locked());
        assert!(page.try_lock());
        assert!(!page.try_lock());
    }

    #[test]
    fn dirty_transitions_report_prior_state() {
        let page = CachedPage::new_locked(PageIndex(0));
        assert!(!page.test_set_dirty());
        assert!(page.test_set_dirty());
        assert!(page.test_clear_dirty());
        assert!(!page.test_clear_dirty());
    }

    #[test]
    fn buffer_block_is_gated_on_mapped() {
        let bh = BufferHead::new(0, 1024);
        assert_eq!(bh.block(), None);
        bh.set_mapped(BlockNumber(42));
        assert_eq!(bh.block(), Some(BlockNumber(42)));
    }
}
