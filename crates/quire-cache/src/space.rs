//! The address space: one file's slice of the page cache.

use crate::page::CachedPage;
use crate::wait::CacheContext;
use parking_lot::Mutex;
use quire_error::{QuireError, Result};
use quire_types::PageIndex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

type DirtyHook = Box<dyn Fn(PageIndex) + Send + Sync>;

/// Counters, readable as a snapshot via [`AddressSpace::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpaceStats {
    pub lookups: u64,
    pub hits: u64,
    pub pages_created: u64,
    pub pages_removed: u64,
}

struct SpaceInner {
    pages: BTreeMap<u64, Arc<CachedPage>>,
    // Every present index lives on exactly one of these lists.
    clean: BTreeSet<u64>,
    dirty: BTreeSet<u64>,
    io: BTreeSet<u64>,
}

impl SpaceInner {
    fn unfile(&mut self, index: u64) {
        self.clean.remove(&index);
        self.dirty.remove(&index);
        self.io.remove(&index);
    }
}

/// All cached pages of one file, indexed by page number, each filed on a
/// clean, dirty, or under-I/O list.
///
/// Error state is latched per space: a failed writeback records its error
/// here and the next sync-style call collects it, so an error is reported
/// exactly once even when the page that carried it is long gone.
pub struct AddressSpace {
    ctx: Arc<CacheContext>,
    inner: Mutex<SpaceInner>,
    io_error: AtomicBool,
    nospace_error: AtomicBool,
    dirty_hook: Mutex<Option<DirtyHook>>,
    lookups: AtomicU64,
    hits: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
}

impl AddressSpace {
    #[must_use]
    pub fn new(ctx: Arc<CacheContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: Mutex::new(SpaceInner {
                pages: BTreeMap::new(),
                clean: BTreeSet::new(),
                dirty: BTreeSet::new(),
                io: BTreeSet::new(),
            }),
            io_error: AtomicBool::new(false),
            nospace_error: AtomicBool::new(false),
            dirty_hook: Mutex::new(None),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<CacheContext> {
        &self.ctx
    }

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            pages_created: self.created.load(Ordering::Relaxed),
            pages_removed: self.removed.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn nr_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    #[must_use]
    pub fn nr_dirty(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    #[must_use]
    pub fn nr_io(&self) -> usize {
        self.inner.lock().io.len()
    }

    /// Notify `hook` whenever a page first goes dirty. Used by writeback
    /// front ends to account dirty growth.
    pub fn set_dirty_hook(&self, hook: DirtyHook) {
        *self.dirty_hook.lock() = Some(hook);
    }

    #[must_use]
    pub fn lookup(&self, index: PageIndex) -> Option<Arc<CachedPage>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.inner.lock().pages.get(&index.0).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Find the page at `index`, creating it if absent.
    ///
    /// Returns the page and whether this call created it. A created page
    /// comes back locked and not uptodate; the caller owns filling it and
    /// unlocking. A found page comes back unfiltered; the caller locks it
    /// if it needs stability.
    pub fn find_or_create(&self, index: PageIndex) -> (Arc<CachedPage>, bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get(&index.0) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (Arc::clone(page), false);
        }
        let page = CachedPage::new_locked(index);
        inner.pages.insert(index.0, Arc::clone(&page));
        inner.clean.insert(index.0);
        self.created.fetch_add(1, Ordering::Relaxed);
        trace!(index = index.0, "page created");
        (page, true)
    }

    /// Look up and lock the page at `index`, revalidating after the lock.
    ///
    /// Between the lookup and the lock the page can be truncated away (and
    /// its index even reused by a new page). After acquiring the lock the
    /// mapping is re-checked; a stale page is unlocked and the whole
    /// sequence retried.
    #[must_use]
    pub fn lock_page_validated(&self, index: PageIndex) -> Option<Arc<CachedPage>> {
        loop {
            let page = self.lookup(index)?;
            self.ctx.lock_page(&page);
            let current = self.inner.lock().pages.get(&index.0).cloned();
            match current {
                Some(ref now) if Arc::ptr_eq(now, &page) => return Some(page),
                _ => {
                    // Lost a race with truncation; drop the stale page.
                    self.ctx.unlock_page(&page);
                }
            }
        }
    }

    /// Mark a page dirty and file it on the dirty list.
    ///
    /// Returns whether this call made the transition. Idempotent: a page
    /// already dirty is left where it is. A page under writeback keeps its
    /// io filing; `end_writeback` re-files it by the dirty bit.
    pub fn mark_dirty(&self, page: &Arc<CachedPage>) -> bool {
        if page.test_set_dirty() {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            let index = page.index().0;
            if inner.pages.contains_key(&index) && !inner.io.contains(&index) {
                inner.clean.remove(&index);
                inner.dirty.insert(index);
            }
        }
        let hook = self.dirty_hook.lock();
        if let Some(hook) = hook.as_ref() {
            hook(page.index());
        }
        true
    }

    /// Move up to `max` dirty pages onto the io list and return them in
    /// index order. The dirty bits are left set; the writeback engine
    /// clears them per page as it locks each one.
    #[must_use]
    pub fn take_dirty_batch(&self, max: usize) -> Vec<Arc<CachedPage>> {
        let mut inner = self.inner.lock();
        let picked: Vec<u64> = inner.dirty.iter().take(max).copied().collect();
        let mut pages = Vec::with_capacity(picked.len());
        for index in picked {
            inner.dirty.remove(&index);
            inner.io.insert(index);
            if let Some(page) = inner.pages.get(&index) {
                pages.push(Arc::clone(page));
            }
        }
        pages
    }

    /// Move dirty pages with `start <= index < end` onto the io list, up to
    /// `max`, returned in index order. Range-limited companion of
    /// [`Self::take_dirty_batch`].
    #[must_use]
    pub fn take_dirty_range(&self, start: PageIndex, end: PageIndex, max: usize) -> Vec<Arc<CachedPage>> {
        let mut inner = self.inner.lock();
        let picked: Vec<u64> = inner
            .dirty
            .range(start.0..end.0)
            .take(max)
            .copied()
            .collect();
        let mut pages = Vec::with_capacity(picked.len());
        for index in picked {
            inner.dirty.remove(&index);
            inner.io.insert(index);
            if let Some(page) = inner.pages.get(&index) {
                pages.push(Arc::clone(page));
            }
        }
        pages
    }

    /// Re-file a page by its dirty bit without touching writeback state.
    /// Used when a flusher pulled a page onto the io list but then decided
    /// not to write it.
    pub fn refile(&self, page: &Arc<CachedPage>) {
        let mut inner = self.inner.lock();
        let index = page.index().0;
        if inner.pages.contains_key(&index) {
            inner.unfile(index);
            if page.is_dirty() {
                inner.dirty.insert(index);
            } else {
                inner.clean.insert(index);
            }
        }
    }

    /// Snapshot of pages currently filed under I/O, in index order.
    #[must_use]
    pub fn io_snapshot(&self) -> Vec<Arc<CachedPage>> {
        let inner = self.inner.lock();
        inner
            .io
            .iter()
            .filter_map(|i| inner.pages.get(i).cloned())
            .collect()
    }

    /// Set the writeback bit before the page's I/O is issued.
    pub fn set_writeback(&self, page: &CachedPage) {
        page.set_writeback();
    }

    /// Writeback finished: clear the bit, wake waiters, and re-file the
    /// page: back to dirty if it was redirtied mid-flight, else to clean.
    pub fn end_writeback(&self, page: &Arc<CachedPage>) {
        {
            let mut inner = self.inner.lock();
            let index = page.index().0;
            if inner.pages.contains_key(&index) {
                inner.unfile(index);
                if page.is_dirty() {
                    inner.dirty.insert(index);
                } else {
                    inner.clean.insert(index);
                }
            }
        }
        self.ctx.clear_page_writeback(page);
    }

    /// Drop a page from the space. The caller holds the page lock; a page
    /// still under writeback is left alone.
    ///
    /// Dirty data is discarded; this is the truncation path, not an
    /// eviction.
    pub fn remove(&self, page: &Arc<CachedPage>) -> bool {
        debug_assert!(page.is_locked());
        if page.is_writeback() {
            return false;
        }
        let mut inner = self.inner.lock();
        let index = page.index().0;
        match inner.pages.get(&index) {
            Some(current) if Arc::ptr_eq(current, page) => {
                inner.pages.remove(&index);
                inner.unfile(index);
                page.test_clear_dirty();
                self.removed.fetch_add(1, Ordering::Relaxed);
                trace!(index, "page removed");
                true
            }
            _ => false,
        }
    }

    /// Drop every page at `first` and beyond, discarding dirty data.
    ///
    /// Each page is locked and waited clear of writeback before removal,
    /// so in-flight I/O never loses its page out from under it.
    pub fn truncate_from(&self, first: PageIndex) {
        loop {
            let candidates: Vec<Arc<CachedPage>> = {
                let inner = self.inner.lock();
                inner
                    .pages
                    .range(first.0..)
                    .map(|(_, p)| Arc::clone(p))
                    .collect()
            };
            if candidates.is_empty() {
                return;
            }
            for page in candidates {
                self.ctx.lock_page(&page);
                self.ctx.wait_on_page_writeback(&page);
                self.remove(&page);
                self.ctx.unlock_page(&page);
            }
        }
    }

    /// Latch a writeback error for later collection.
    pub fn record_error(&self, err: &QuireError) {
        if err.is_no_space() {
            self.nospace_error.store(true, Ordering::SeqCst);
        } else {
            self.io_error.store(true, Ordering::SeqCst);
        }
    }

    /// Collect and clear any latched writeback error.
    ///
    /// No-space is reported in preference to a generic I/O error when both
    /// are pending; each latch clears independently, so the other still
    /// surfaces on the next call.
    pub fn drain_error(&self) -> Result<()> {
        if self.nospace_error.swap(false, Ordering::SeqCst) {
            return Err(QuireError::NoSpace);
        }
        if self.io_error.swap(false, Ordering::SeqCst) {
            return Err(QuireError::DeviceIo {
                sector: 0,
                detail: "async write error".to_string(),
            });
        }
        Ok(())
    }
}
