//! Sleeping on page and buffer state.
//!
//! Pages carry their lock and writeback state as atomic bits; sleeping on a
//! bit goes through a fixed table of wait slots hashed by page address.
//! Collisions just share a slot: waiters re-check their own predicate after
//! every wakeup, so a shared broadcast can only cost a spurious loop, never
//! a missed one.

use crate::page::{BufferHead, CachedPage};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

const WAIT_TABLE_SLOTS: usize = 256;

struct WaitSlot {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Shared wait state for one cache instance.
///
/// Built once and threaded through every address space; the slot a page
/// hashes to is stable for the page's lifetime.
pub struct CacheContext {
    slots: Vec<WaitSlot>,
}

impl CacheContext {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut slots = Vec::with_capacity(WAIT_TABLE_SLOTS);
        for _ in 0..WAIT_TABLE_SLOTS {
            slots.push(WaitSlot {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            });
        }
        Arc::new(Self { slots })
    }

    fn slot_for(&self, page: &CachedPage) -> &WaitSlot {
        let addr = std::ptr::from_ref(page) as usize;
        // Low bits are alignment zeros; fold some entropy back in.
        let hash = (addr >> 4) ^ (addr >> 12);
        &self.slots[hash % WAIT_TABLE_SLOTS]
    }

    /// Acquire the page lock, sleeping if a holder exists.
    pub fn lock_page(&self, page: &CachedPage) {
        let slot = self.slot_for(page);
        loop {
            if page.try_lock() {
                return;
            }
            let mut guard = slot.lock.lock();
            // Re-check under the slot lock: the holder serializes its
            // unlock+wake against this check, so the wakeup cannot slip by
            // between the test and the wait.
            if page.try_lock() {
                return;
            }
            slot.cond.wait(&mut guard);
        }
    }

    /// Release the page lock and wake sleepers.
    pub fn unlock_page(&self, page: &CachedPage) {
        let slot = self.slot_for(page);
        let _guard = slot.lock.lock();
        page.clear_locked();
        slot.cond.notify_all();
    }

    /// Sleep until the page is unlocked (without taking the lock).
    pub fn wait_on_page_locked(&self, page: &CachedPage) {
        let slot = self.slot_for(page);
        loop {
            if !page.is_locked() {
                return;
            }
            let mut guard = slot.lock.lock();
            if !page.is_locked() {
                return;
            }
            slot.cond.wait(&mut guard);
        }
    }

    /// Sleep until the page's writeback bit clears.
    pub fn wait_on_page_writeback(&self, page: &CachedPage) {
        let slot = self.slot_for(page);
        loop {
            if !page.is_writeback() {
                return;
            }
            let mut guard = slot.lock.lock();
            if !page.is_writeback() {
                return;
            }
            slot.cond.wait(&mut guard);
        }
    }

    /// Clear the page's writeback bit and wake sleepers.
    pub fn clear_page_writeback(&self, page: &CachedPage) -> bool {
        let slot = self.slot_for(page);
        let _guard = slot.lock.lock();
        let was = page.clear_writeback();
        slot.cond.notify_all();
        was
    }

    /// Acquire a buffer's lock. Buffer waiters share the owning page's
    /// slot.
    pub fn lock_buffer(&self, page: &CachedPage, buffer: &BufferHead) {
        let slot = self.slot_for(page);
        loop {
            if buffer.try_lock() {
                return;
            }
            let mut guard = slot.lock.lock();
            if buffer.try_lock() {
                return;
            }
            slot.cond.wait(&mut guard);
        }
    }

    /// Release a buffer's lock and wake sleepers on the page's slot.
    pub fn unlock_buffer(&self, page: &CachedPage, buffer: &BufferHead) {
        let slot = self.slot_for(page);
        let _guard = slot.lock.lock();
        buffer.clear_locked();
        slot.cond.notify_all();
    }

    /// Sleep until the buffer is unlocked.
    pub fn wait_on_buffer(&self, page: &CachedPage, buffer: &BufferHead) {
        let slot = self.slot_for(page);
        loop {
            if !buffer.is_locked() {
                return;
            }
            let mut guard = slot.lock.lock();
            if !buffer.is_locked() {
                return;
            }
            slot.cond.wait(&mut guard);
        }
    }
}
