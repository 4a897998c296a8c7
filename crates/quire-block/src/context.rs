//! Shared cross-queue state.
//!
//! A [`BlockContext`] is created once per cache instance and shared by every
//! queue and every writeback path built over it. It replaces what would
//! otherwise be process-global state: the congestion gate that writeback
//! throttles against.

use crate::request::IoDir;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Per-direction congestion gate.
///
/// Queues raise and lower the per-direction counters as their slot pools
/// cross the congestion thresholds; writeback callers park in
/// [`BlockContext::wait_for_uncongested`] until every congested queue for
/// that direction has backed off.
pub struct BlockContext {
    congested: Mutex<[usize; 2]>,
    relieved: Condvar,
}

impl BlockContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            congested: Mutex::new([0; 2]),
            relieved: Condvar::new(),
        }
    }

    /// A queue crossed its congestion-on threshold.
    pub fn enter_congestion(&self, dir: IoDir) {
        let mut counts = self.congested.lock();
        counts[dir.index()] += 1;
    }

    /// A queue dropped back below its congestion-off threshold.
    pub fn exit_congestion(&self, dir: IoDir) {
        let mut counts = self.congested.lock();
        counts[dir.index()] = counts[dir.index()].saturating_sub(1);
        if counts[dir.index()] == 0 {
            self.relieved.notify_all();
        }
    }

    #[must_use]
    pub fn is_congested(&self, dir: IoDir) -> bool {
        self.congested.lock()[dir.index()] > 0
    }

    /// Sleep until no queue reports congestion for `dir`, or `timeout`
    /// passes. Returns whether the direction is clear.
    ///
    /// The timeout doubles as the backoff interval: a caller that keeps
    /// generating I/O re-checks rather than sleeping unboundedly.
    pub fn wait_for_uncongested(&self, dir: IoDir, timeout: Duration) -> bool {
        let mut counts = self.congested.lock();
        if counts[dir.index()] == 0 {
            return true;
        }
        let _ = self.relieved.wait_for(&mut counts, timeout);
        counts[dir.index()] == 0
    }
}

impl Default for BlockContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn congestion_is_per_direction() {
        let ctx = BlockContext::new();
        ctx.enter_congestion(IoDir::Write);
        assert!(ctx.is_congested(IoDir::Write));
        assert!(!ctx.is_congested(IoDir::Read));
        ctx.exit_congestion(IoDir::Write);
        assert!(!ctx.is_congested(IoDir::Write));
    }

    #[test]
    fn wait_returns_immediately_when_clear() {
        let ctx = BlockContext::new();
        assert!(ctx.wait_for_uncongested(IoDir::Write, Duration::from_secs(5)));
    }

    #[test]
    fn wait_wakes_on_relief() {
        let ctx = Arc::new(BlockContext::new());
        ctx.enter_congestion(IoDir::Write);
        let waiter = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || {
            waiter.wait_for_uncongested(IoDir::Write, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(10));
        ctx.exit_congestion(IoDir::Write);
        assert!(handle.join().expect("waiter thread"));
    }

    #[test]
    fn nested_congestion_needs_full_relief() {
        let ctx = BlockContext::new();
        ctx.enter_congestion(IoDir::Read);
        ctx.enter_congestion(IoDir::Read);
        ctx.exit_congestion(IoDir::Read);
        assert!(ctx.is_congested(IoDir::Read));
        ctx.exit_congestion(IoDir::Read);
        assert!(!ctx.is_congested(IoDir::Read));
    }
}
