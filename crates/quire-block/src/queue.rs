//! The request queue: admission, plugging, congestion, and dispatch.
//!
//! Submitters hand the queue [`IoDescriptor`]s; the queue merges them into
//! [`BlockRequest`]s through its elevator and meters admission with a
//! fixed-size slot pool. Drivers pull requests with [`RequestQueue::next_request`]
//! and retire them with [`RequestQueue::complete`]. The queue lock is never
//! held across a driver or completion callback.

use crate::context::BlockContext;
use crate::elevator::{Elevator, ElevatorKind, MergeDisposition, MergeKind};
use crate::request::{BlockRequest, IoDescriptor, IoDir, SegmentLimits};
use crate::BlockDriver;
use parking_lot::{Condvar, Mutex};
use quire_error::QuireError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Tunables for a request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Slot pool size per direction.
    pub nr_requests: usize,
    /// Largest single request, in sectors.
    pub max_sectors: u32,
    pub max_phys_segments: u32,
    pub max_hw_segments: u32,
    /// Queued requests that force an unplug on submission.
    pub unplug_thresh: usize,
    /// How long a plug may sit before the timer pulls it.
    pub unplug_delay: Duration,
    /// Requests a freshly woken waiter may allocate past the full mark.
    pub batch_requests: u32,
    /// Lifetime of a batching grant, and the slot-wait interval.
    pub batch_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nr_requests: 128,
            max_sectors: 255,
            max_phys_segments: 128,
            max_hw_segments: 128,
            unplug_thresh: 4,
            unplug_delay: Duration::from_millis(3),
            batch_requests: 32,
            batch_window: Duration::from_millis(20),
        }
    }
}

/// Counters, readable as a snapshot via [`RequestQueue::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub requests_queued: u64,
    pub requests_completed: u64,
    pub back_merges: u64,
    pub front_merges: u64,
    pub coalesced_merges: u64,
    pub unplugs: u64,
    pub slot_waits: u64,
    pub fail_fast_rejections: u64,
    pub barriers_queued: u64,
}

struct Batcher {
    remaining: u32,
    expires: Instant,
}

struct QueueInner {
    elevator: Box<dyn Elevator>,
    plugged: bool,
    plugged_at: Instant,
    /// Allocated slots per direction; held from admission to retirement.
    count: [usize; 2],
    in_flight: usize,
    full: [bool; 2],
    congested: [bool; 2],
    /// A dispatched hard barrier fences the queue until it retires.
    barrier_active: bool,
    slot_waiters: [usize; 2],
    batchers: HashMap<ThreadId, Batcher>,
    next_tag: u64,
    stats: QueueStats,
}

impl QueueInner {
    fn idle(&self) -> bool {
        self.elevator.is_empty() && self.in_flight == 0
    }

    fn batching(&self, tid: ThreadId, now: Instant) -> bool {
        self.batchers
            .get(&tid)
            .is_some_and(|b| b.remaining > 0 && b.expires > now)
    }
}

enum SubmitOutcome {
    Queued { unplug: bool },
    Merged,
    NoSlot(IoDescriptor),
}

/// A single device queue.
pub struct RequestQueue {
    config: QueueConfig,
    limits: SegmentLimits,
    /// First allocation at or above this count marks the direction
    /// congested.
    congest_on: usize,
    /// Dropping below this count clears congestion.
    congest_off: usize,
    driver: Arc<dyn BlockDriver>,
    ctx: Arc<BlockContext>,
    inner: Mutex<QueueInner>,
    slot_cv: [Condvar; 2],
    drain_cv: Condvar,
}

impl RequestQueue {
    #[must_use]
    pub fn new(
        config: QueueConfig,
        kind: ElevatorKind,
        driver: Arc<dyn BlockDriver>,
        ctx: Arc<BlockContext>,
    ) -> Arc<Self> {
        let nr = config.nr_requests.max(1);
        let congest_on = (nr - nr / 8 + 1).min(nr);
        let congest_off = (nr - nr / 8).saturating_sub(1).max(1);
        let limits = SegmentLimits {
            max_sectors: config.max_sectors,
            max_phys_segments: config.max_phys_segments,
            max_hw_segments: config.max_hw_segments,
        };
        Arc::new(Self {
            limits,
            congest_on,
            congest_off,
            driver,
            ctx,
            inner: Mutex::new(QueueInner {
                elevator: kind.build(),
                plugged: false,
                plugged_at: Instant::now(),
                count: [0; 2],
                in_flight: 0,
                full: [false; 2],
                congested: [false; 2],
                barrier_active: false,
                slot_waiters: [0; 2],
                batchers: HashMap::new(),
                next_tag: 0,
                stats: QueueStats::default(),
            }),
            slot_cv: [Condvar::new(), Condvar::new()],
            drain_cv: Condvar::new(),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[must_use]
    pub fn limits(&self) -> SegmentLimits {
        self.limits
    }

    #[must_use]
    pub fn context(&self) -> &Arc<BlockContext> {
        &self.ctx
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }

    /// Allocated slots for `dir`, admission through retirement.
    #[must_use]
    pub fn slot_count(&self, dir: IoDir) -> usize {
        self.inner.lock().count[dir.index()]
    }

    #[must_use]
    pub fn is_congested(&self, dir: IoDir) -> bool {
        self.inner.lock().congested[dir.index()]
    }

    /// Hand one descriptor to the queue.
    ///
    /// Never returns an error: failures (a malformed descriptor, or slot
    /// exhaustion on a fail-fast descriptor) are delivered through the
    /// target's `end_io`. A non-fail-fast submitter sleeps here until a slot
    /// frees, unplugging first so the driver can make that happen.
    pub fn submit(&self, desc: IoDescriptor) {
        if desc.nr_sectors == 0 || desc.nr_sectors > self.limits.max_sectors {
            let nr = desc.nr_sectors;
            desc.target.end_io(Err(QuireError::BadRequest(format!(
                "descriptor of {nr} sectors (queue maximum {})",
                self.limits.max_sectors
            ))));
            return;
        }
        let mut pending = desc;
        loop {
            match self.try_submit(pending) {
                SubmitOutcome::Merged => return,
                SubmitOutcome::Queued { unplug } => {
                    if unplug {
                        self.unplug();
                    }
                    return;
                }
                SubmitOutcome::NoSlot(d) => {
                    if d.flags.fail_fast {
                        trace!(sector = d.sector.0, "dropping fail-fast descriptor, pool full");
                        self.inner.lock().stats.fail_fast_rejections += 1;
                        d.target.end_io(Err(QuireError::WouldBlock));
                        return;
                    }
                    // Push queued work at the driver before sleeping on it.
                    self.unplug();
                    self.wait_for_slot(d.dir);
                    pending = d;
                }
            }
        }
    }

    fn try_submit(&self, mut desc: IoDescriptor) -> SubmitOutcome {
        let mut inner = self.inner.lock();
        let dir = desc.dir;
        if !desc.flags.barrier {
            match inner.elevator.merge(desc, &self.limits) {
                MergeDisposition::Merged(kind) => {
                    match kind {
                        MergeKind::Back => inner.stats.back_merges += 1,
                        MergeKind::Front => inner.stats.front_merges += 1,
                        MergeKind::Coalesced => inner.stats.coalesced_merges += 1,
                    }
                    return SubmitOutcome::Merged;
                }
                MergeDisposition::NoMerge(d) => desc = d,
            }
        }
        let now = Instant::now();
        let batching = inner.batching(thread::current().id(), now);
        if !self.acquire_slot(&mut inner, dir, batching) {
            return SubmitOutcome::NoSlot(desc);
        }
        if batching {
            if let Some(b) = inner.batchers.get_mut(&thread::current().id()) {
                b.remaining -= 1;
            }
        }
        let barrier = desc.flags.barrier;
        if barrier {
            inner.stats.barriers_queued += 1;
        }
        if inner.elevator.is_empty() && !inner.plugged {
            inner.plugged = true;
            inner.plugged_at = now;
        }
        inner.elevator.add_request(BlockRequest::from_descriptor(desc));
        inner.stats.requests_queued += 1;
        // Enough stacked work to stop waiting for more merges; barriers
        // flush immediately.
        let unplug = barrier || inner.elevator.len() >= self.config.unplug_thresh;
        SubmitOutcome::Queued { unplug }
    }

    fn acquire_slot(&self, inner: &mut QueueInner, dir: IoDir, batching: bool) -> bool {
        let d = dir.index();
        if inner.count[d] + 1 >= self.config.nr_requests {
            if !inner.full[d] {
                // The allocation that crosses the line still succeeds; it
                // marks the pool full for everyone after it.
                inner.full[d] = true;
            } else if !batching {
                return false;
            }
        }
        inner.count[d] += 1;
        if inner.count[d] >= self.congest_on && !inner.congested[d] {
            inner.congested[d] = true;
            self.ctx.enter_congestion(dir);
            debug!(dir = ?dir, count = inner.count[d], "queue congested");
        }
        true
    }

    fn wait_for_slot(&self, dir: IoDir) {
        let d = dir.index();
        let mut inner = self.inner.lock();
        inner.slot_waiters[d] += 1;
        inner.stats.slot_waits += 1;
        let _ = self.slot_cv[d].wait_for(&mut inner, self.config.batch_window);
        inner.slot_waiters[d] -= 1;
        // A waiter that actually slept earns a batching grant, so it can
        // stream a burst before newcomers squeeze it out again.
        let now = Instant::now();
        inner
            .batchers
            .retain(|_, b| b.remaining > 0 && b.expires > now);
        inner.batchers.insert(
            thread::current().id(),
            Batcher {
                remaining: self.config.batch_requests,
                expires: now + self.config.batch_window,
            },
        );
    }

    fn freed_slot(&self, inner: &mut QueueInner, dir: IoDir) {
        let d = dir.index();
        inner.count[d] = inner.count[d].saturating_sub(1);
        if inner.count[d] < self.congest_off && inner.congested[d] {
            inner.congested[d] = false;
            self.ctx.exit_congestion(dir);
            debug!(dir = ?dir, count = inner.count[d], "queue uncongested");
        }
        if inner.count[d] + 1 <= self.config.nr_requests {
            if inner.slot_waiters[d] > 0 {
                // Hand the freed slot to a sleeper; the pool stays marked
                // full so newcomers cannot jump the line.
                self.slot_cv[d].notify_all();
            } else {
                inner.full[d] = false;
            }
        }
    }

    /// Remove the plug, then run the driver.
    pub fn unplug(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.plugged {
                inner.plugged = false;
                inner.stats.unplugs += 1;
            }
        }
        self.run();
    }

    /// Run the driver against the queue. No lock is held across the call.
    pub fn run(&self) {
        self.driver.process(self);
    }

    /// Ask the driver to flush its volatile cache. Callers drain first if
    /// they need queued writes included.
    pub fn flush_device(&self) -> quire_error::Result<()> {
        self.driver.flush()
    }

    /// Whether the plug has outlived its delay. Polled by [`UnplugDaemon`].
    #[must_use]
    pub fn plug_expired(&self) -> bool {
        let inner = self.inner.lock();
        inner.plugged && inner.plugged_at.elapsed() >= self.config.unplug_delay
    }

    /// Pull the next dispatchable request. Driver-side API.
    ///
    /// Returns `None` while the queue is plugged, while a hard barrier is in
    /// flight, or when the head request is a hard barrier that must wait for
    /// earlier in-flight I/O to drain.
    pub fn next_request(&self) -> Option<BlockRequest> {
        let mut inner = self.inner.lock();
        if inner.plugged || inner.barrier_active {
            return None;
        }
        if inner.elevator.peek_is_barrier() && inner.in_flight > 0 {
            return None;
        }
        let mut req = inner.elevator.next_request()?;
        let tag = inner.next_tag;
        inner.next_tag += 1;
        req.mark_started(tag);
        if req.flags().hard_barrier {
            inner.barrier_active = true;
        }
        inner.in_flight += 1;
        trace!(tag, sector = req.sector().0, nr = req.nr_sectors(), "dispatch");
        Some(req)
    }

    /// Account `bytes` of transfer on `req` with `status`; retire the
    /// request when fully accounted. Driver-side API.
    ///
    /// Per-descriptor `end_io` callbacks run here with no queue lock held.
    /// Returns `true` when the request retired.
    pub fn complete(&self, req: &mut BlockRequest, bytes: usize, status: &quire_error::Result<()>) -> bool {
        if !req.complete_bytes(bytes, status) {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.in_flight -= 1;
        if req.flags().hard_barrier {
            inner.barrier_active = false;
        }
        inner.stats.requests_completed += 1;
        self.freed_slot(&mut inner, req.dir());
        if inner.idle() {
            self.drain_cv.notify_all();
        }
        true
    }

    /// Unplug and wait until nothing is queued or in flight.
    pub fn drain(&self) {
        loop {
            self.unplug();
            let mut inner = self.inner.lock();
            if inner.idle() {
                return;
            }
            // Re-probe periodically in case a racing submitter re-plugged.
            let _ = self
                .drain_cv
                .wait_for(&mut inner, Duration::from_millis(10));
            if inner.idle() {
                return;
            }
        }
    }
}

/// Background thread that pulls plugs left in place past their delay.
pub struct UnplugDaemon {
    queue: Arc<RequestQueue>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl UnplugDaemon {
    pub fn spawn(queue: Arc<RequestQueue>) -> quire_error::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let thread_queue = Arc::clone(&queue);
        let interval = queue.config().unplug_delay;
        let handle = thread::Builder::new()
            .name("quire-unplug".to_string())
            .spawn(move || {
                let (lock, cv) = &*thread_stop;
                loop {
                    {
                        let mut stopped = lock.lock();
                        let _ = cv.wait_for(&mut stopped, interval);
                        if *stopped {
                            return;
                        }
                    }
                    // Stop lock released: the driver may run for a while.
                    if thread_queue.plug_expired() {
                        thread_queue.unplug();
                    }
                }
            })?;
        Ok(Self {
            queue,
            stop,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    fn signal_stop(&mut self) {
        let (lock, cv) = &*self.stop;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("unplug daemon panicked before shutdown");
            }
        }
    }

    pub fn shutdown(mut self) {
        self.signal_stop();
    }
}

impl Drop for UnplugDaemon {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{IoFlags, IoTarget, VecIoTarget};
    use parking_lot::Mutex as PlMutex;
    use quire_types::{SectorNumber, SECTOR_SIZE};

    /// Driver that transfers nothing until told to, recording dispatch
    /// order.
    struct ManualDriver {
        enabled: PlMutex<bool>,
        dispatched: PlMutex<Vec<u64>>,
    }

    impl ManualDriver {
        fn new(enabled: bool) -> Arc<Self> {
            Arc::new(Self {
                enabled: PlMutex::new(enabled),
                dispatched: PlMutex::new(Vec::new()),
            })
        }
    }

    impl BlockDriver for ManualDriver {
        fn process(&self, queue: &RequestQueue) {
            if !*self.enabled.lock() {
                return;
            }
            while let Some(mut req) = queue.next_request() {
                self.dispatched.lock().push(req.sector().0);
                let n = req.bytes_remaining();
                queue.complete(&mut req, n, &Ok(()));
            }
        }

        fn name(&self) -> &'static str {
            "manual"
        }
    }

    fn queue_with(config: QueueConfig, driver: Arc<ManualDriver>) -> Arc<RequestQueue> {
        RequestQueue::new(
            config,
            ElevatorKind::Sector,
            driver,
            Arc::new(BlockContext::new()),
        )
    }

    fn desc(dir: IoDir, sector: u64, nr: u32) -> (IoDescriptor, Arc<VecIoTarget>) {
        let target = VecIoTarget::new(vec![0_u8; nr as usize * SECTOR_SIZE]);
        (
            IoDescriptor {
                dir,
                sector: SectorNumber(sector),
                nr_sectors: nr,
                flags: IoFlags::default(),
                target: Arc::clone(&target) as Arc<dyn IoTarget>,
            },
            target,
        )
    }

    #[test]
    fn congestion_thresholds_follow_pool_size() {
        let driver = ManualDriver::new(false);
        let q = queue_with(QueueConfig::default(), driver);
        assert_eq!(q.congest_on, 113);
        assert_eq!(q.congest_off, 111);
    }

    #[test]
    fn first_submission_plugs_the_queue() {
        let driver = ManualDriver::new(true);
        let q = queue_with(QueueConfig::default(), Arc::clone(&driver));
        q.submit(desc(IoDir::Write, 0, 8).0);
        // Plugged: the driver saw nothing yet.
        assert!(driver.dispatched.lock().is_empty());
        q.unplug();
        assert_eq!(driver.dispatched.lock().as_slice(), &[0]);
    }

    #[test]
    fn threshold_unplug_releases_batched_requests() {
        let driver = ManualDriver::new(true);
        let config = QueueConfig {
            unplug_thresh: 3,
            ..QueueConfig::default()
        };
        let q = queue_with(config, Arc::clone(&driver));
        // Non-adjacent sectors so nothing merges.
        q.submit(desc(IoDir::Write, 0, 4).0);
        q.submit(desc(IoDir::Write, 100, 4).0);
        assert!(driver.dispatched.lock().is_empty());
        q.submit(desc(IoDir::Write, 200, 4).0);
        assert_eq!(driver.dispatched.lock().len(), 3);
    }

    #[test]
    fn fail_fast_descriptor_bounces_off_full_pool() {
        let driver = ManualDriver::new(false);
        let config = QueueConfig {
            nr_requests: 2,
            unplug_thresh: 64,
            ..QueueConfig::default()
        };
        let q = queue_with(config, driver);
        q.submit(desc(IoDir::Read, 0, 1).0);
        // Crosses the full mark but still gets the slot.
        q.submit(desc(IoDir::Read, 100, 1).0);
        assert_eq!(q.slot_count(IoDir::Read), 2);

        let (mut d, target) = desc(IoDir::Read, 200, 1);
        d.flags.fail_fast = true;
        q.submit(d);
        let result = target.result().expect("fail-fast completes immediately");
        assert!(matches!(result, Err(QuireError::WouldBlock)));
        assert_eq!(q.stats().fail_fast_rejections, 1);
    }

    #[test]
    fn congestion_sets_and_clears_with_hysteresis() {
        let driver = ManualDriver::new(false);
        let config = QueueConfig {
            nr_requests: 8,
            unplug_thresh: 1024,
            ..QueueConfig::default()
        };
        let q = queue_with(config, Arc::clone(&driver));
        // nr=8: on at count 8, off below 6.
        assert_eq!(q.congest_on, 8);
        assert_eq!(q.congest_off, 6);
        for i in 0..8 {
            q.submit(desc(IoDir::Write, i * 100, 1).0);
        }
        assert!(q.is_congested(IoDir::Write));
        assert!(q.context().is_congested(IoDir::Write));

        *driver.enabled.lock() = true;
        q.drain();
        assert!(!q.is_congested(IoDir::Write));
        assert_eq!(q.slot_count(IoDir::Write), 0);
    }

    #[test]
    fn invalid_descriptor_fails_without_queueing() {
        let driver = ManualDriver::new(false);
        let q = queue_with(QueueConfig::default(), driver);
        let (mut d, target) = desc(IoDir::Write, 0, 1);
        d.nr_sectors = 0;
        q.submit(d);
        let result = target.result().expect("rejected immediately");
        assert!(matches!(result, Err(QuireError::BadRequest(_))));
        assert_eq!(q.stats().requests_queued, 0);
    }

    #[test]
    fn merged_descriptors_complete_together() {
        let driver = ManualDriver::new(true);
        let config = QueueConfig {
            unplug_thresh: 64,
            ..QueueConfig::default()
        };
        let q = queue_with(config, Arc::clone(&driver));
        let (d0, t0) = desc(IoDir::Write, 0, 4);
        let (d1, t1) = desc(IoDir::Write, 4, 4);
        q.submit(d0);
        q.submit(d1);
        assert_eq!(q.stats().back_merges, 1);
        q.unplug();
        assert!(t0.result().expect("first").is_ok());
        assert!(t1.result().expect("second").is_ok());
        // One merged request reached the driver.
        assert_eq!(driver.dispatched.lock().as_slice(), &[0]);
    }
}
