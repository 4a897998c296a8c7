//! Request ordering policies.
//!
//! An elevator owns the set of queued-but-not-dispatched requests. The queue
//! asks it to merge incoming descriptors, to admit new requests, and for the
//! next request to hand a driver. Reordering never moves a request across a
//! barrier in either direction.

use crate::request::{BlockRequest, IoDescriptor, IoDir, SegmentLimits};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of a merge probe.
pub enum MergeDisposition {
    /// The descriptor was absorbed into a queued request.
    Merged(MergeKind),
    /// No queued neighbour fit; the descriptor comes back for a fresh
    /// request.
    NoMerge(IoDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Back,
    Front,
    /// A back or front merge closed the gap to the adjacent queued request
    /// and the two requests fused.
    Coalesced,
}

/// Ordering policy over queued requests.
///
/// Implementations are driven entirely under the queue lock; they hold no
/// locks of their own.
pub trait Elevator: Send {
    fn name(&self) -> &'static str;

    /// Admit a request made from a descriptor that did not merge.
    fn add_request(&mut self, request: BlockRequest);

    /// Try to fold `desc` into a queued request.
    fn merge(&mut self, desc: IoDescriptor, limits: &SegmentLimits) -> MergeDisposition;

    /// Remove and return the request to dispatch next.
    fn next_request(&mut self) -> Option<BlockRequest>;

    /// Whether the request at the dispatch position is a hard barrier.
    fn peek_is_barrier(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which policy a queue is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElevatorKind {
    /// Ascending-sector order, one-way scan.
    #[default]
    Sector,
    /// Sector order bounded by per-direction deadlines.
    Deadline,
}

impl ElevatorKind {
    #[must_use]
    pub fn build(self) -> Box<dyn Elevator> {
        match self {
            Self::Sector => Box::new(SectorElevator::new()),
            Self::Deadline => Box::new(DeadlineElevator::default()),
        }
    }
}

// ── sector elevator ─────────────────────────────────────────────────────────

/// One-way scan: requests dispatch in ascending sector order, restarting
/// from the lowest sector once the queue drains.
pub struct SectorElevator {
    queue: VecDeque<BlockRequest>,
}

impl SectorElevator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Index of the slot just past the last barrier, i.e. the first position
    /// sortable requests may occupy or merge within.
    fn sortable_from(&self) -> usize {
        self.queue
            .iter()
            .rposition(BlockRequest::is_barrier)
            .map_or(0, |i| i + 1)
    }
}

impl Default for SectorElevator {
    fn default() -> Self {
        Self::new()
    }
}

impl Elevator for SectorElevator {
    fn name(&self) -> &'static str {
        "sector"
    }

    fn add_request(&mut self, request: BlockRequest) {
        if request.is_barrier() {
            self.queue.push_back(request);
            return;
        }
        let from = self.sortable_from();
        let mut at = self.queue.len();
        while at > from {
            if self.queue[at - 1].sector() <= request.sector() {
                break;
            }
            at -= 1;
        }
        self.queue.insert(at, request);
    }

    fn merge(&mut self, desc: IoDescriptor, limits: &SegmentLimits) -> MergeDisposition {
        let from = self.sortable_from();
        for i in from..self.queue.len() {
            if self.queue[i].can_back_merge(&desc, limits) {
                self.queue[i].back_merge(desc);
                // The grown tail may now abut the next queued request.
                if i + 1 < self.queue.len()
                    && self.queue[i].can_coalesce(&self.queue[i + 1], limits)
                {
                    if let Some(next) = self.queue.remove(i + 1) {
                        self.queue[i].coalesce(next);
                    }
                    return MergeDisposition::Merged(MergeKind::Coalesced);
                }
                return MergeDisposition::Merged(MergeKind::Back);
            }
            if self.queue[i].can_front_merge(&desc, limits) {
                self.queue[i].front_merge(desc);
                if i > from && self.queue[i - 1].can_coalesce(&self.queue[i], limits) {
                    if let Some(grown) = self.queue.remove(i) {
                        self.queue[i - 1].coalesce(grown);
                    }
                    return MergeDisposition::Merged(MergeKind::Coalesced);
                }
                return MergeDisposition::Merged(MergeKind::Front);
            }
        }
        MergeDisposition::NoMerge(desc)
    }

    fn next_request(&mut self) -> Option<BlockRequest> {
        self.queue.pop_front()
    }

    fn peek_is_barrier(&self) -> bool {
        self.queue
            .front()
            .is_some_and(|r| r.flags().hard_barrier)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// ── deadline elevator ───────────────────────────────────────────────────────

const READ_DEADLINE: Duration = Duration::from_millis(500);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

struct DeadlineEntry {
    request: BlockRequest,
    expires: Instant,
}

/// Sector-sorted dispatch with a per-request expiry: a request whose
/// deadline has passed jumps the scan so writes cannot starve reads (or the
/// reverse) indefinitely.
pub struct DeadlineElevator {
    queue: VecDeque<DeadlineEntry>,
}

impl DeadlineElevator {
    fn deadline_for(dir: IoDir) -> Duration {
        match dir {
            IoDir::Read => READ_DEADLINE,
            IoDir::Write => WRITE_DEADLINE,
        }
    }

    fn sortable_from(&self) -> usize {
        self.queue
            .iter()
            .rposition(|e| e.request.is_barrier())
            .map_or(0, |i| i + 1)
    }
}

impl Default for DeadlineElevator {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl Elevator for DeadlineElevator {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn add_request(&mut self, request: BlockRequest) {
        let expires = Instant::now() + Self::deadline_for(request.dir());
        let entry = DeadlineEntry { request, expires };
        if entry.request.is_barrier() {
            self.queue.push_back(entry);
            return;
        }
        let from = self.sortable_from();
        let mut at = self.queue.len();
        while at > from {
            if self.queue[at - 1].request.sector() <= entry.request.sector() {
                break;
            }
            at -= 1;
        }
        self.queue.insert(at, entry);
    }

    fn merge(&mut self, desc: IoDescriptor, limits: &SegmentLimits) -> MergeDisposition {
        let from = self.sortable_from();
        for i in from..self.queue.len() {
            if self.queue[i].request.can_back_merge(&desc, limits) {
                self.queue[i].request.back_merge(desc);
                if i + 1 < self.queue.len()
                    && self.queue[i]
                        .request
                        .can_coalesce(&self.queue[i + 1].request, limits)
                {
                    if let Some(next) = self.queue.remove(i + 1) {
                        // The fused request answers for the earlier of the
                        // two deadlines.
                        self.queue[i].expires = self.queue[i].expires.min(next.expires);
                        self.queue[i].request.coalesce(next.request);
                    }
                    return MergeDisposition::Merged(MergeKind::Coalesced);
                }
                return MergeDisposition::Merged(MergeKind::Back);
            }
            if self.queue[i].request.can_front_merge(&desc, limits) {
                self.queue[i].request.front_merge(desc);
                if i > from
                    && self.queue[i - 1]
                        .request
                        .can_coalesce(&self.queue[i].request, limits)
                {
                    if let Some(grown) = self.queue.remove(i) {
                        self.queue[i - 1].expires = self.queue[i - 1].expires.min(grown.expires);
                        self.queue[i - 1].request.coalesce(grown.request);
                    }
                    return MergeDisposition::Merged(MergeKind::Coalesced);
                }
                return MergeDisposition::Merged(MergeKind::Front);
            }
        }
        MergeDisposition::NoMerge(desc)
    }

    fn next_request(&mut self) -> Option<BlockRequest> {
        if self.queue.is_empty() {
            return None;
        }
        // Barriers pin the front; expiry only reorders within the sortable
        // head run.
        if self.queue[0].request.is_barrier() {
            return self.queue.pop_front().map(|e| e.request);
        }
        let now = Instant::now();
        let barrier_end = self
            .queue
            .iter()
            .position(|e| e.request.is_barrier())
            .unwrap_or(self.queue.len());
        let expired = self
            .queue
            .iter()
            .take(barrier_end)
            .enumerate()
            .filter(|(_, e)| e.expires <= now)
            .min_by_key(|(_, e)| e.expires)
            .map(|(i, _)| i);
        let pick = expired.unwrap_or(0);
        self.queue.remove(pick).map(|e| e.request)
    }

    fn peek_is_barrier(&self) -> bool {
        self.queue
            .front()
            .is_some_and(|e| e.request.flags().hard_barrier)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{IoFlags, VecIoTarget};
    use quire_types::{SectorNumber, SECTOR_SIZE};

    fn desc(sector: u64, nr: u32) -> IoDescriptor {
        IoDescriptor {
            dir: IoDir::Write,
            sector: SectorNumber(sector),
            nr_sectors: nr,
            flags: IoFlags::default(),
            target: VecIoTarget::new(vec![0_u8; nr as usize * SECTOR_SIZE]),
        }
    }

    fn barrier_desc(sector: u64) -> IoDescriptor {
        let mut d = desc(sector, 1);
        d.flags.barrier = true;
        d
    }

    fn limits() -> SegmentLimits {
        SegmentLimits {
            max_sectors: 255,
            max_phys_segments: 128,
            max_hw_segments: 128,
        }
    }

    #[test]
    fn sector_elevator_sorts_ascending() {
        let mut ev = SectorElevator::new();
        for s in [40_u64, 8, 24] {
            ev.add_request(BlockRequest::from_descriptor(desc(s, 4)));
        }
        let order: Vec<u64> = std::iter::from_fn(|| ev.next_request())
            .map(|r| r.sector().0)
            .collect();
        assert_eq!(order, vec![8, 24, 40]);
    }

    #[test]
    fn requests_never_sort_before_a_barrier() {
        let mut ev = SectorElevator::new();
        ev.add_request(BlockRequest::from_descriptor(desc(100, 4)));
        ev.add_request(BlockRequest::from_descriptor(barrier_desc(50)));
        // Lower sector than everything, but the barrier fences it.
        ev.add_request(BlockRequest::from_descriptor(desc(0, 4)));
        let order: Vec<u64> = std::iter::from_fn(|| ev.next_request())
            .map(|r| r.sector().0)
            .collect();
        assert_eq!(order, vec![100, 50, 0]);
    }

    #[test]
    fn merge_folds_adjacent_descriptor() {
        let mut ev = SectorElevator::new();
        ev.add_request(BlockRequest::from_descriptor(desc(10, 4)));
        match ev.merge(desc(14, 4), &limits()) {
            MergeDisposition::Merged(MergeKind::Back) => {}
            _ => panic!("expected back merge"),
        }
        let req = ev.next_request().expect("one request");
        assert_eq!(req.nr_sectors(), 8);
    }

    #[test]
    fn merge_bridges_gap_and_coalesces() {
        let mut ev = SectorElevator::new();
        ev.add_request(BlockRequest::from_descriptor(desc(0, 4)));
        ev.add_request(BlockRequest::from_descriptor(desc(8, 4)));
        // Fills the hole between the two queued requests.
        match ev.merge(desc(4, 4), &limits()) {
            MergeDisposition::Merged(MergeKind::Coalesced) => {}
            _ => panic!("expected coalesced merge"),
        }
        assert_eq!(ev.len(), 1);
        let req = ev.next_request().expect("one request");
        assert_eq!(req.sector(), SectorNumber(0));
        assert_eq!(req.nr_sectors(), 12);
    }

    #[test]
    fn merge_never_crosses_barrier() {
        let mut ev = SectorElevator::new();
        ev.add_request(BlockRequest::from_descriptor(desc(10, 4)));
        ev.add_request(BlockRequest::from_descriptor(barrier_desc(100)));
        // Adjacent to the pre-barrier request, but that region is closed.
        match ev.merge(desc(14, 4), &limits()) {
            MergeDisposition::NoMerge(_) => {}
            MergeDisposition::Merged(_) => panic!("merged across a barrier"),
        }
    }

    #[test]
    fn deadline_elevator_promotes_expired_request() {
        let mut ev = DeadlineElevator::default();
        ev.add_request(BlockRequest::from_descriptor(desc(0, 4)));
        ev.add_request(BlockRequest::from_descriptor(desc(100, 4)));
        // Force the high-sector request past its deadline.
        ev.queue[1].expires = Instant::now() - Duration::from_secs(1);
        let first = ev.next_request().expect("request");
        assert_eq!(first.sector(), SectorNumber(100));
    }

    #[test]
    fn deadline_elevator_sorts_when_nothing_expired() {
        let mut ev = DeadlineElevator::default();
        ev.add_request(BlockRequest::from_descriptor(desc(64, 4)));
        ev.add_request(BlockRequest::from_descriptor(desc(8, 4)));
        let first = ev.next_request().expect("request");
        assert_eq!(first.sector(), SectorNumber(8));
    }
}
