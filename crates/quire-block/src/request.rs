//! I/O descriptors and the merged block request.
//!
//! An [`IoDescriptor`] is the unit a submitter hands to the queue: one
//! direction, one sector-contiguous device range, one memory target. A
//! [`BlockRequest`] is the unit a driver sees: an ordered run of descriptors
//! whose device ranges are contiguous without gaps.

use parking_lot::Mutex;
use quire_error::Result;
use quire_types::{SectorNumber, SECTOR_SIZE};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

impl IoDir {
    /// Index into per-direction arrays (read = 0, write = 1).
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

/// The memory side of one descriptor.
///
/// The block layer never touches pages or buffers directly; it copies
/// through this seam and reports per-descriptor completion through it.
/// Implementations live with the memory's owner (the buffer layer implements
/// it for page buffers, tests for plain vectors).
pub trait IoTarget: Send + Sync {
    /// Transfer length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the memory region out for a device write.
    fn copy_out(&self, dst: &mut [u8]);

    /// Copy device data into the memory region after a read.
    fn copy_in(&self, src: &[u8]);

    /// Completion notification for this descriptor.
    ///
    /// Called exactly once, with no queue lock held. Errors carry the status
    /// of the smallest completed unit, not the whole request.
    fn end_io(&self, result: Result<()>);
}

/// A plain heap buffer target, for tests and simple callers.
#[derive(Debug)]
pub struct VecIoTarget {
    data: Mutex<Vec<u8>>,
    result: Mutex<Option<Result<()>>>,
}

impl VecIoTarget {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            result: Mutex::new(None),
        })
    }

    /// The buffer contents (post-read for read targets).
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// The completion result, if `end_io` has run.
    #[must_use]
    pub fn result(&self) -> Option<Result<()>> {
        self.result.lock().clone()
    }
}

impl IoTarget for VecIoTarget {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn copy_out(&self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.data.lock());
    }

    fn copy_in(&self, src: &[u8]) {
        self.data.lock().copy_from_slice(src);
    }

    fn end_io(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
    }
}

/// Submission flags on a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// Order all earlier I/O before this descriptor and this descriptor
    /// before all later I/O. Implies non-mergeable.
    pub barrier: bool,
    /// Fail with [`QuireError::WouldBlock`] instead of sleeping for a
    /// request slot. Set for readahead so speculative I/O never stacks up
    /// retries behind a full pool.
    pub fail_fast: bool,
}

/// One sector-contiguous I/O unit: a memory region plus a device range.
pub struct IoDescriptor {
    pub dir: IoDir,
    pub sector: SectorNumber,
    pub nr_sectors: u32,
    pub flags: IoFlags,
    pub target: Arc<dyn IoTarget>,
}

impl fmt::Debug for IoDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoDescriptor")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl IoDescriptor {
    /// First sector past the described range.
    #[must_use]
    pub fn end_sector(&self) -> SectorNumber {
        SectorNumber(self.sector.0.saturating_add(u64::from(self.nr_sectors)))
    }

    /// Transfer length in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.nr_sectors as usize * SECTOR_SIZE
    }
}

/// Queue-configured merge ceilings.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub max_sectors: u32,
    pub max_phys_segments: u32,
    pub max_hw_segments: u32,
}

/// Mutable state flags on a queued request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Elevator may not reorder other requests past this one.
    pub soft_barrier: bool,
    /// Dispatch must drain in-flight I/O before this request and admit
    /// nothing behind it until it completes.
    pub hard_barrier: bool,
    /// Do not retry or wait on resource exhaustion.
    pub fail_fast: bool,
    /// Never merge anything into this request.
    pub no_merge: bool,
    /// Dispatched to the driver with a device tag assigned.
    pub queued: bool,
    /// Handed to the driver at least once.
    pub started: bool,
}

/// A queued, possibly-merged unit of block I/O.
///
/// Invariant: the descriptors' device ranges are contiguous in submission
/// order without gaps, all in the same direction.
pub struct BlockRequest {
    dir: IoDir,
    sector: SectorNumber,
    nr_sectors: u32,
    descriptors: VecDeque<IoDescriptor>,
    nr_phys_segments: u32,
    nr_hw_segments: u32,
    flags: RequestFlags,
    tag: Option<u64>,
    /// Bytes of the front descriptor already accounted by partial
    /// completion.
    front_done: usize,
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("descriptors", &self.descriptors.len())
            .field("flags", &self.flags)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl BlockRequest {
    /// Build a fresh request around its first descriptor.
    #[must_use]
    pub fn from_descriptor(desc: IoDescriptor) -> Self {
        let mut flags = RequestFlags::default();
        if desc.flags.barrier {
            // A barrier never merges; make that explicit rather than relying
            // on every merge probe to re-check the barrier bit.
            flags.soft_barrier = true;
            flags.hard_barrier = true;
            flags.no_merge = true;
        }
        if desc.flags.fail_fast {
            flags.fail_fast = true;
        }
        let mut descriptors = VecDeque::with_capacity(1);
        let dir = desc.dir;
        let sector = desc.sector;
        let nr_sectors = desc.nr_sectors;
        descriptors.push_back(desc);
        Self {
            dir,
            sector,
            nr_sectors,
            descriptors,
            nr_phys_segments: 1,
            nr_hw_segments: 1,
            flags,
            tag: None,
            front_done: 0,
        }
    }

    #[must_use]
    pub fn dir(&self) -> IoDir {
        self.dir
    }

    #[must_use]
    pub fn sector(&self) -> SectorNumber {
        self.sector
    }

    #[must_use]
    pub fn nr_sectors(&self) -> u32 {
        self.nr_sectors
    }

    /// First sector past the request.
    #[must_use]
    pub fn end_sector(&self) -> SectorNumber {
        SectorNumber(self.sector.0.saturating_add(u64::from(self.nr_sectors)))
    }

    #[must_use]
    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    #[must_use]
    pub fn nr_phys_segments(&self) -> u32 {
        self.nr_phys_segments
    }

    #[must_use]
    pub fn nr_hw_segments(&self) -> u32 {
        self.nr_hw_segments
    }

    #[must_use]
    pub fn tag(&self) -> Option<u64> {
        self.tag
    }

    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.flags.soft_barrier || self.flags.hard_barrier
    }

    /// Whether new descriptors or neighbouring requests may merge in.
    ///
    /// A started request belongs to the driver; a special-status request
    /// (barrier) is rejected outright by this predicate rather than being
    /// silently skipped.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        !self.flags.no_merge && !self.flags.started
    }

    /// The descriptor a driver should transfer next.
    #[must_use]
    pub fn front(&self) -> Option<&IoDescriptor> {
        self.descriptors.front()
    }

    /// Remaining untransferred bytes.
    #[must_use]
    pub fn bytes_remaining(&self) -> usize {
        let total: usize = self.descriptors.iter().map(IoDescriptor::len_bytes).sum();
        total - self.front_done
    }

    pub(crate) fn mark_started(&mut self, tag: u64) {
        self.flags.started = true;
        self.flags.queued = true;
        self.tag = Some(tag);
    }

    fn fits(&self, extra_sectors: u32, limits: &SegmentLimits) -> bool {
        self.nr_sectors.saturating_add(extra_sectors) <= limits.max_sectors
            && self.nr_phys_segments < limits.max_phys_segments
            && self.nr_hw_segments < limits.max_hw_segments
    }

    /// Whether `desc` can extend the tail of this request.
    #[must_use]
    pub fn can_back_merge(&self, desc: &IoDescriptor, limits: &SegmentLimits) -> bool {
        self.is_mergeable()
            && self.dir == desc.dir
            && !desc.flags.barrier
            && self.end_sector() == desc.sector
            && self.fits(desc.nr_sectors, limits)
    }

    /// Whether `desc` can extend the head of this request.
    #[must_use]
    pub fn can_front_merge(&self, desc: &IoDescriptor, limits: &SegmentLimits) -> bool {
        self.is_mergeable()
            && self.dir == desc.dir
            && !desc.flags.barrier
            && desc.end_sector() == self.sector
            && self.fits(desc.nr_sectors, limits)
    }

    /// Append `desc` at the tail. Caller must have checked
    /// [`Self::can_back_merge`].
    pub fn back_merge(&mut self, desc: IoDescriptor) {
        debug_assert_eq!(self.end_sector(), desc.sector);
        self.nr_sectors += desc.nr_sectors;
        self.nr_phys_segments += 1;
        self.nr_hw_segments += 1;
        self.descriptors.push_back(desc);
    }

    /// Prepend `desc` at the head. Caller must have checked
    /// [`Self::can_front_merge`].
    pub fn front_merge(&mut self, desc: IoDescriptor) {
        debug_assert_eq!(desc.end_sector(), self.sector);
        self.sector = desc.sector;
        self.nr_sectors += desc.nr_sectors;
        self.nr_phys_segments += 1;
        self.nr_hw_segments += 1;
        self.descriptors.push_front(desc);
    }

    /// Whether `next` (a separately queued request) can be absorbed whole.
    #[must_use]
    pub fn can_coalesce(&self, next: &Self, limits: &SegmentLimits) -> bool {
        self.is_mergeable()
            && next.is_mergeable()
            && self.dir == next.dir
            && self.end_sector() == next.sector
            && self
                .nr_sectors
                .saturating_add(next.nr_sectors)
                <= limits.max_sectors
            && self.nr_phys_segments + next.nr_phys_segments <= limits.max_phys_segments
            && self.nr_hw_segments + next.nr_hw_segments <= limits.max_hw_segments
    }

    /// Absorb a whole neighbouring request. Caller must have checked
    /// [`Self::can_coalesce`].
    pub fn coalesce(&mut self, next: Self) {
        debug_assert_eq!(self.end_sector(), next.sector);
        self.nr_sectors += next.nr_sectors;
        self.nr_phys_segments += next.nr_phys_segments;
        self.nr_hw_segments += next.nr_hw_segments;
        self.descriptors.extend(next.descriptors);
    }

    /// Account `bytes` of completed transfer with `status`, front to back.
    ///
    /// Every descriptor that finishes inside this span gets its `end_io`
    /// with a clone of `status`; errors propagate on the smallest completed
    /// unit. Returns `true` once the whole request is accounted.
    pub fn complete_bytes(&mut self, mut bytes: usize, status: &Result<()>) -> bool {
        while bytes > 0 {
            let Some(front) = self.descriptors.front() else {
                break;
            };
            let remaining = front.len_bytes() - self.front_done;
            if bytes >= remaining {
                bytes -= remaining;
                self.front_done = 0;
                if let Some(done) = self.descriptors.pop_front() {
                    done.target.end_io(clone_status(status));
                }
            } else {
                self.front_done += bytes;
                bytes = 0;
            }
        }
        self.descriptors.is_empty()
    }
}

fn clone_status(status: &Result<()>) -> Result<()> {
    match status {
        Ok(()) => Ok(()),
        Err(err) => Err(err.clone()),
    }
}
