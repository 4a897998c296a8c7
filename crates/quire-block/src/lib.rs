#![forbid(unsafe_code)]
//! Block request scheduling for quire.
//!
//! This crate is the device-agnostic half of the I/O path. Callers hand in
//! [`IoDescriptor`]s (one memory region + one device range each); the
//! [`RequestQueue`] merges adjacent descriptors into [`BlockRequest`]s,
//! orders them through a pluggable [`Elevator`], throttles admission through
//! a bounded slot pool with congestion hysteresis, and dispatches batches to
//! a [`BlockDriver`]. Completion is partial-transfer aware: a driver can
//! retire a request in pieces and each finished descriptor's target is
//! notified individually.
//!
//! # Locking
//!
//! One mutex per queue guards the elevator, the slot counts, and the plug
//! state. It is never held across a driver callback or a target's `end_io`.
//! Cross-queue congestion state lives in an explicit [`BlockContext`] that is
//! constructed once and threaded through; there are no process-wide
//! singletons.

mod context;
mod disk;
mod elevator;
mod filedisk;
mod queue;
mod ramdisk;
mod request;

pub use context::BlockContext;
pub use disk::{GenDisk, Partition};
pub use elevator::{
    DeadlineElevator, Elevator, ElevatorKind, MergeDisposition, MergeKind, SectorElevator,
};
pub use filedisk::FileDisk;
pub use queue::{QueueConfig, QueueStats, RequestQueue, UnplugDaemon};
pub use ramdisk::RamDisk;
pub use request::{
    BlockRequest, IoDescriptor, IoDir, IoFlags, IoTarget, RequestFlags, SegmentLimits, VecIoTarget,
};

use quire_error::Result;

/// A device driver attached to a request queue.
///
/// `process` is invoked by the queue with no queue lock held; the driver
/// pulls work with [`RequestQueue::next_request`] and accounts transfers
/// with [`RequestQueue::complete`]. A synchronous driver retires everything
/// before returning; an asynchronous one may return with requests still in
/// flight and call `complete` later from its own context.
pub trait BlockDriver: Send + Sync {
    /// Begin processing the head of the queue.
    fn process(&self, queue: &RequestQueue);

    /// Flush the device's volatile cache to stable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Driver name for diagnostics.
    fn name(&self) -> &'static str {
        "driver"
    }
}
