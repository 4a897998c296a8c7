#![forbid(unsafe_code)]
//! Quire public API facade.
//!
//! A quire is a gathering of pages. This crate re-exports the workspace's
//! layers through one front door: unit types, the error taxonomy, the block
//! request scheduler, the page cache core, and the buffered file I/O paths.
//! Downstream consumers (the CLI, embedding filesystems) depend on this
//! crate rather than on the internals.

pub use quire_error::{QuireError, Result};
pub use quire_types::{
    BlockNumber, BlockSize, ByteOffset, PageIndex, SectorNumber, UnitError, PAGE_SHIFT, PAGE_SIZE,
    SECTORS_PER_PAGE, SECTOR_SHIFT, SECTOR_SIZE,
};

pub use quire_block::{
    BlockContext, BlockDriver, BlockRequest, DeadlineElevator, Elevator, ElevatorKind, FileDisk,
    GenDisk, IoDescriptor, IoDir, IoFlags, IoTarget, MergeDisposition, MergeKind, Partition,
    QueueConfig, QueueStats, RamDisk, RequestFlags, RequestQueue, SectorElevator, SegmentLimits,
    UnplugDaemon, VecIoTarget,
};

pub use quire_cache::{AddressSpace, BufferHead, CacheContext, CachedPage, SpaceStats};

pub use quire_file::{
    sync_all, AccessHint, BlockMapper, CachedFile, FileHandle, FlushMode, LinearMapper,
    MappedBlock, ReadaheadConfig, WriteTransaction,
};
