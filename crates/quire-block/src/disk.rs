//! The device front end: a named disk, its partitions, and remapping.

use crate::queue::RequestQueue;
use crate::request::{IoDescriptor, IoDir};
use quire_error::QuireError;
use quire_types::SectorNumber;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A contiguous sector range of a disk, with its own transfer accounting.
#[derive(Debug)]
pub struct Partition {
    name: String,
    start: SectorNumber,
    nr_sectors: u64,
    sectors_read: AtomicU64,
    sectors_written: AtomicU64,
}

impl Partition {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn start(&self) -> SectorNumber {
        self.start
    }

    #[must_use]
    pub fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    /// Sectors transferred so far, as (read, written).
    #[must_use]
    pub fn transfer_counts(&self) -> (u64, u64) {
        (
            self.sectors_read.load(Ordering::Relaxed),
            self.sectors_written.load(Ordering::Relaxed),
        )
    }

    fn account(&self, dir: IoDir, nr_sectors: u32) {
        let counter = match dir {
            IoDir::Read => &self.sectors_read,
            IoDir::Write => &self.sectors_written,
        };
        counter.fetch_add(u64::from(nr_sectors), Ordering::Relaxed);
    }
}

/// A disk: a capacity, a queue, and zero or more partitions.
///
/// Submission is infallible in the bio style: a descriptor that falls off
/// the end of the device (or its partition) completes immediately through
/// its target's `end_io` with [`QuireError::BadRequest`].
pub struct GenDisk {
    name: String,
    capacity_sectors: u64,
    queue: Arc<RequestQueue>,
    partitions: Vec<Arc<Partition>>,
}

impl GenDisk {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity_sectors: u64, queue: Arc<RequestQueue>) -> Self {
        Self {
            name: name.into(),
            capacity_sectors,
            queue,
            partitions: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Carve out a partition. Fails if the range leaves the device or
    /// overlaps an existing partition.
    pub fn add_partition(
        &mut self,
        name: impl Into<String>,
        start: SectorNumber,
        nr_sectors: u64,
    ) -> quire_error::Result<Arc<Partition>> {
        let name = name.into();
        let end = start
            .0
            .checked_add(nr_sectors)
            .ok_or_else(|| QuireError::BadRequest(format!("partition {name} wraps sector space")))?;
        if end > self.capacity_sectors {
            return Err(QuireError::BadRequest(format!(
                "partition {name} ends at sector {end}, device has {}",
                self.capacity_sectors
            )));
        }
        for existing in &self.partitions {
            let e_start = existing.start.0;
            let e_end = e_start + existing.nr_sectors;
            if start.0 < e_end && e_start < end {
                return Err(QuireError::BadRequest(format!(
                    "partition {name} overlaps {}",
                    existing.name
                )));
            }
        }
        let part = Arc::new(Partition {
            name,
            start,
            nr_sectors,
            sectors_read: AtomicU64::new(0),
            sectors_written: AtomicU64::new(0),
        });
        self.partitions.push(Arc::clone(&part));
        Ok(part)
    }

    #[must_use]
    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// Submit a descriptor addressed in whole-device sectors.
    pub fn submit(&self, desc: IoDescriptor) {
        if desc.end_sector().0 > self.capacity_sectors {
            warn!(
                disk = %self.name,
                sector = desc.sector.0,
                nr = desc.nr_sectors,
                "descriptor past end of device"
            );
            let end = desc.end_sector().0;
            desc.target.end_io(Err(QuireError::BadRequest(format!(
                "i/o ends at sector {end}, device {} has {}",
                self.name, self.capacity_sectors
            ))));
            return;
        }
        self.queue.submit(desc);
    }

    /// Submit a descriptor addressed relative to a partition.
    ///
    /// The sector is remapped to the whole device before it reaches the
    /// queue; the partition's transfer counters are charged up front.
    pub fn submit_to_partition(&self, part: &Partition, mut desc: IoDescriptor) {
        let rel_end = desc.end_sector().0;
        if rel_end > part.nr_sectors {
            desc.target.end_io(Err(QuireError::BadRequest(format!(
                "i/o ends at sector {rel_end}, partition {} has {}",
                part.name, part.nr_sectors
            ))));
            return;
        }
        part.account(desc.dir, desc.nr_sectors);
        desc.sector = SectorNumber(part.start.0 + desc.sector.0);
        self.submit(desc);
    }
}
