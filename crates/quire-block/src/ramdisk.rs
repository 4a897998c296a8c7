//! A memory-backed driver, used by tests and the demo CLI.

use crate::queue::RequestQueue;
use crate::request::{IoDescriptor, IoDir};
use crate::BlockDriver;
use parking_lot::Mutex;
use quire_error::{QuireError, Result};
use quire_types::SECTOR_SIZE;
use std::sync::Arc;

/// A disk made of one `Vec<u8>`.
///
/// `process` drains the queue synchronously: every pulled request is
/// transferred descriptor by descriptor and completed before the next pull,
/// so barrier ordering holds trivially.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    #[must_use]
    pub fn new(capacity_sectors: u64) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0_u8; capacity_sectors as usize * SECTOR_SIZE]),
        })
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        (self.data.lock().len() / SECTOR_SIZE) as u64
    }

    /// Raw sector contents, for inspection in tests.
    #[must_use]
    pub fn read_sector(&self, sector: u64) -> Vec<u8> {
        let data = self.data.lock();
        let off = sector as usize * SECTOR_SIZE;
        data[off..off + SECTOR_SIZE].to_vec()
    }

    fn transfer(&self, desc: &IoDescriptor) -> Result<()> {
        let len = desc.len_bytes();
        let off = desc.sector.0 as usize * SECTOR_SIZE;
        let mut data = self.data.lock();
        let end = off.checked_add(len).filter(|&e| e <= data.len());
        let Some(end) = end else {
            return Err(QuireError::DeviceIo {
                sector: desc.sector.0,
                detail: format!("{len} byte transfer past device end"),
            });
        };
        match desc.dir {
            IoDir::Read => desc.target.copy_in(&data[off..end]),
            IoDir::Write => desc.target.copy_out(&mut data[off..end]),
        }
        Ok(())
    }
}

impl BlockDriver for RamDisk {
    fn process(&self, queue: &RequestQueue) {
        while let Some(mut req) = queue.next_request() {
            loop {
                let step = match req.front() {
                    Some(desc) => {
                        let len = desc.len_bytes();
                        let status = self.transfer(desc);
                        Some((len, status))
                    }
                    None => None,
                };
                let Some((len, status)) = step else {
                    break;
                };
                if queue.complete(&mut req, len, &status) {
                    break;
                }
            }
        }
    }

    fn flush(&self) -> Result<()> {
        // Memory-backed: nothing volatile to push down.
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ramdisk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockContext;
    use crate::elevator::ElevatorKind;
    use crate::queue::QueueConfig;
    use crate::request::{IoFlags, IoTarget, VecIoTarget};
    use quire_types::SectorNumber;

    fn setup(capacity: u64) -> (Arc<RequestQueue>, Arc<RamDisk>) {
        let driver = RamDisk::new(capacity);
        let queue = RequestQueue::new(
            QueueConfig::default(),
            ElevatorKind::Sector,
            Arc::clone(&driver) as Arc<dyn BlockDriver>,
            Arc::new(BlockContext::new()),
        );
        (queue, driver)
    }

    fn desc(dir: IoDir, sector: u64, payload: Vec<u8>) -> (IoDescriptor, Arc<VecIoTarget>) {
        let nr = (payload.len() / SECTOR_SIZE) as u32;
        let target = VecIoTarget::new(payload);
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
    fn write_then_read_round_trips() {
        let (queue, _driver) = setup(16);
        let payload = vec![0xC3_u8; 2 * SECTOR_SIZE];
        let (w, wt) = desc(IoDir::Write, 4, payload.clone());
        queue.submit(w);
        queue.drain();
        assert!(wt.result().expect("write completed").is_ok());

        let (r, rt) = desc(IoDir::Read, 4, vec![0; 2 * SECTOR_SIZE]);
        queue.submit(r);
        queue.drain();
        assert!(rt.result().expect("read completed").is_ok());
        assert_eq!(rt.contents(), payload);
    }

    #[test]
    fn transfer_past_device_end_reports_device_error() {
        let (_queue, driver) = setup(4);
        let (d, _t) = desc(IoDir::Write, 3, vec![0; 2 * SECTOR_SIZE]);
        let err = driver.transfer(&d).expect_err("past end");
        assert!(matches!(err, QuireError::DeviceIo { sector: 3, .. }));
    }

    #[test]
    fn barrier_partitions_dispatch_order() {
        let (queue, driver) = setup(64);
        let (w1, _t1) = desc(IoDir::Write, 40, vec![1; SECTOR_SIZE]);
        queue.submit(w1);
        let (mut b, _tb) = desc(IoDir::Write, 20, vec![2; SECTOR_SIZE]);
        b.flags.barrier = true;
        queue.submit(b);
        // Sorts below both, but the barrier holds it back.
        let (w2, _t2) = desc(IoDir::Write, 0, vec![3; SECTOR_SIZE]);
        queue.submit(w2);
        queue.drain();
        assert_eq!(queue.stats().barriers_queued, 1);
        assert_eq!(driver.read_sector(40)[0], 1);
        assert_eq!(driver.read_sector(20)[0], 2);
        assert_eq!(driver.read_sector(0)[0], 3);
    }
}
