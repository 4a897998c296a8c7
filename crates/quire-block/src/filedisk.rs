//! A file-backed driver: sectors map 1:1 onto a host file.

use crate::queue::RequestQueue;
use crate::request::{IoDescriptor, IoDir};
use crate::BlockDriver;
use quire_error::{QuireError, Result};
use quire_types::SECTOR_SIZE;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A disk whose backing store is a regular file.
///
/// The file is sized to the requested capacity on open. `flush` maps to
/// `fsync` on the backing file, which is what gives the sync front end its
/// durability point.
pub struct FileDisk {
    file: File,
    capacity_sectors: u64,
}

impl FileDisk {
    pub fn open(path: &Path, capacity_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity_sectors * SECTOR_SIZE as u64)?;
        Ok(Self {
            file,
            capacity_sectors,
        })
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn transfer(&self, desc: &IoDescriptor) -> Result<()> {
        let len = desc.len_bytes();
        if desc.end_sector().0 > self.capacity_sectors {
            return Err(QuireError::DeviceIo {
                sector: desc.sector.0,
                detail: format!("{len} byte transfer past device end"),
            });
        }
        let off = desc.sector.0 * SECTOR_SIZE as u64;
        match desc.dir {
            IoDir::Read => {
                let mut buf = vec![0_u8; len];
                self.file
                    .read_exact_at(&mut buf, off)
                    .map_err(|e| QuireError::DeviceIo {
                        sector: desc.sector.0,
                        detail: e.to_string(),
                    })?;
                desc.target.copy_in(&buf);
            }
            IoDir::Write => {
                let mut buf = vec![0_u8; len];
                desc.target.copy_out(&mut buf);
                self.file
                    .write_all_at(&buf, off)
                    .map_err(|e| QuireError::DeviceIo {
                        sector: desc.sector.0,
                        detail: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }
}

impl BlockDriver for FileDisk {
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
        self.file.sync_all()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filedisk"
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
    use std::sync::Arc;

    #[test]
    fn data_survives_through_the_backing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        let driver = Arc::new(FileDisk::open(&path, 64).expect("open backing file"));
        let queue = RequestQueue::new(
            QueueConfig::default(),
            ElevatorKind::Sector,
            Arc::clone(&driver) as Arc<dyn BlockDriver>,
            Arc::new(BlockContext::new()),
        );

        let payload = vec![0x7E_u8; 2 * SECTOR_SIZE];
        let target = VecIoTarget::new(payload.clone());
        queue.submit(IoDescriptor {
            dir: IoDir::Write,
            sector: SectorNumber(10),
            nr_sectors: 2,
            flags: IoFlags::default(),
            target: Arc::clone(&target) as Arc<dyn IoTarget>,
        });
        queue.drain();
        queue.flush_device().expect("fsync backing file");

        let bytes = std::fs::read(&path).expect("read backing file");
        let off = 10 * SECTOR_SIZE;
        assert_eq!(&bytes[off..off + 2 * SECTOR_SIZE], payload.as_slice());
    }
}
