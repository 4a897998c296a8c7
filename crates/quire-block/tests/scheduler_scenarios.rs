#![forbid(unsafe_code)]
//! End-to-end scheduler scenarios: a queue over a RAM disk, exercised the
//! way the cache layers drive it.

use parking_lot::Mutex;
use quire_block::{
    BlockContext, BlockDriver, ElevatorKind, IoDescriptor, IoDir, IoFlags, IoTarget, QueueConfig,
    RamDisk, RequestQueue, UnplugDaemon, VecIoTarget,
};
use quire_types::{SectorNumber, SECTOR_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn write_desc(sector: u64, payload: Vec<u8>) -> (IoDescriptor, Arc<VecIoTarget>) {
    let target = VecIoTarget::new(payload);
    let nr = (target.len() / SECTOR_SIZE) as u32;
    (
        IoDescriptor {
            dir: IoDir::Write,
            sector: SectorNumber(sector),
            nr_sectors: nr,
            flags: IoFlags::default(),
            target: Arc::clone(&target) as Arc<dyn IoTarget>,
        },
        target,
    )
}

fn read_desc(sector: u64, nr: u32) -> (IoDescriptor, Arc<VecIoTarget>) {
    let target = VecIoTarget::new(vec![0_u8; nr as usize * SECTOR_SIZE]);
    (
        IoDescriptor {
            dir: IoDir::Read,
            sector: SectorNumber(sector),
            nr_sectors: nr,
            flags: IoFlags::default(),
            target: Arc::clone(&target) as Arc<dyn IoTarget>,
        },
        target,
    )
}

/// A driver that only drains when armed, recording dispatch order.
struct GatedDisk {
    armed: Mutex<bool>,
    order: Mutex<Vec<u64>>,
}

impl GatedDisk {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: Mutex::new(false),
            order: Mutex::new(Vec::new()),
        })
    }

    fn arm(&self) {
        *self.armed.lock() = true;
    }
}

impl BlockDriver for GatedDisk {
    fn process(&self, queue: &RequestQueue) {
        if !*self.armed.lock() {
            return;
        }
        while let Some(mut req) = queue.next_request() {
            self.order.lock().push(req.sector().0);
            let n = req.bytes_remaining();
            queue.complete(&mut req, n, &Ok(()));
        }
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

#[test]
fn adjacent_writes_reach_the_disk_as_one_request() {
    let driver = GatedDisk::new();
    driver.arm();
    let queue = RequestQueue::new(
        QueueConfig {
            unplug_thresh: 64,
            ..QueueConfig::default()
        },
        ElevatorKind::Sector,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    let mut targets = Vec::new();
    for i in 0..8_u64 {
        let (d, t) = write_desc(i * 2, vec![i as u8; 2 * SECTOR_SIZE]);
        targets.push(t);
        queue.submit(d);
    }
    queue.drain();
    for t in &targets {
        assert!(t.result().expect("write completed").is_ok());
    }
    // Sixteen contiguous sectors went down as a single dispatch.
    assert_eq!(driver.order.lock().as_slice(), &[0]);
    assert_eq!(queue.stats().back_merges, 7);
}

#[test]
fn full_pool_blocks_until_the_driver_catches_up() {
    let driver = GatedDisk::new();
    let queue = RequestQueue::new(
        QueueConfig {
            nr_requests: 4,
            unplug_thresh: 1024,
            ..QueueConfig::default()
        },
        ElevatorKind::Sector,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    // Fill the pool with non-mergeable writes; the last one trips the full
    // mark on its way in.
    for i in 0..4_u64 {
        queue.submit(write_desc(i * 100, vec![0; SECTOR_SIZE]).0);
    }
    assert_eq!(queue.slot_count(IoDir::Write), 4);

    let submitter_queue = Arc::clone(&queue);
    let handle = std::thread::spawn(move || {
        let started = Instant::now();
        let (d, t) = write_desc(2000, vec![0xEE; SECTOR_SIZE]);
        submitter_queue.submit(d);
        submitter_queue.drain();
        (started.elapsed(), t.result())
    });

    std::thread::sleep(Duration::from_millis(30));
    driver.arm();
    queue.run();

    let (waited, result) = handle.join().expect("submitter thread");
    assert!(result.expect("write completed").is_ok());
    assert!(waited >= Duration::from_millis(20), "submitter never slept");
    assert!(queue.stats().slot_waits >= 1);
}

#[test]
fn readahead_style_fail_fast_never_sleeps() {
    let driver = GatedDisk::new();
    let queue = RequestQueue::new(
        QueueConfig {
            nr_requests: 2,
            unplug_thresh: 1024,
            ..QueueConfig::default()
        },
        ElevatorKind::Sector,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    queue.submit(read_desc(0, 1).0);
    queue.submit(read_desc(100, 1).0);

    let (mut speculative, target) = read_desc(200, 1);
    speculative.flags.fail_fast = true;
    let started = Instant::now();
    queue.submit(speculative);
    assert!(started.elapsed() < Duration::from_millis(10));
    let result = target.result().expect("rejected synchronously");
    assert!(result.is_err());
}

#[test]
fn barrier_fences_lower_sectors_submitted_after_it() {
    let driver = GatedDisk::new();
    driver.arm();
    let queue = RequestQueue::new(
        QueueConfig {
            unplug_thresh: 1024,
            ..QueueConfig::default()
        },
        ElevatorKind::Sector,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    queue.submit(write_desc(64, vec![1; SECTOR_SIZE]).0);
    let (mut barrier, _bt) = write_desc(32, vec![2; SECTOR_SIZE]);
    barrier.flags.barrier = true;
    queue.submit(barrier);
    queue.submit(write_desc(0, vec![3; SECTOR_SIZE]).0);
    queue.drain();
    assert_eq!(driver.order.lock().as_slice(), &[64, 32, 0]);
}

#[test]
fn unplug_daemon_flushes_an_abandoned_plug() {
    let driver = GatedDisk::new();
    driver.arm();
    let queue = RequestQueue::new(
        QueueConfig {
            unplug_thresh: 1024,
            unplug_delay: Duration::from_millis(3),
            ..QueueConfig::default()
        },
        ElevatorKind::Sector,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    let daemon = UnplugDaemon::spawn(Arc::clone(&queue)).expect("spawn daemon");
    let (d, target) = write_desc(8, vec![0x42; SECTOR_SIZE]);
    queue.submit(d);
    // Nobody unplugs by hand; only the timer can release this write.
    let deadline = Instant::now() + Duration::from_secs(2);
    while target.result().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(target.result().expect("timer released the plug").is_ok());
    daemon.shutdown();
}

#[test]
fn deadline_elevator_round_trips_data() {
    let driver = RamDisk::new(64);
    let queue = RequestQueue::new(
        QueueConfig::default(),
        ElevatorKind::Deadline,
        Arc::clone(&driver) as Arc<dyn BlockDriver>,
        Arc::new(BlockContext::new()),
    );
    let payload = vec![0x9D_u8; 4 * SECTOR_SIZE];
    queue.submit(write_desc(16, payload.clone()).0);
    queue.drain();

    let (r, rt) = read_desc(16, 4);
    queue.submit(r);
    queue.drain();
    assert!(rt.result().expect("read completed").is_ok());
    assert_eq!(rt.contents(), payload);
}
