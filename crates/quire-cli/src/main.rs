#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use quire::{
    BlockContext, BlockDriver, BlockNumber, BlockSize, CacheContext, CachedFile, ElevatorKind,
    FileDisk, GenDisk, LinearMapper, QueueConfig, QueueStats, RamDisk, ReadaheadConfig,
    RequestQueue, SpaceStats, UnplugDaemon, PAGE_SIZE, SECTOR_SIZE,
};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Serialize)]
struct WorkloadReport {
    driver: &'static str,
    elevator: &'static str,
    pages: u64,
    bytes_written: u64,
    bytes_read: u64,
    queue: QueueStats,
    space: SpaceStats,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let remaining: Vec<String> = args.collect();
    let json = remaining.iter().any(|a| a == "--json");
    let deadline = remaining.iter().any(|a| a == "--deadline");
    let pages = flag_value(&remaining, "--pages")?.unwrap_or(64);

    match command.as_str() {
        "demo" => demo(pages, deadline, json),
        "image" => {
            let Some(path) = positional(&remaining) else {
                bail!("image requires a backing file path");
            };
            image(Path::new(path), pages, deadline, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("quire-cli\n");
    println!("USAGE:");
    println!("  quire-cli demo [--pages N] [--deadline] [--json]");
    println!("  quire-cli image <backing-file> [--pages N] [--deadline] [--json]");
}

/// First argument that is neither a flag nor the value of `--pages`.
fn positional(args: &[String]) -> Option<&String> {
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--pages" {
            skip_next = true;
            continue;
        }
        if !arg.starts_with("--") {
            return Some(arg);
        }
    }
    None
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<u64>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let Some(value) = args.get(pos + 1) else {
        bail!("{flag} requires a value");
    };
    let parsed = value
        .parse::<u64>()
        .with_context(|| format!("{flag} value must be a number, got {value:?}"))?;
    Ok(Some(parsed))
}

/// Exercise the full stack over a RAM disk.
fn demo(pages: u64, deadline: bool, json: bool) -> Result<()> {
    let capacity_sectors = (pages + 16) * (PAGE_SIZE / SECTOR_SIZE) as u64;
    let driver = RamDisk::new(capacity_sectors);
    run_workload(driver, "ramdisk", capacity_sectors, pages, deadline, json)
}

/// The same workload over a file-backed disk; data survives in the image.
fn image(path: &Path, pages: u64, deadline: bool, json: bool) -> Result<()> {
    let capacity_sectors = (pages + 16) * (PAGE_SIZE / SECTOR_SIZE) as u64;
    let driver = Arc::new(
        FileDisk::open(path, capacity_sectors)
            .with_context(|| format!("failed to open backing file {}", path.display()))?,
    );
    run_workload(driver, "filedisk", capacity_sectors, pages, deadline, json)
}

fn run_workload(
    driver: Arc<dyn BlockDriver>,
    driver_name: &'static str,
    capacity_sectors: u64,
    pages: u64,
    deadline: bool,
    json: bool,
) -> Result<()> {
    let elevator = if deadline {
        ElevatorKind::Deadline
    } else {
        ElevatorKind::Sector
    };
    let queue = RequestQueue::new(
        QueueConfig::default(),
        elevator,
        driver,
        Arc::new(BlockContext::new()),
    );
    let daemon = UnplugDaemon::spawn(Arc::clone(&queue)).context("spawn unplug daemon")?;
    let disk = Arc::new(GenDisk::new("quire0", capacity_sectors, Arc::clone(&queue)));

    let block_size = BlockSize::new(1024).context("block size")?;
    let nr_blocks = capacity_sectors * SECTOR_SIZE as u64 / u64::from(block_size.get());
    let mapper = LinearMapper::new(BlockNumber(0), nr_blocks);
    let file = CachedFile::new(
        disk,
        mapper,
        block_size,
        CacheContext::new(),
        ReadaheadConfig::default(),
    );

    info!(pages, driver = driver_name, "starting workload");
    let mut bytes_written = 0_u64;
    for i in 0..pages {
        let payload = vec![(i % 251) as u8; PAGE_SIZE];
        bytes_written += file.write(i * PAGE_SIZE as u64, &payload)? as u64;
    }
    file.fsync().context("fsync after writes")?;

    let handle = file.handle();
    let mut buf = vec![0_u8; PAGE_SIZE];
    let mut bytes_read = 0_u64;
    for i in 0..pages {
        let n = handle.read(i * PAGE_SIZE as u64, &mut buf)?;
        bytes_read += n as u64;
        if buf[..n].iter().any(|&b| b != (i % 251) as u8) {
            bail!("verification failed on page {i}");
        }
    }

    let report = WorkloadReport {
        driver: driver_name,
        elevator: if deadline { "deadline" } else { "sector" },
        pages,
        bytes_written,
        bytes_read,
        queue: queue.stats(),
        space: file.space().stats(),
    };
    daemon.shutdown();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("quire workload: {} over {}", report.elevator, report.driver);
        println!("pages:          {}", report.pages);
        println!("bytes written:  {}", report.bytes_written);
        println!("bytes read:     {}", report.bytes_read);
        println!("queued:         {}", report.queue.requests_queued);
        println!(
            "merged:         {} back, {} front, {} coalesced",
            report.queue.back_merges, report.queue.front_merges, report.queue.coalesced_merges
        );
        println!("unplugs:        {}", report.queue.unplugs);
        println!(
            "cache:          {} lookups, {} hits, {} pages created",
            report.space.lookups, report.space.hits, report.space.pages_created
        );
    }
    Ok(())
}
