// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::deadline_iosched::{
    block::{
        QueueStats,
        DEFAULT_MAX_SECTORS,
    },
    iosched::deadline::DeadlineStats,
    runtime::logging,
    Bio,
    Config,
    DeadlineScheduler,
    Direction,
    Fail,
    QueueConfig,
    Request,
    RequestId,
    RequestQueue,
    Tunables,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Seed of every randomized workload, so failures replay.
const SEED: u64 = 0x5eed_dead_11e;

/// Sectors spanned by random workloads.
const DISK_SECTORS: u64 = 1 << 24;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn new_queue(config: &QueueConfig, tunables: Tunables) -> Result<RequestQueue<DeadlineScheduler>> {
    logging::initialize();
    match RequestQueue::with_elevator(config, |q| DeadlineScheduler::with_tunables(q, &tunables)) {
        Ok(q) => Ok(q),
        Err(e) => anyhow::bail!("failed to create queue: {:?}", e),
    }
}

fn random_bio(rng: &mut SmallRng, direction: Direction) -> Bio {
    let nr_sectors: u64 = rng.gen_range(1..=64);
    let sector: u64 = rng.gen_range(0..DISK_SECTORS - nr_sectors);
    Bio::new(direction, sector, nr_sectors)
}

/// Fetches and completes the next request.
fn complete_next(q: &mut RequestQueue<DeadlineScheduler>) -> Result<Option<Request>> {
    match q.fetch_request() {
        Some(id) => match q.end_request(id) {
            Ok(request) => Ok(Some(request)),
            Err(e) => anyhow::bail!("failed to complete {}: {:?}", id, e),
        },
        None => Ok(None),
    }
}

//======================================================================================================================
// test_queue_drains()
//======================================================================================================================

/// Tests that every submitted sector is dispatched exactly once and that the queue detaches cleanly afterwards.
#[test]
fn test_queue_drains() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(SEED);
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&QueueConfig::default(), Tunables::default())?;

    let mut submitted: [u64; 2] = [0; 2];
    let mut completed: [u64; 2] = [0; 2];
    for round in 0..64 {
        // Fill the pool, then drain part of it.
        loop {
            let direction: Direction = if rng.gen_bool(0.6) {
                Direction::Read
            } else {
                Direction::Write
            };
            let bio: Bio = random_bio(&mut rng, direction);
            match q.make_request(bio) {
                Ok(_) => submitted[direction.index()] += bio.nr_sectors(),
                Err(e) if e.errno == libc::EAGAIN => break,
                Err(e) => anyhow::bail!("make_request() failed: {:?}", e),
            }
        }
        for _ in 0..(round % 8) * 8 {
            if let Some(request) = complete_next(&mut q)? {
                completed[request.direction().index()] += request.nr_sectors();
            }
        }
        q.advance_clock_by(Duration::from_millis(50));
    }

    while let Some(request) = complete_next(&mut q)? {
        completed[request.direction().index()] += request.nr_sectors();
    }

    ::deadline_iosched::ensure_eq!(completed, submitted);
    ::deadline_iosched::ensure_eq!(q.is_empty(), true);
    ::deadline_iosched::ensure_eq!(q.context().nr_allocated(), 0);
    match q.exit() {
        Ok(()) => Ok(()),
        Err(e) => anyhow::bail!("exit() failed: {:?}", e),
    }
}

//======================================================================================================================
// test_writes_are_not_starved()
//======================================================================================================================

/// Tests that a steady stream of fresh reads lets at most `writes_starved` read batches through between write batches.
#[test]
fn test_writes_are_not_starved() -> Result<()> {
    let tunables: Tunables = Tunables {
        writes_starved: 3,
        ..Tunables::default()
    };
    let mut rng: SmallRng = SmallRng::seed_from_u64(SEED);
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&QueueConfig::default(), tunables)?;

    for _ in 0..8 {
        q.make_request(random_bio(&mut rng, Direction::Read))?;
    }
    for _ in 0..4 {
        q.make_request(random_bio(&mut rng, Direction::Write))?;
    }

    let mut reads_at_last_write: u64 = 0;
    let mut last: DeadlineStats = q.elevator().stats();
    for _ in 0..1000 {
        let request: Request = match complete_next(&mut q)? {
            Some(request) => request,
            None => anyhow::bail!("queue ran dry"),
        };
        // Keep both directions busy.
        q.make_request(random_bio(&mut rng, request.direction()))?;

        let stats: DeadlineStats = q.elevator().stats();
        if stats.write_batches != last.write_batches {
            reads_at_last_write = stats.read_batches;
        }
        ::deadline_iosched::ensure_eq!(
            stats.read_batches - reads_at_last_write <= u64::from(tunables.writes_starved),
            true
        );
        last = stats;
    }

    ::deadline_iosched::ensure_eq!(last.write_batches > 0, true);
    ::deadline_iosched::ensure_eq!(last.expired_read_batches, 0);
    Ok(())
}

//======================================================================================================================
// test_barrier_keeps_order()
//======================================================================================================================

/// Tests that requests queued after a barrier are dispatched after it, whatever their sector.
#[test]
fn test_barrier_keeps_order() -> Result<()> {
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&QueueConfig::default(), Tunables::default())?;
    let before: RequestId = q.make_request(Bio::write(500, 8))?;
    let barrier: RequestId = q.make_request(Bio::write(300, 8).with_barrier())?;
    let after: RequestId = q.make_request(Bio::write(100, 8))?;
    // Would back-merge into the first write, if not for the barrier.
    let fenced: RequestId = q.make_request(Bio::write(508, 8))?;
    ::deadline_iosched::ensure_neq!(fenced, before);

    let mut order: Vec<RequestId> = Vec::new();
    while let Some(request) = q.fetch_request() {
        order.push(request);
        q.end_request(request)?;
    }
    ::deadline_iosched::ensure_eq!(order, vec![before, barrier, after, fenced]);
    Ok(())
}

//======================================================================================================================
// test_merges()
//======================================================================================================================

/// Tests that sequential bios coalesce into one request up to the queue's size limit.
#[test]
fn test_merges() -> Result<()> {
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&QueueConfig::default(), Tunables::default())?;
    let first: RequestId = q.make_request(Bio::read(0, 8))?;
    for i in 1..31 {
        ::deadline_iosched::ensure_eq!(q.make_request(Bio::read(i * 8, 8))?, first);
    }
    // 248 sectors queued, the next bio would exceed the limit.
    let second: RequestId = q.make_request(Bio::read(248, 8))?;
    ::deadline_iosched::ensure_neq!(second, first);

    let stats: QueueStats = q.stats();
    ::deadline_iosched::ensure_eq!(stats.back_merges, 30);
    ::deadline_iosched::ensure_eq!(stats.allocations, 2);
    ::deadline_iosched::ensure_eq!(q.request(first).map(|rq| rq.nr_sectors()), Some(248));
    Ok(())
}

//======================================================================================================================
// test_no_merge()
//======================================================================================================================

/// Tests that a bio flagged no-merge gets a request of its own and that nothing merges into that request later.
#[test]
fn test_no_merge() -> Result<()> {
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&QueueConfig::default(), Tunables::default())?;
    let first: RequestId = q.make_request(Bio::read(0, 8))?;
    let isolated: RequestId = q.make_request(Bio::read(8, 8).with_no_merge())?;
    ::deadline_iosched::ensure_neq!(isolated, first);
    // Contiguous with the isolated request on both sides.
    let after: RequestId = q.make_request(Bio::read(16, 8))?;
    ::deadline_iosched::ensure_neq!(after, isolated);
    ::deadline_iosched::ensure_eq!(q.request(isolated).map(|rq| rq.nr_sectors()), Some(8));

    let stats: QueueStats = q.stats();
    ::deadline_iosched::ensure_eq!(stats.back_merges + stats.front_merges + stats.request_merges, 0);
    ::deadline_iosched::ensure_eq!(stats.allocations, 3);
    Ok(())
}

//======================================================================================================================
// test_errors()
//======================================================================================================================

/// Tests the errors reported by the request queue.
#[test]
fn test_errors() -> Result<()> {
    let config: QueueConfig = QueueConfig {
        nr_requests: 2,
        ..QueueConfig::default()
    };
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&config, Tunables::default())?;

    let errno = |r: Result<RequestId, Fail>| r.err().map(|e| e.errno);
    ::deadline_iosched::ensure_eq!(errno(q.make_request(Bio::read(0, 0))), Some(libc::EINVAL));
    ::deadline_iosched::ensure_eq!(
        errno(q.make_request(Bio::read(0, DEFAULT_MAX_SECTORS + 1))),
        Some(libc::EINVAL)
    );
    ::deadline_iosched::ensure_eq!(errno(q.make_request(Bio::write(u64::MAX - 4, 8))), Some(libc::EINVAL));
    ::deadline_iosched::ensure_eq!(q.context().nr_allocated(), 0);

    let a: RequestId = q.make_request(Bio::read(0, 8))?;
    let b: RequestId = q.make_request(Bio::read(1000, 8))?;
    ::deadline_iosched::ensure_eq!(errno(q.make_request(Bio::read(5000, 8))), Some(libc::EAGAIN));

    // Nothing dispatched yet.
    ::deadline_iosched::ensure_eq!(q.dequeue_request(a).err().map(|e| e.errno), Some(libc::EINVAL));
    ::deadline_iosched::ensure_eq!(q.end_request(a).err().map(|e| e.errno), Some(libc::EINVAL));

    ::deadline_iosched::ensure_eq!(q.next_request(), Some(a));
    ::deadline_iosched::ensure_eq!(q.dequeue_request(b).err().map(|e| e.errno), Some(libc::EINVAL));
    ::deadline_iosched::ensure_eq!(q.dequeue_request(a)?.is_started(), true);
    q.end_request(a)?;
    ::deadline_iosched::ensure_eq!(q.end_request(a).err().map(|e| e.errno), Some(libc::EBADF));

    match q.exit() {
        Err(e) => ::deadline_iosched::ensure_eq!(e.errno, libc::EBUSY),
        Ok(()) => anyhow::bail!("exit() succeeded with a queued request"),
    }
    Ok(())
}

//======================================================================================================================
// test_config()
//======================================================================================================================

/// Tests building a queue from a configuration file.
#[test]
fn test_config() -> Result<()> {
    let config: Config = Config::from_yaml_str(
        r#"
deadline:
  read_expire_ms: 250
  fifo_batch: 64
  seek_cost: 8
  writes_starved: 4
queue:
  nr_requests: 32
  max_sectors: 1024
"#,
    )?;
    let tunables: Tunables = Tunables::from_config(&config)?;
    let queue_config: QueueConfig = QueueConfig::from_config(&config)?;
    let mut q: RequestQueue<DeadlineScheduler> = new_queue(&queue_config, tunables)?;

    ::deadline_iosched::ensure_eq!(q.context().nr_requests(), 32);
    ::deadline_iosched::ensure_eq!(q.elevator().tunables().read_expire, Duration::from_millis(250));
    ::deadline_iosched::ensure_eq!(q.elevator().tunables().writes_starved, 4);

    // Larger requests are allowed by this queue.
    let id: RequestId = q.make_request(Bio::write(0, 512))?;
    ::deadline_iosched::ensure_eq!(q.make_request(Bio::write(512, 512))?, id);
    Ok(())
}
