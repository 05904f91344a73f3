// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::deadline_iosched::{
    block::QueueStats,
    iosched::deadline::{
        tunables,
        DeadlineStats,
    },
    runtime::logging,
    Bio,
    Config,
    Direction,
    QueueConfig,
    Request,
    RequestId,
    RequestQueue,
    Tunables,
};
use ::histogram::Histogram;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Configuration file.
    config: Option<String>,
    /// Number of bios to submit.
    nr_bios: usize,
    /// Share of reads in the workload (in percent).
    read_ratio: u32,
    /// Seed of the workload generator.
    seed: u64,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    /// Default number of bios.
    const DEFAULT_NR_BIOS: usize = 100_000;
    /// Default share of reads.
    const DEFAULT_READ_RATIO: u32 = 70;
    /// Default seed.
    const DEFAULT_SEED: u64 = 42;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .about(app_about)
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the YAML file with queue limits and scheduler tunables"),
            )
            .arg(
                Arg::new("bios")
                    .long("bios")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of bios to submit"),
            )
            .arg(
                Arg::new("read-ratio")
                    .long("read-ratio")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PERCENT")
                    .help("Sets the share of reads in the workload"),
            )
            .arg(
                Arg::new("seed")
                    .long("seed")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("SEED")
                    .help("Sets the seed of the workload generator"),
            )
            .get_matches();

        let mut args: ProgramArguments = ProgramArguments {
            config: matches.get_one::<String>("config").cloned(),
            nr_bios: Self::DEFAULT_NR_BIOS,
            read_ratio: Self::DEFAULT_READ_RATIO,
            seed: Self::DEFAULT_SEED,
        };

        if let Some(nr_bios) = matches.get_one::<String>("bios") {
            args.set_nr_bios(nr_bios)?;
        }

        if let Some(read_ratio) = matches.get_one::<String>("read-ratio") {
            args.set_read_ratio(read_ratio)?;
        }

        if let Some(seed) = matches.get_one::<String>("seed") {
            args.seed = seed.parse()?;
        }

        Ok(args)
    }

    fn set_nr_bios(&mut self, nr_bios_str: &str) -> Result<()> {
        let nr_bios: usize = nr_bios_str.parse()?;
        if nr_bios > 0 {
            self.nr_bios = nr_bios;
            Ok(())
        } else {
            anyhow::bail!("invalid number of bios")
        }
    }

    fn set_read_ratio(&mut self, read_ratio_str: &str) -> Result<()> {
        let read_ratio: u32 = read_ratio_str.parse()?;
        if read_ratio <= 100 {
            self.read_ratio = read_ratio;
            Ok(())
        } else {
            anyhow::bail!("read ratio must be a percentage")
        }
    }
}

//======================================================================================================================
// Application
//======================================================================================================================

/// Simulated disk driven by a deadline-scheduled request queue.
struct Application {
    queue: RequestQueue,
    rng: SmallRng,
    nr_bios: usize,
    read_ratio: f64,
    /// Where the sequential stream of each direction continues.
    cursor: [u64; 2],
    /// Allocation time of every queued read.
    submitted: HashMap<RequestId, Instant>,
    /// Time reads spent queued, in nanoseconds.
    read_latency: Histogram,
    nr_reads: u64,
    /// Longest run of read completions while writes were queued.
    max_write_wait: usize,
}

impl Application {
    /// Sectors on the simulated disk.
    const DISK_SECTORS: u64 = 1 << 28;
    /// Chance that a bio continues its direction's sequential stream.
    const SEQUENTIAL: f64 = 0.5;
    /// Bios submitted per tick.
    const SUBMIT_PER_TICK: usize = 8;
    /// Requests completed per tick.
    const COMPLETE_PER_TICK: usize = 6;
    /// Simulated time per tick.
    const TICK: Duration = Duration::from_millis(10);

    pub fn new(args: &ProgramArguments) -> Result<Self> {
        let queue_config: QueueConfig = match &args.config {
            Some(path) => {
                let config: Config = Config::new(path)?;
                tunables::load(Tunables::from_config(&config)?)?;
                QueueConfig::from_config(&config)?
            },
            None => QueueConfig::default(),
        };
        let queue: RequestQueue = RequestQueue::new(&queue_config)?;

        println!("Queue:    {:?}", queue_config);
        println!("Tunables: {:?}", tunables::current());

        Ok(Self {
            queue,
            rng: SmallRng::seed_from_u64(args.seed),
            nr_bios: args.nr_bios,
            read_ratio: f64::from(args.read_ratio) / 100.0,
            cursor: [0, Self::DISK_SECTORS / 2],
            submitted: HashMap::new(),
            read_latency: Histogram::new(7, 64)?,
            nr_reads: 0,
            max_write_wait: 0,
        })
    }

    /// Runs the simulation until every bio has been submitted and completed.
    pub fn run(&mut self) -> Result<()> {
        let mut nr_submitted: usize = 0;
        let mut write_wait: usize = 0;
        loop {
            for _ in 0..Self::SUBMIT_PER_TICK {
                if nr_submitted == self.nr_bios {
                    break;
                }
                if !self.submit()? {
                    break;
                }
                nr_submitted += 1;
            }

            for _ in 0..Self::COMPLETE_PER_TICK {
                let writes_queued: bool = self.queue.elevator().nr_queued(Direction::Write) > 0;
                match self.complete()? {
                    Some(Direction::Read) if writes_queued => {
                        write_wait += 1;
                        self.max_write_wait = self.max_write_wait.max(write_wait);
                    },
                    Some(Direction::Write) => write_wait = 0,
                    Some(Direction::Read) => (),
                    None => break,
                }
            }

            if nr_submitted == self.nr_bios && self.queue.is_empty() {
                break;
            }
            self.queue.advance_clock_by(Self::TICK);
        }
        Ok(())
    }

    /// Submits one bio. Returns false if the free pool is exhausted.
    fn submit(&mut self) -> Result<bool> {
        let direction: Direction = if self.rng.gen_bool(self.read_ratio) {
            Direction::Read
        } else {
            Direction::Write
        };
        let nr_sectors: u64 = 8 * self.rng.gen_range(1..=4);
        let mut sector: u64 = if self.rng.gen_bool(Self::SEQUENTIAL) {
            self.cursor[direction.index()]
        } else {
            self.rng.gen_range(0..Self::DISK_SECTORS - nr_sectors)
        };
        if sector + nr_sectors > Self::DISK_SECTORS {
            sector = 0;
        }

        let allocations: u64 = self.queue.stats().allocations;
        match self.queue.make_request(Bio::new(direction, sector, nr_sectors)) {
            Ok(id) => {
                self.cursor[direction.index()] = sector + nr_sectors;
                if direction == Direction::Read {
                    let now: Instant = self.queue.now();
                    // Merged bios wait as long as the request that carries them.
                    if self.queue.stats().allocations != allocations {
                        self.submitted.insert(id, now);
                    } else {
                        self.submitted.entry(id).or_insert(now);
                    }
                }
                Ok(true)
            },
            Err(e) if e.errno == libc::EAGAIN => Ok(false),
            Err(e) => anyhow::bail!("make_request() failed: {:?}", e),
        }
    }

    /// Completes the next request, if any.
    fn complete(&mut self) -> Result<Option<Direction>> {
        let id: RequestId = match self.queue.fetch_request() {
            Some(id) => id,
            None => return Ok(None),
        };
        let request: Request = self.queue.end_request(id)?;
        if let Some(submitted) = self.submitted.remove(&id) {
            let elapsed: Duration = self.queue.now() - submitted;
            self.read_latency.increment(elapsed.as_nanos() as u64)?;
            self.nr_reads += 1;
        }
        Ok(Some(request.direction()))
    }

    /// Prints dispatch statistics.
    pub fn report(&self) -> Result<()> {
        let queue: QueueStats = self.queue.stats();
        let dd: DeadlineStats = self.queue.elevator().stats();
        println!(
            "Requests: {} allocated, {} back merges, {} front merges, {} request merges",
            queue.allocations, queue.back_merges, queue.front_merges, queue.request_merges
        );
        println!(
            "Batches:  {} read ({} expired), {} write ({} starved)",
            dd.read_batches, dd.expired_read_batches, dd.write_batches, dd.starved_write_batches
        );
        println!("Writes:   at most {} reads completed while writes waited", self.max_write_wait);

        if self.nr_reads == 0 {
            return Ok(());
        }
        println!("Reads:    {} completed", self.nr_reads);
        print_histogram(&self.read_latency)
    }
}

/// Prints read latency percentiles.
fn print_histogram(h: &Histogram) -> Result<()> {
    for (label, percentile) in [("p50", 0.50), ("p90", 0.90), ("p99", 0.99), ("p99.9", 0.999)] {
        println!(
            "{:<6}    {:?}",
            format!("{}:", label),
            Duration::from_nanos(h.percentile(percentile)?.ok_or_else(|| anyhow::anyhow!("empty histogram"))?.start())
        );
    }
    Ok(())
}

//======================================================================================================================

/// Drives the application.
fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new(
        "deadline-sim",
        "Runs a random read/write workload through a deadline-scheduled request queue.",
    )?;

    let mut app: Application = Application::new(&args)?;
    app.run()?;
    app.report()
}
