// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::fmt;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of transfer directions.
pub const NR_DIRECTIONS: usize = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Disk address in 512-byte units.
pub type Sector = u64;

/// Transfer direction of a bio or request.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Direction {
    Read,
    Write,
}

/// Handle to a request slot in the queue's request table.
#[derive(Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Copy, Clone)]
pub struct RequestId(usize);

/// Request flags.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct RequestFlags {
    /// Hard ordering fence: nothing may be reordered or merged across it.
    pub barrier: bool,
    /// The request has been handed to the device.
    pub started: bool,
    /// The request must never be merged with another one.
    pub no_merge: bool,
}

/// Incoming I/O descriptor, examined for merge opportunities before a request is committed.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Bio {
    direction: Direction,
    sector: Sector,
    nr_sectors: u64,
    barrier: bool,
    no_merge: bool,
}

/// A pending unit of block I/O.
#[derive(Debug, Clone)]
pub struct Request {
    direction: Direction,
    sector: Sector,
    nr_sectors: u64,
    flags: RequestFlags,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Direction {
    /// Both directions, reads first.
    pub const ALL: [Direction; NR_DIRECTIONS] = [Direction::Read, Direction::Write];

    /// Index of this direction in per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

impl Bio {
    pub fn new(direction: Direction, sector: Sector, nr_sectors: u64) -> Self {
        Self {
            direction,
            sector,
            nr_sectors,
            barrier: false,
            no_merge: false,
        }
    }

    pub fn read(sector: Sector, nr_sectors: u64) -> Self {
        Self::new(Direction::Read, sector, nr_sectors)
    }

    pub fn write(sector: Sector, nr_sectors: u64) -> Self {
        Self::new(Direction::Write, sector, nr_sectors)
    }

    /// Marks this bio as a barrier.
    pub fn with_barrier(mut self) -> Self {
        self.barrier = true;
        self
    }

    /// Keeps this bio, and the request built from it, out of every merge.
    pub fn with_no_merge(mut self) -> Self {
        self.no_merge = true;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    /// First sector past the end of this bio.
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors
    }

    pub fn is_barrier(&self) -> bool {
        self.barrier
    }

    /// Whether this bio may go into an existing request.
    pub fn is_mergeable(&self) -> bool {
        !(self.barrier || self.no_merge)
    }
}

impl Request {
    pub fn new(direction: Direction, sector: Sector, nr_sectors: u64) -> Self {
        Self {
            direction,
            sector,
            nr_sectors,
            flags: RequestFlags::default(),
        }
    }

    /// Builds a request covering exactly the range of `bio`.
    pub fn from_bio(bio: &Bio) -> Self {
        let mut request: Request = Self::new(bio.direction, bio.sector, bio.nr_sectors);
        request.flags.barrier = bio.barrier;
        request.flags.no_merge = bio.no_merge;
        request
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    /// First sector past the end of this request. This is the key of the back-merge hash.
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn is_barrier(&self) -> bool {
        self.flags.barrier
    }

    pub fn is_started(&self) -> bool {
        self.flags.started
    }

    /// Whether this request may absorb or be absorbed by other I/O.
    pub fn is_mergeable(&self) -> bool {
        !(self.flags.barrier || self.flags.started || self.flags.no_merge)
    }

    /// Whether `bio` may be merged into this request, regardless of contiguity.
    pub fn merge_ok(&self, bio: &Bio) -> bool {
        self.is_mergeable() && bio.is_mergeable() && self.direction == bio.direction
    }

    pub(crate) fn set_started(&mut self) {
        self.flags.started = true;
    }

    /// Grows this request at its tail.
    pub(crate) fn extend_back(&mut self, nr_sectors: u64) {
        self.nr_sectors += nr_sectors;
    }

    /// Grows this request at its head so that it now starts at `sector`.
    pub(crate) fn extend_front(&mut self, sector: Sector, nr_sectors: u64) {
        debug_assert_eq!(sector + nr_sectors, self.sector);
        self.sector = sector;
        self.nr_sectors += nr_sectors;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<usize> for RequestId {
    /// Converts a [usize] to a [RequestId].
    fn from(val: usize) -> Self {
        RequestId(val)
    }
}

impl From<RequestId> for usize {
    /// Converts a [RequestId] to a [usize].
    fn from(val: RequestId) -> Self {
        val.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rq#{}", self.0)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
