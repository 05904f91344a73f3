// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadline I/O scheduler.
//!
//! Queued requests are indexed three ways:
//! - a sorted list per direction, ordered by start sector, from which batches are dispatched;
//! - a hash keyed by end sector, which answers back-merge lookups in constant time;
//! - a FIFO of reads, which tells when the oldest read has waited longer than `read_expire`.
//!
//! Dispatch favors reads. Batches run along the sorted list from either the first queued read or, once one has
//! expired, the oldest read, and end when their cost exceeds `fifo_batch`. Pending writes get a batch after
//! `writes_starved` consecutive read batches.

mod fifo;
mod hash;
mod sort;
pub mod tunables;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    block::{
        Bio,
        Direction,
        QueueContext,
        Request,
        RequestId,
        Sector,
        NR_DIRECTIONS,
    },
    iosched::{
        Elevator,
        InsertPoint,
        MergeType,
    },
    runtime::fail::Fail,
};
use ::std::time::{
    Duration,
    Instant,
};

pub use self::{
    hash::DL_HASH_SHIFT,
    sort::SortKey,
    tunables::Tunables,
};
use self::{
    fifo::ReadFifo,
    hash::{
        HashProbe,
        MergeHash,
    },
    sort::SortList,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Sectors a contiguous request may transfer per unit of batch cost.
const SECTORS_PER_COST_UNIT: u64 = 256;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling data of one request slot.
#[derive(Debug, Default, Clone)]
pub struct DeadlineRq {
    /// Position in the sorted list of the request's direction. Set while queued.
    sort_key: Option<SortKey>,
    /// Position in the read FIFO.
    fifo_pos: Option<u64>,
    /// When the read expires.
    expires: Option<Instant>,
    /// Hash generation the entry was stamped with. Zero while off the hash.
    hash_valid_count: u32,
    /// End sector the entry was hashed under.
    hash_key: Sector,
}

/// Summary of a dispatch batch.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BatchInfo {
    pub direction: Direction,
    /// Requests moved to the dispatch queue.
    pub nr_requests: usize,
    /// Cost of all moved requests.
    pub cost: u64,
    /// Cost of the last moved request.
    pub last_cost: u64,
}

/// Dispatch statistics.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct DeadlineStats {
    pub read_batches: u64,
    pub write_batches: u64,
    /// Read batches started at an expired read.
    pub expired_read_batches: u64,
    /// Write batches forced ahead of queued reads.
    pub starved_write_batches: u64,
}

/// Deadline scheduler state of one queue.
pub struct DeadlineScheduler {
    sort_list: [SortList; NR_DIRECTIONS],
    read_fifo: ReadFifo,
    hash: MergeHash,
    /// Scheduling data, indexed by [RequestId].
    rq_data: Vec<DeadlineRq>,
    /// Request the last merge went into.
    last_merge: Option<RequestId>,
    /// End sector of the request last handed to the driver.
    last_sector: Sector,
    /// Read-favoring decisions since writes were last served.
    starved: u32,

    read_expire: Duration,
    fifo_batch: u32,
    seek_cost: u32,
    writes_starved: u32,

    last_batch: Option<BatchInfo>,
    stats: DeadlineStats,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl DeadlineRq {
    /// Whether the request sits in a sorted list.
    pub fn is_queued(&self) -> bool {
        self.sort_key.is_some()
    }

    pub fn sort_key(&self) -> Option<SortKey> {
        self.sort_key
    }

    pub fn fifo_position(&self) -> Option<u64> {
        self.fifo_pos
    }

    pub fn expires(&self) -> Option<Instant> {
        self.expires
    }

    /// Whether the request sits in a hash bucket. The entry may be stale.
    pub fn is_hashed(&self) -> bool {
        self.hash_valid_count != 0
    }

    pub fn hash_generation(&self) -> u32 {
        self.hash_valid_count
    }

    /// End sector the request is hashed under.
    pub fn hash_key(&self) -> Option<Sector> {
        if self.is_hashed() {
            Some(self.hash_key)
        } else {
            None
        }
    }
}

impl DeadlineScheduler {
    /// Attaches a scheduler with explicit tunables.
    pub fn with_tunables(q: &QueueContext, tunables: &Tunables) -> Result<Self, Fail> {
        let hash: MergeHash = match MergeHash::new(DL_HASH_SHIFT) {
            Ok(hash) => hash,
            Err(e) => {
                error!("with_tunables(): failed to allocate merge hash ({:?})", e);
                return Err(e);
            },
        };

        // One entry per slot of the free pool, so that queueing never allocates.
        let nr_requests: usize = q.nr_requests();
        let mut rq_data: Vec<DeadlineRq> = Vec::new();
        if let Err(e) = rq_data.try_reserve_exact(nr_requests) {
            error!(
                "with_tunables(): failed to allocate scheduling data for {} requests ({:?})",
                nr_requests, e
            );
            return Err(Fail::from(e));
        }
        rq_data.resize_with(nr_requests, DeadlineRq::default);

        debug!("with_tunables(): nr_requests={} tunables={:?}", nr_requests, tunables);
        Ok(Self {
            sort_list: [SortList::default(), SortList::default()],
            read_fifo: ReadFifo::default(),
            hash,
            rq_data,
            last_merge: None,
            last_sector: 0,
            starved: 0,
            read_expire: tunables.read_expire,
            fifo_batch: tunables.fifo_batch,
            seek_cost: tunables.seek_cost,
            writes_starved: tunables.writes_starved,
            last_batch: None,
            stats: DeadlineStats::default(),
        })
    }

    /// Scheduling data of a request slot.
    pub fn rq_data(&self, id: RequestId) -> Option<&DeadlineRq> {
        self.rq_data.get(usize::from(id))
    }

    /// Queued requests of one direction, in dispatch order.
    pub fn sorted(&self, direction: Direction) -> impl DoubleEndedIterator<Item = RequestId> + '_ {
        self.sort_list[direction.index()].iter()
    }

    /// Number of requests queued in one direction.
    pub fn nr_queued(&self, direction: Direction) -> usize {
        self.sort_list[direction.index()].len()
    }

    /// Queued reads, oldest first.
    pub fn fifo(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.read_fifo.iter()
    }

    /// Number of requests in the merge hash, stale ones included.
    pub fn nr_hashed(&self) -> usize {
        self.hash.len()
    }

    /// Whether `id` can be found by a back-merge lookup right now.
    pub fn is_hash_live(&self, id: RequestId) -> bool {
        let drq: &DeadlineRq = self.drq(id);
        drq.hash_valid_count == self.hash.generation() && self.hash.contains(id, drq.hash_key)
    }

    /// Bucket `id` is hashed into.
    pub fn hash_bucket(&self, id: RequestId) -> Option<usize> {
        self.drq(id).hash_key().map(|key| self.hash.bucket_of(key))
    }

    pub fn hash_generation(&self) -> u32 {
        self.hash.generation()
    }

    pub fn last_merge(&self) -> Option<RequestId> {
        self.last_merge
    }

    pub fn last_sector(&self) -> Sector {
        self.last_sector
    }

    /// Read-favoring decisions taken since writes were last served.
    pub fn starved(&self) -> u32 {
        self.starved
    }

    pub fn tunables(&self) -> Tunables {
        Tunables {
            read_expire: self.read_expire,
            fifo_batch: self.fifo_batch,
            seek_cost: self.seek_cost,
            writes_starved: self.writes_starved,
        }
    }

    /// The batch most recently moved to the dispatch queue.
    pub fn last_batch(&self) -> Option<BatchInfo> {
        self.last_batch
    }

    pub fn stats(&self) -> DeadlineStats {
        self.stats
    }

    fn drq(&self, id: RequestId) -> &DeadlineRq {
        &self.rq_data[usize::from(id)]
    }

    fn drq_mut(&mut self, id: RequestId) -> &mut DeadlineRq {
        &mut self.rq_data[usize::from(id)]
    }

    fn add_rq_hash(&mut self, q: &QueueContext, id: RequestId) {
        let key: Sector = q.request(id).end_sector();
        let generation: u32 = self.hash.generation();
        let drq: &mut DeadlineRq = &mut self.rq_data[usize::from(id)];
        assert!(!drq.is_hashed(), "{} is already hashed", id);
        drq.hash_valid_count = generation;
        drq.hash_key = key;
        self.hash.insert(id, key);
    }

    fn del_rq_hash(&mut self, id: RequestId) {
        let drq: &mut DeadlineRq = &mut self.rq_data[usize::from(id)];
        if drq.is_hashed() {
            drq.hash_valid_count = 0;
            let removed: bool = self.hash.remove(id, drq.hash_key);
            debug_assert!(removed, "{} missing from its hash bucket", id);
        }
    }

    /// Finds a live request ending at `offset`, purging stale entries on the way.
    fn find_hash(&mut self, q: &QueueContext, offset: Sector) -> Option<RequestId> {
        let generation: u32 = self.hash.generation();
        let rq_data: &mut Vec<DeadlineRq> = &mut self.rq_data;
        self.hash.find(offset, |id| {
            let drq: &mut DeadlineRq = &mut rq_data[usize::from(id)];
            let request: &Request = q.request(id);
            assert!(drq.is_hashed(), "{} in a hash bucket without a stamp", id);
            if !request.is_mergeable() || drq.hash_valid_count != generation {
                drq.hash_valid_count = 0;
                return HashProbe::Stale;
            }
            if request.end_sector() == offset {
                HashProbe::Hit
            } else {
                HashProbe::Miss
            }
        })
    }

    fn del_rq_fifo(&mut self, id: RequestId) {
        if let Some(pos) = self.drq_mut(id).fifo_pos.take() {
            let removed: Option<RequestId> = self.read_fifo.remove(pos);
            debug_assert_eq!(removed, Some(id));
        }
    }

    fn del_rq_sort(&mut self, q: &QueueContext, id: RequestId) {
        if let Some(key) = self.drq_mut(id).sort_key.take() {
            let dir: usize = q.request(id).direction().index();
            let removed: Option<RequestId> = self.sort_list[dir].remove(key);
            debug_assert_eq!(removed, Some(id));
        }
    }

    /// Whether the oldest read has waited past its deadline.
    fn check_fifo(&self, now: Instant) -> Option<RequestId> {
        let id: RequestId = self.read_fifo.front()?;
        match self.drq(id).expires {
            Some(expires) if now > expires => Some(id),
            _ => None,
        }
    }

    /// Decides whether pending writes have waited for too many read batches. Otherwise, counts one more read batch
    /// going ahead of them.
    fn check_starved(&mut self, writes_pending: bool) -> bool {
        if !writes_pending {
            return false;
        }
        if self.starved >= self.writes_starved {
            return true;
        }
        self.starved += 1;
        false
    }

    /// Takes a request off every scheduler list and appends it to the dispatch queue.
    fn move_to_dispatch(&mut self, q: &mut QueueContext, id: RequestId) {
        self.del_rq_hash(id);
        self.del_rq_fifo(id);
        self.del_rq_sort(q, id);
        if self.last_merge == Some(id) {
            self.last_merge = None;
        }
        q.dispatch_push(id);
    }

    /// Moves a batch to the dispatch queue, walking the sorted list forward from `first`.
    fn move_requests(&mut self, q: &mut QueueContext, first: RequestId) -> BatchInfo {
        let direction: Direction = q.request(first).direction();
        let fifo_batch: u64 = u64::from(self.fifo_batch);
        let mut last_sec: Sector = self.last_sector;
        let mut batch: BatchInfo = BatchInfo {
            direction,
            nr_requests: 0,
            cost: 0,
            last_cost: 0,
        };

        let mut id: RequestId = first;
        loop {
            let next: Option<RequestId> = self.latter_request(q, id);
            let request: &Request = q.request(id);
            // Sequential transfers are charged by size, anything else pays a seek.
            let cost: u64 = if request.sector() == last_sec {
                request.nr_sectors().div_ceil(SECTORS_PER_COST_UNIT)
            } else {
                u64::from(self.seek_cost)
            };
            last_sec = request.end_sector();

            self.move_to_dispatch(q, id);
            batch.nr_requests += 1;
            batch.cost += cost;
            batch.last_cost = cost;

            match next {
                Some(next) if batch.cost <= fifo_batch => id = next,
                _ => break,
            }
        }

        trace!("move_requests(): {:?}", batch);
        self.last_batch = Some(batch);
        batch
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Elevator for DeadlineScheduler {
    /// Attaches a scheduler configured with the process-wide tunables.
    fn init(q: &QueueContext) -> Result<Self, Fail> {
        Self::with_tunables(q, &tunables::current())
    }

    fn merge(&mut self, q: &QueueContext, bio: &Bio) -> (MergeType, Option<InsertPoint>) {
        // Try the last merge first, it is the likeliest target and spares a hash lookup.
        if let Some(last) = self.last_merge {
            let request: &Request = q.request(last);
            if !request.is_mergeable() {
                self.last_merge = None;
            } else {
                let merge: MergeType = try_merge(last, request, bio);
                if merge != MergeType::NoMerge {
                    trace!("merge(): bio={:?} last merge {:?}", bio, merge);
                    return (merge, None);
                }
            }
        }

        // Back merges are answered by the hash.
        if let Some(id) = self.find_hash(q, bio.sector()) {
            let request: &Request = q.request(id);
            assert_eq!(request.end_sector(), bio.sector());
            if request.merge_ok(bio) {
                trace!("merge(): bio={:?} hash hit {}", bio, id);
                return (MergeType::BackMerge(id), None);
            }
        }

        // Scan from the back for a front merge or an insertion point. The scan quits at the first slot that fits,
        // which may cost a front merge further down the list.
        let sort_list: &SortList = &self.sort_list[bio.direction().index()];
        let mut insert: Option<InsertPoint> = None;
        let mut fenced: bool = false;
        let mut next: Option<&Request> = None;
        for id in sort_list.iter().rev() {
            let request: &Request = q.request(id);
            assert!(!request.is_started(), "started {} found on sort list", id);

            if let Some(next) = next {
                if bio.sector() > request.sector() && bio.sector() < next.sector() {
                    insert = Some(InsertPoint::After(id));
                    break;
                }
            }

            if request.is_barrier() {
                fenced = true;
                break;
            }

            if request.sector().checked_sub(bio.nr_sectors()) == Some(bio.sector()) {
                let merge: MergeType = try_merge(id, request, bio);
                if merge != MergeType::NoMerge {
                    trace!("merge(): bio={:?} scan {:?}", bio, merge);
                    return (merge, None);
                }
            }

            next = Some(request);
        }

        // Nothing found, see if the bio goes ahead of the whole list.
        if insert.is_none() && !fenced {
            if let Some(first) = sort_list.first() {
                if bio.end_sector() < q.request(first).sector() && bio.sector() > self.last_sector {
                    insert = Some(InsertPoint::Front);
                }
            }
        }

        trace!("merge(): bio={:?} no merge, insert at {:?}", bio, insert);
        (MergeType::NoMerge, insert)
    }

    fn merged_request(&mut self, q: &QueueContext, rq: RequestId) {
        trace!("merged_request(): {}", rq);
        // The hash key is the end sector, which a merge always moves.
        self.del_rq_hash(rq);
        self.add_rq_hash(q, rq);

        let request: &Request = q.request(rq);
        if let Some(key) = self.drq(rq).sort_key {
            if key.sector() != request.sector() {
                let dir: usize = request.direction().index();
                let new_key: SortKey = self.sort_list[dir].reposition(key, request.sector());
                self.drq_mut(rq).sort_key = Some(new_key);
            }
        }

        self.last_merge = Some(rq);
    }

    fn merge_requests(&mut self, q: &QueueContext, rq: RequestId, next: RequestId) {
        trace!("merge_requests(): {} absorbs {}", rq, next);
        assert!(self.drq(rq).is_queued(), "merge into {} which is not queued", rq);
        assert!(self.drq(next).is_queued(), "merge of {} which is not queued", next);

        self.del_rq_hash(rq);
        if q.request(rq).is_mergeable() {
            self.add_rq_hash(q, rq);
        }

        // If next expires first, rq inherits its deadline and its place in the fifo.
        let (drq, dnext): (&DeadlineRq, &DeadlineRq) = (self.drq(rq), self.drq(next));
        if let (Some(pos), Some(next_pos)) = (drq.fifo_pos, dnext.fifo_pos) {
            if dnext.expires < drq.expires {
                let expires: Option<Instant> = dnext.expires;
                self.read_fifo.remove(pos);
                let displaced: Option<RequestId> = self.read_fifo.replace(next_pos, rq);
                debug_assert_eq!(displaced, Some(next));
                self.drq_mut(next).fifo_pos = None;
                let drq: &mut DeadlineRq = self.drq_mut(rq);
                drq.fifo_pos = Some(next_pos);
                drq.expires = expires;
            }
        }

        self.del_rq_hash(next);
        self.del_rq_fifo(next);
        self.del_rq_sort(q, next);
        if self.last_merge == Some(next) {
            self.last_merge = None;
        }
    }

    fn add_request(&mut self, q: &QueueContext, rq: RequestId, at: Option<InsertPoint>) {
        let request: &Request = q.request(rq);
        let direction: Direction = request.direction();
        trace!("add_request(): {} {:?} at={:?}", rq, request, at);
        assert!(!self.drq(rq).is_queued(), "{} is already queued", rq);
        if let Some(InsertPoint::After(prev)) = at {
            debug_assert!(
                self.drq(prev).is_queued() && q.request(prev).direction() == direction,
                "insertion point {} is not queued",
                prev
            );
        }

        // Nothing may merge across a barrier.
        if request.is_barrier() {
            self.hash.invalidate();
            self.last_merge = None;
        }

        let key: SortKey = self.sort_list[direction.index()].insert(rq, request.sector(), request.is_barrier());
        self.drq_mut(rq).sort_key = Some(key);

        if request.is_mergeable() {
            self.add_rq_hash(q, rq);
            if self.last_merge.is_none() {
                self.last_merge = Some(rq);
            }
        }

        let expires: Option<Instant> = match direction {
            Direction::Read => {
                let pos: u64 = self.read_fifo.push_back(rq);
                self.drq_mut(rq).fifo_pos = Some(pos);
                Some(q.now() + self.read_expire)
            },
            Direction::Write => None,
        };
        self.drq_mut(rq).expires = expires;
    }

    fn remove_request(&mut self, _q: &QueueContext, rq: RequestId) {
        trace!("remove_request(): {}", rq);
        self.del_rq_fifo(rq);
        self.del_rq_hash(rq);
        if self.last_merge == Some(rq) {
            self.last_merge = None;
        }
    }

    fn next_request(&mut self, q: &mut QueueContext) -> Option<RequestId> {
        // Drain the current batch first.
        if let Some(id) = q.dispatch_head() {
            self.last_sector = q.request(id).end_sector();
            return Some(id);
        }

        let writes: bool = !self.sort_list[Direction::Write.index()].is_empty();
        let first_write: Option<RequestId> = self.sort_list[Direction::Write.index()].first();

        let first: RequestId = if let Some(expired) = self.check_fifo(q.now()) {
            if self.check_starved(writes) {
                self.stats.starved_write_batches += 1;
                first_write?
            } else {
                self.stats.expired_read_batches += 1;
                expired
            }
        } else if let Some(first_read) = self.sort_list[Direction::Read.index()].first() {
            // Keep a running read stream going rather than wait for its deadline.
            if self.check_starved(writes) {
                self.stats.starved_write_batches += 1;
                first_write?
            } else {
                first_read
            }
        } else if let Some(first_write) = first_write {
            first_write
        } else {
            assert!(self.read_fifo.is_empty(), "reads in fifo but not on sort list");
            return None;
        };

        let batch: BatchInfo = self.move_requests(q, first);
        match batch.direction {
            Direction::Read => self.stats.read_batches += 1,
            Direction::Write => {
                if self.starved > 0 {
                    debug!("next_request(): writes served after {} read batches", self.starved);
                }
                self.starved = 0;
                self.stats.write_batches += 1;
            },
        }

        let id: RequestId = q.dispatch_head()?;
        self.last_sector = q.request(id).end_sector();
        Some(id)
    }

    fn queue_empty(&self, q: &QueueContext) -> bool {
        if !q.dispatch_is_empty() || self.sort_list.iter().any(|list| !list.is_empty()) {
            return false;
        }
        assert!(
            self.read_fifo.is_empty(),
            "{} reads in fifo on an empty queue",
            self.read_fifo.len()
        );
        true
    }

    fn former_request(&self, q: &QueueContext, rq: RequestId) -> Option<RequestId> {
        let key: SortKey = self.drq(rq).sort_key?;
        self.sort_list[q.request(rq).direction().index()].prev(key)
    }

    fn latter_request(&self, q: &QueueContext, rq: RequestId) -> Option<RequestId> {
        let key: SortKey = self.drq(rq).sort_key?;
        self.sort_list[q.request(rq).direction().index()].next(key)
    }

    fn exit(self, q: &QueueContext) {
        assert!(q.dispatch_is_empty(), "exit() with requests waiting for dispatch");
        assert!(self.read_fifo.is_empty(), "exit() with reads in fifo");
        for direction in Direction::ALL {
            assert!(
                self.sort_list[direction.index()].is_empty(),
                "exit() with queued {} requests",
                direction
            );
        }
        assert!(self.hash.is_empty(), "exit() with {} hashed requests", self.hash.len());

        let DeadlineScheduler { rq_data, hash, .. } = self;
        debug!("exit(): releasing scheduling data of {} requests", rq_data.len());
        drop(rq_data);
        drop(hash);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Checks whether `bio` is contiguous with `request` on either side.
fn try_merge(id: RequestId, request: &Request, bio: &Bio) -> MergeType {
    if !request.merge_ok(bio) {
        return MergeType::NoMerge;
    }
    if request.end_sector() == bio.sector() {
        MergeType::BackMerge(id)
    } else if request.sector().checked_sub(bio.nr_sectors()) == Some(bio.sector()) {
        MergeType::FrontMerge(id)
    } else {
        MergeType::NoMerge
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        BatchInfo,
        DeadlineScheduler,
        Tunables,
    };
    use crate::{
        block::{
            Bio,
            Direction,
            QueueConfig,
            QueueContext,
            Request,
            RequestId,
            RequestQueue,
            Sector,
            DEFAULT_NR_REQUESTS,
        },
        iosched::{
            Elevator,
            InsertPoint,
            MergeType,
        },
        runtime::fail::Fail,
    };
    use ::anyhow::Result;
    use ::rand::{
        rngs::SmallRng,
        Rng,
        SeedableRng,
    };
    use ::std::time::{
        Duration,
        Instant,
    };

    fn attach(tunables: Tunables) -> Result<(QueueContext, DeadlineScheduler)> {
        let q: QueueContext = QueueContext::new(DEFAULT_NR_REQUESTS, Instant::now())?;
        let dd: DeadlineScheduler = DeadlineScheduler::with_tunables(&q, &tunables)?;
        Ok((q, dd))
    }

    fn add(q: &mut QueueContext, dd: &mut DeadlineScheduler, bio: Bio) -> Result<RequestId> {
        let id: RequestId = q.alloc_request(Request::from_bio(&bio))?;
        dd.add_request(q, id, None);
        Ok(id)
    }

    fn queue(tunables: Tunables) -> Result<RequestQueue<DeadlineScheduler>> {
        let q: RequestQueue<DeadlineScheduler> =
            RequestQueue::with_elevator(&QueueConfig::default(), |q| DeadlineScheduler::with_tunables(q, &tunables))?;
        Ok(q)
    }

    #[test]
    fn bio_after_read_is_back_merged() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        let r1: RequestId = add(&mut q, &mut dd, Bio::read(100, 8))?;
        crate::ensure_eq!(dd.last_merge(), Some(r1));
        crate::ensure_eq!(dd.merge(&q, &Bio::read(108, 8)), (MergeType::BackMerge(r1), None));

        // Same answer from the hash alone.
        dd.last_merge = None;
        crate::ensure_eq!(dd.merge(&q, &Bio::read(108, 8)), (MergeType::BackMerge(r1), None));
        crate::ensure_eq!(dd.merge(&q, &Bio::write(108, 8)).0, MergeType::NoMerge);
        Ok(())
    }

    #[test]
    fn nothing_merges_across_barrier() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        let w: RequestId = add(&mut q, &mut dd, Bio::write(100, 8))?;
        let generation: u32 = dd.hash_generation();
        add(&mut q, &mut dd, Bio::write(200, 8).with_barrier())?;
        add(&mut q, &mut dd, Bio::write(300, 8))?;
        crate::ensure_neq!(dd.hash_generation(), generation);
        crate::ensure_eq!(dd.is_hash_live(w), false);

        crate::ensure_eq!(dd.merge(&q, &Bio::write(108, 8)), (MergeType::NoMerge, None));
        // The lookup dropped the stale entry.
        crate::ensure_eq!(dd.rq_data(w).map(|drq| drq.is_hashed()), Some(false));
        crate::ensure_eq!(dd.nr_hashed(), 1);
        Ok(())
    }

    #[test]
    fn barrier_stops_front_merge_scan() -> Result<()> {
        // The barrier sits at the back of the list, so the scan meets it before the request it could front merge.
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        add(&mut q, &mut dd, Bio::write(108, 8))?;
        add(&mut q, &mut dd, Bio::write(500, 8).with_barrier())?;
        crate::ensure_eq!(dd.merge(&q, &Bio::write(100, 8)), (MergeType::NoMerge, None));

        // Ahead of the whole list, the bio would go to the front.
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        add(&mut q, &mut dd, Bio::write(1000, 8))?;
        crate::ensure_eq!(
            dd.merge(&q, &Bio::write(100, 8)),
            (MergeType::NoMerge, Some(InsertPoint::Front))
        );

        // Unless a barrier fences the list.
        add(&mut q, &mut dd, Bio::write(2000, 8).with_barrier())?;
        crate::ensure_eq!(dd.merge(&q, &Bio::write(100, 8)), (MergeType::NoMerge, None));
        Ok(())
    }

    #[test]
    fn add_then_remove_restores_lookup_state() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        add(&mut q, &mut dd, Bio::read(0, 8))?;
        let hashed: usize = dd.nr_hashed();
        let fifo: Vec<RequestId> = dd.fifo().collect();

        let id: RequestId = add(&mut q, &mut dd, Bio::read(4096, 8))?;
        crate::ensure_eq!(dd.nr_hashed(), hashed + 1);
        dd.remove_request(&q, id);
        crate::ensure_eq!(dd.nr_hashed(), hashed);
        crate::ensure_eq!(dd.fifo().collect::<Vec<RequestId>>(), fifo);
        crate::ensure_eq!(dd.rq_data(id).map(|drq| drq.fifo_position()), Some(None));
        crate::ensure_neq!(dd.last_merge(), Some(id));
        Ok(())
    }

    #[test]
    fn repeated_merged_keeps_bucket() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        let id: RequestId = add(&mut q, &mut dd, Bio::write(777, 9))?;
        let bucket: Option<usize> = dd.hash_bucket(id);
        crate::ensure_eq!(bucket.is_some(), true);
        for _ in 0..3 {
            dd.merged_request(&q, id);
            crate::ensure_eq!(dd.hash_bucket(id), bucket);
            crate::ensure_eq!(dd.nr_hashed(), 1);
            crate::ensure_eq!(dd.is_hash_live(id), true);
        }
        Ok(())
    }

    #[test]
    fn front_merge_moves_sort_position() -> Result<()> {
        let mut q: RequestQueue<DeadlineScheduler> = queue(Tunables::default())?;
        let low: RequestId = q.make_request(Bio::write(50, 8))?;
        let id: RequestId = q.make_request(Bio::write(100, 8))?;
        crate::ensure_eq!(q.make_request(Bio::write(92, 8))?, id);

        let sector: Option<Sector> = q.elevator().rq_data(id).and_then(|drq| drq.sort_key()).map(|key| key.sector());
        crate::ensure_eq!(sector, Some(92));
        crate::ensure_eq!(q.elevator().sorted(Direction::Write).collect::<Vec<RequestId>>(), vec![low, id]);
        crate::ensure_eq!(q.stats().front_merges, 1);
        Ok(())
    }

    #[test]
    fn insertion_point_follows_sector_order() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        let high: RequestId = add(&mut q, &mut dd, Bio::write(1000, 8))?;
        crate::ensure_eq!(
            dd.merge(&q, &Bio::write(100, 8)),
            (MergeType::NoMerge, Some(InsertPoint::Front))
        );

        let low: RequestId = add(&mut q, &mut dd, Bio::write(100, 8))?;
        crate::ensure_eq!(
            dd.merge(&q, &Bio::write(500, 8)),
            (MergeType::NoMerge, Some(InsertPoint::After(low)))
        );
        crate::ensure_eq!(dd.latter_request(&q, low), Some(high));
        crate::ensure_eq!(dd.former_request(&q, high), Some(low));
        crate::ensure_eq!(dd.former_request(&q, low), None);
        Ok(())
    }

    #[test]
    fn starved_write_is_served() -> Result<()> {
        let tunables: Tunables = Tunables {
            writes_starved: 2,
            ..Tunables::default()
        };
        let mut q: RequestQueue<DeadlineScheduler> = queue(tunables)?;
        let w1: RequestId = q.make_request(Bio::write(10_000, 8))?;

        for i in 0..2 {
            let r: RequestId = q.make_request(Bio::read(i * 1000, 8))?;
            crate::ensure_eq!(q.fetch_request(), Some(r));
            crate::ensure_eq!(q.elevator().starved(), (i + 1) as u32);
            q.end_request(r)?;
        }

        q.make_request(Bio::read(5000, 8))?;
        crate::ensure_eq!(q.fetch_request(), Some(w1));
        crate::ensure_eq!(q.elevator().starved(), 0);
        crate::ensure_eq!(q.elevator().stats().starved_write_batches, 1);
        Ok(())
    }

    #[test]
    fn expired_read_goes_first() -> Result<()> {
        let mut q: RequestQueue<DeadlineScheduler> = queue(Tunables::default())?;
        let old: RequestId = q.make_request(Bio::read(5000, 8))?;
        q.advance_clock_by(Duration::from_millis(600));
        let fresh: RequestId = q.make_request(Bio::read(100, 8))?;

        crate::ensure_eq!(q.fetch_request(), Some(old));
        crate::ensure_eq!(q.elevator().stats().expired_read_batches, 1);
        crate::ensure_eq!(q.fetch_request(), Some(fresh));
        Ok(())
    }

    #[test]
    fn read_at_its_deadline_is_not_expired() -> Result<()> {
        let mut q: RequestQueue<DeadlineScheduler> = queue(Tunables::default())?;
        let old: RequestId = q.make_request(Bio::read(5000, 8))?;
        q.advance_clock_by(Tunables::default().read_expire);
        let fresh: RequestId = q.make_request(Bio::read(100, 8))?;

        // Sector order, not arrival order.
        crate::ensure_eq!(q.fetch_request(), Some(fresh));
        crate::ensure_eq!(q.elevator().stats().expired_read_batches, 0);
        crate::ensure_eq!(q.fetch_request(), Some(old));
        Ok(())
    }

    #[test]
    fn batch_stops_past_cost_budget() -> Result<()> {
        let tunables: Tunables = Tunables {
            fifo_batch: 32,
            seek_cost: 16,
            ..Tunables::default()
        };
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(tunables)?;
        for sector in [0, 100, 200, 300, 400] {
            add(&mut q, &mut dd, Bio::write(sector, 8))?;
        }

        crate::ensure_eq!(dd.next_request(&mut q).is_some(), true);
        // First request continues sector 0, the others seek.
        let batch: Option<BatchInfo> = dd.last_batch();
        crate::ensure_eq!(
            batch,
            Some(BatchInfo {
                direction: Direction::Write,
                nr_requests: 3,
                cost: 33,
                last_cost: 16,
            })
        );
        crate::ensure_eq!(q.dispatch_len(), 3);
        crate::ensure_eq!(dd.nr_queued(Direction::Write), 2);
        Ok(())
    }

    #[test]
    fn sorted_lists_stay_ordered() -> Result<()> {
        let mut rng: SmallRng = SmallRng::seed_from_u64(42);
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        let mut reads: Vec<RequestId> = Vec::new();

        for _ in 0..DEFAULT_NR_REQUESTS {
            let sector: Sector = rng.gen_range(0..1 << 20);
            let nr_sectors: u64 = rng.gen_range(1..64);
            let bio: Bio = if rng.gen_bool(0.5) {
                Bio::read(sector, nr_sectors)
            } else {
                Bio::write(sector, nr_sectors)
            };
            let id: RequestId = add(&mut q, &mut dd, bio)?;
            if bio.direction() == Direction::Read {
                reads.push(id);
            }

            for direction in Direction::ALL {
                let sectors: Vec<Sector> = dd.sorted(direction).map(|id| q.request(id).sector()).collect();
                crate::ensure_eq!(sectors.windows(2).all(|w| w[0] <= w[1]), true);
            }
        }
        crate::ensure_eq!(dd.fifo().collect::<Vec<RequestId>>(), reads);
        Ok(())
    }

    #[test]
    fn queue_empty_tracks_dispatch() -> Result<()> {
        let (mut q, mut dd): (QueueContext, DeadlineScheduler) = attach(Tunables::default())?;
        crate::ensure_eq!(dd.queue_empty(&q), true);
        let id: RequestId = add(&mut q, &mut dd, Bio::read(64, 8))?;
        crate::ensure_eq!(dd.queue_empty(&q), false);
        crate::ensure_eq!(dd.next_request(&mut q), Some(id));
        crate::ensure_eq!(dd.nr_queued(Direction::Read), 0);
        crate::ensure_eq!(dd.queue_empty(&q), false);
        Ok(())
    }

    #[test]
    fn absorbed_read_hands_over_deadline() -> Result<()> {
        let mut q: RequestQueue<DeadlineScheduler> = queue(Tunables::default())?;
        let t0: Instant = q.now();
        let b: RequestId = q.make_request(Bio::read(116, 8))?;
        q.advance_clock_by(Duration::from_millis(100));
        let a: RequestId = q.make_request(Bio::read(100, 8))?;

        // Fills the gap: b grows at its head and is then folded into a.
        crate::ensure_eq!(q.make_request(Bio::read(108, 8))?, a);
        crate::ensure_eq!(q.request(b).is_none(), true);
        crate::ensure_eq!(q.request(a).map(|rq| (rq.sector(), rq.nr_sectors())), Some((100, 24)));
        crate::ensure_eq!(q.elevator().fifo().collect::<Vec<RequestId>>(), vec![a]);
        crate::ensure_eq!(
            q.elevator().rq_data(a).and_then(|drq| drq.expires()),
            Some(t0 + Duration::from_millis(500))
        );
        crate::ensure_eq!(q.elevator().is_hash_live(a), true);
        crate::ensure_eq!(q.stats().request_merges, 1);
        Ok(())
    }

    #[test]
    fn attach_fails_without_memory() -> Result<()> {
        let q: QueueContext = QueueContext::new(usize::MAX, Instant::now())?;
        match DeadlineScheduler::with_tunables(&q, &Tunables::default()) {
            Err(e) => crate::ensure_eq!(e.errno, libc::ENOMEM),
            Ok(_) => anyhow::bail!("attached with usize::MAX request slots"),
        }

        let config: QueueConfig = QueueConfig {
            nr_requests: usize::MAX,
            ..QueueConfig::default()
        };
        let e: Fail = match RequestQueue::<DeadlineScheduler>::new(&config) {
            Err(e) => e,
            Ok(_) => anyhow::bail!("queue created with usize::MAX request slots"),
        };
        crate::ensure_eq!(e.errno, libc::ENOMEM);
        Ok(())
    }
}
