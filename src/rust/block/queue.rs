// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    block::{
        request::{
            Bio,
            Request,
            RequestId,
        },
        table::RequestTable,
    },
    config::Config,
    iosched::{
        deadline::DeadlineScheduler,
        Elevator,
        InsertPoint,
        MergeType,
    },
    runtime::{
        fail::Fail,
        timer::Clock,
    },
};
use ::std::{
    collections::VecDeque,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default number of request slots per queue.
pub const DEFAULT_NR_REQUESTS: usize = 128;

/// Default largest request merging may build, in sectors.
pub const DEFAULT_MAX_SECTORS: u64 = 255;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Queue limits.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueConfig {
    /// Number of request slots in the free pool.
    pub nr_requests: usize,
    /// Largest request, in sectors, that merging may build.
    pub max_sectors: u64,
}

/// Queue state shared with the elevator.
///
/// Every elevator operation receives the context by reference from the [RequestQueue] that owns it, which stands in
/// for the queue lock: whoever holds `&mut QueueContext` has the queue to itself.
pub struct QueueContext {
    /// Requests owned by this queue, queued or in flight.
    requests: RequestTable,
    /// Requests selected by the elevator, waiting for the driver.
    dispatch: VecDeque<RequestId>,
    /// Logical clock used for expiry decisions.
    clock: Clock,
}

/// Merge statistics of a queue.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct QueueStats {
    /// Bios appended to an existing request.
    pub back_merges: u64,
    /// Bios prepended to an existing request.
    pub front_merges: u64,
    /// Requests folded into a neighbour after a bio merge closed the gap between them.
    pub request_merges: u64,
    /// Requests allocated from the free pool.
    pub allocations: u64,
}

/// Block request queue driven by an [Elevator].
pub struct RequestQueue<E: Elevator = DeadlineScheduler> {
    ctx: QueueContext,
    elevator: E,
    config: QueueConfig,
    stats: QueueStats,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl QueueConfig {
    /// Reads queue limits from a configuration object.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            nr_requests: config.nr_requests()?,
            max_sectors: config.max_sectors()?,
        })
    }
}

impl QueueContext {
    pub fn new(nr_requests: usize, now: Instant) -> Result<Self, Fail> {
        Ok(Self {
            requests: RequestTable::new(nr_requests)?,
            dispatch: VecDeque::new(),
            clock: Clock::new(now),
        })
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn advance_clock(&mut self, now: Instant) {
        self.clock.advance_clock(now);
    }

    pub fn advance_clock_by(&mut self, delta: Duration) {
        self.clock.advance_by(delta);
    }

    /// Number of request slots in the free pool. Every [RequestId] of this queue is below this bound.
    pub fn nr_requests(&self) -> usize {
        self.requests.capacity()
    }

    /// Number of request slots in use.
    pub fn nr_allocated(&self) -> usize {
        self.requests.len()
    }

    /// Looks up a request.
    pub fn get_request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id)
    }

    /// Looks up a request the caller knows to be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live request, which means the elevator and the block layer disagree about what
    /// is queued.
    pub fn request(&self, id: RequestId) -> &Request {
        match self.requests.get(id) {
            Some(request) => request,
            None => panic!("request() on stale handle {}", id),
        }
    }

    fn request_mut(&mut self, id: RequestId) -> &mut Request {
        match self.requests.get_mut(id) {
            Some(request) => request,
            None => panic!("request_mut() on stale handle {}", id),
        }
    }

    /// Allocates a request slot from the free pool.
    pub fn alloc_request(&mut self, request: Request) -> Result<RequestId, Fail> {
        self.requests.alloc(request)
    }

    /// Returns a request slot to the free pool.
    pub fn free_request(&mut self, id: RequestId) -> Option<Request> {
        self.requests.free(id)
    }

    /// First request of the dispatch queue.
    pub fn dispatch_head(&self) -> Option<RequestId> {
        self.dispatch.front().copied()
    }

    /// Appends a request to the dispatch queue.
    pub fn dispatch_push(&mut self, id: RequestId) {
        debug_assert!(self.requests.get(id).is_some());
        self.dispatch.push_back(id);
    }

    pub fn dispatch_len(&self) -> usize {
        self.dispatch.len()
    }

    pub fn dispatch_is_empty(&self) -> bool {
        self.dispatch.is_empty()
    }

    /// Requests waiting for the driver, in dispatch order.
    pub fn dispatched(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.dispatch.iter().copied()
    }

    fn dispatch_pop(&mut self) -> Option<RequestId> {
        self.dispatch.pop_front()
    }
}

impl<E: Elevator> RequestQueue<E> {
    /// Creates a queue and attaches the elevator's default instance to it.
    pub fn new(config: &QueueConfig) -> Result<Self, Fail> {
        Self::with_elevator(config, E::init)
    }

    /// Creates a queue and attaches the elevator built by `init` to it. If `init` fails, nothing is attached and the
    /// error is returned.
    pub fn with_elevator<F>(config: &QueueConfig, init: F) -> Result<Self, Fail>
    where
        F: FnOnce(&QueueContext) -> Result<E, Fail>,
    {
        let ctx: QueueContext = QueueContext::new(config.nr_requests, Instant::now())?;
        let elevator: E = match init(&ctx) {
            Ok(elevator) => elevator,
            Err(e) => {
                error!("with_elevator(): failed to attach elevator ({:?})", e);
                return Err(e);
            },
        };

        Ok(Self {
            ctx,
            elevator,
            config: *config,
            stats: QueueStats::default(),
        })
    }

    /// Submits a bio. The bio is merged into a queued request when possible, otherwise a new request is allocated
    /// for it and handed to the elevator. Returns the request that now carries the bio.
    pub fn make_request(&mut self, bio: Bio) -> Result<RequestId, Fail> {
        if bio.nr_sectors() == 0 || bio.nr_sectors() > self.config.max_sectors {
            let cause: String = format!(
                "bio size out of bounds (nr_sectors={}, max_sectors={})",
                bio.nr_sectors(),
                self.config.max_sectors
            );
            warn!("make_request(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if bio.sector().checked_add(bio.nr_sectors()).is_none() {
            let cause: String = format!("bio runs past the last sector (sector={})", bio.sector());
            warn!("make_request(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let mut insert_here: Option<InsertPoint> = None;

        // Barriers and no-merge bios are never merged, and there is nothing to merge with on an empty queue.
        if bio.is_mergeable() && !self.elevator.queue_empty(&self.ctx) {
            let (merge, at): (MergeType, Option<InsertPoint>) = self.elevator.merge(&self.ctx, &bio);
            trace!("make_request(): bio={:?} merge={:?} at={:?}", bio, merge, at);
            match merge {
                MergeType::BackMerge(id) => {
                    if self.back_merge_ok(id, &bio) {
                        self.ctx.request_mut(id).extend_back(bio.nr_sectors());
                        self.stats.back_merges += 1;
                        if !self.attempt_back_merge(id) {
                            self.elevator.merged_request(&self.ctx, id);
                        }
                        return Ok(id);
                    }
                    insert_here = Some(InsertPoint::After(id));
                },
                MergeType::FrontMerge(id) => {
                    if self.front_merge_ok(id, &bio) {
                        self.ctx.request_mut(id).extend_front(bio.sector(), bio.nr_sectors());
                        self.stats.front_merges += 1;
                        return match self.attempt_front_merge(id) {
                            Some(survivor) => Ok(survivor),
                            None => {
                                self.elevator.merged_request(&self.ctx, id);
                                Ok(id)
                            },
                        };
                    }
                    insert_here = Some(match self.elevator.former_request(&self.ctx, id) {
                        Some(prev) => InsertPoint::After(prev),
                        None => InsertPoint::Front,
                    });
                },
                MergeType::NoMerge => insert_here = at,
            }
        }

        let id: RequestId = self.ctx.alloc_request(Request::from_bio(&bio))?;
        self.stats.allocations += 1;
        self.elevator.add_request(&self.ctx, id, insert_here);
        Ok(id)
    }

    /// Returns the request the driver should process next, without taking it off the dispatch queue.
    pub fn next_request(&mut self) -> Option<RequestId> {
        self.elevator.next_request(&mut self.ctx)
    }

    /// Takes `id` off the dispatch queue and marks it started. `id` must be the request last returned by
    /// [RequestQueue::next_request].
    pub fn dequeue_request(&mut self, id: RequestId) -> Result<&Request, Fail> {
        if self.ctx.dispatch_head() != Some(id) {
            let cause: String = format!("{} is not at the head of the dispatch queue", id);
            error!("dequeue_request(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        self.ctx.dispatch_pop();
        self.elevator.remove_request(&self.ctx, id);
        self.ctx.request_mut(id).set_started();
        Ok(self.ctx.request(id))
    }

    /// Selects the next request and takes it off the dispatch queue in one step.
    pub fn fetch_request(&mut self) -> Option<RequestId> {
        let id: RequestId = self.next_request()?;
        self.ctx.dispatch_pop();
        self.elevator.remove_request(&self.ctx, id);
        self.ctx.request_mut(id).set_started();
        Some(id)
    }

    /// Completes a started request and returns its slot to the free pool.
    pub fn end_request(&mut self, id: RequestId) -> Result<Request, Fail> {
        match self.ctx.get_request(id) {
            Some(request) if request.is_started() => (),
            Some(_) => {
                let cause: String = format!("{} has not been started", id);
                error!("end_request(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
            None => {
                let cause: String = format!("{} is not allocated", id);
                error!("end_request(): {}", cause);
                return Err(Fail::new(libc::EBADF, &cause));
            },
        }

        match self.ctx.free_request(id) {
            Some(request) => Ok(request),
            None => unreachable!("request was looked up above"),
        }
    }

    /// Whether nothing is queued nor waiting for dispatch. Started requests do not count.
    pub fn is_empty(&self) -> bool {
        self.elevator.queue_empty(&self.ctx)
    }

    pub fn advance_clock(&mut self, now: Instant) {
        self.ctx.advance_clock(now);
    }

    /// Moves the queue clock forward by `delta`.
    pub fn advance_clock_by(&mut self, delta: Duration) {
        self.ctx.advance_clock_by(delta);
    }

    pub fn now(&self) -> Instant {
        self.ctx.now()
    }

    /// Looks up a request.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.ctx.get_request(id)
    }

    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    pub fn elevator(&self) -> &E {
        &self.elevator
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Detaches the elevator. Fails with `EBUSY` while requests are still queued or waiting for dispatch.
    pub fn exit(self) -> Result<(), Fail> {
        if !self.is_empty() {
            let cause: &str = "queue still holds requests";
            error!("exit(): {}", cause);
            return Err(Fail::new(libc::EBUSY, cause));
        }
        self.elevator.exit(&self.ctx);
        Ok(())
    }

    fn back_merge_ok(&self, id: RequestId, bio: &Bio) -> bool {
        let request: &Request = self.ctx.request(id);
        assert!(request.is_mergeable(), "back merge into unmergeable {}", id);
        request.end_sector() == bio.sector() && request.nr_sectors() + bio.nr_sectors() <= self.config.max_sectors
    }

    fn front_merge_ok(&self, id: RequestId, bio: &Bio) -> bool {
        let request: &Request = self.ctx.request(id);
        assert!(request.is_mergeable(), "front merge into unmergeable {}", id);
        bio.end_sector() == request.sector() && request.nr_sectors() + bio.nr_sectors() <= self.config.max_sectors
    }

    /// After `id` grew at its tail, tries to fold the request sorted right after it into it.
    fn attempt_back_merge(&mut self, id: RequestId) -> bool {
        match self.elevator.latter_request(&self.ctx, id) {
            Some(next) => self.attempt_merge(id, next),
            None => false,
        }
    }

    /// After `id` grew at its head, tries to fold it into the request sorted right before it. Returns the surviving
    /// request on success.
    fn attempt_front_merge(&mut self, id: RequestId) -> Option<RequestId> {
        let prev: RequestId = self.elevator.former_request(&self.ctx, id)?;
        if self.attempt_merge(prev, id) {
            Some(prev)
        } else {
            None
        }
    }

    /// Folds `next` into `id` if the two are contiguous and compatible.
    fn attempt_merge(&mut self, id: RequestId, next: RequestId) -> bool {
        let request: &Request = self.ctx.request(id);
        let other: &Request = self.ctx.request(next);
        if !request.is_mergeable()
            || !other.is_mergeable()
            || request.direction() != other.direction()
            || request.end_sector() != other.sector()
            || request.nr_sectors() + other.nr_sectors() > self.config.max_sectors
        {
            return false;
        }

        let nr_sectors: u64 = other.nr_sectors();
        self.ctx.request_mut(id).extend_back(nr_sectors);
        self.elevator.merge_requests(&self.ctx, id, next);
        self.elevator.remove_request(&self.ctx, next);
        self.ctx.free_request(next);
        self.stats.request_merges += 1;
        trace!("attempt_merge(): {} absorbed {}", id, next);
        true
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nr_requests: DEFAULT_NR_REQUESTS,
            max_sectors: DEFAULT_MAX_SECTORS,
        }
    }
}
