// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! I/O schedulers ("elevators").
//!
//! An elevator decides in which order the queued requests of a block device are handed to the driver. The block
//! layer ([crate::block::RequestQueue]) calls into the elevator with exclusive access to its [QueueContext] for every
//! operation, so elevators do no locking of their own.

pub mod deadline;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    block::{
        Bio,
        QueueContext,
        RequestId,
    },
    runtime::fail::Fail,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of a merge lookup for an incoming bio.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MergeType {
    /// The bio must go into a new request.
    NoMerge,
    /// The bio ends where the given request starts.
    FrontMerge(RequestId),
    /// The bio starts where the given request ends.
    BackMerge(RequestId),
}

/// Where a new request is expected to land in its direction's sorted list.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum InsertPoint {
    /// Ahead of every queued request.
    Front,
    /// Right behind the given queued request.
    After(RequestId),
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Operations a block queue invokes on its I/O scheduler.
pub trait Elevator {
    /// Attaches a new scheduler instance to the queue. Per-request data for every slot of the queue's free pool is
    /// allocated here, so that no later operation can fail.
    fn init(q: &QueueContext) -> Result<Self, Fail>
    where
        Self: Sized;

    /// Finds a queued request that `bio` can be merged into. When there is none, also suggests where a request built
    /// from `bio` should be inserted.
    fn merge(&mut self, q: &QueueContext, bio: &Bio) -> (MergeType, Option<InsertPoint>);

    /// Called after the block layer changed the range of `rq` by merging a bio into it.
    fn merged_request(&mut self, q: &QueueContext, rq: RequestId);

    /// Called after the block layer folded the range of `next` into `rq`. `next` leaves the scheduler.
    fn merge_requests(&mut self, q: &QueueContext, rq: RequestId, next: RequestId);

    /// Queues a new request.
    fn add_request(&mut self, q: &QueueContext, rq: RequestId, at: Option<InsertPoint>);

    /// Detaches `rq` from the scheduler's lookup structures.
    fn remove_request(&mut self, q: &QueueContext, rq: RequestId);

    /// Returns the next request the driver should process, moving a new batch to the dispatch queue if needed.
    fn next_request(&mut self, q: &mut QueueContext) -> Option<RequestId>;

    /// Whether nothing is queued nor waiting for dispatch.
    fn queue_empty(&self, q: &QueueContext) -> bool;

    /// The queued request sorted right before `rq`.
    fn former_request(&self, q: &QueueContext, rq: RequestId) -> Option<RequestId>;

    /// The queued request sorted right after `rq`.
    fn latter_request(&self, q: &QueueContext, rq: RequestId) -> Option<RequestId>;

    /// Detaches the scheduler from the queue and releases its state.
    fn exit(self, q: &QueueContext)
    where
        Self: Sized;
}
