// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-memory block request layer.
//!
//! Owns request objects and the dispatch queue, turns bios into requests, and defers every ordering decision to an
//! [crate::iosched::Elevator]. No I/O is performed: a "driver" is whoever calls [RequestQueue::fetch_request] and
//! [RequestQueue::end_request].

mod queue;
mod request;
mod table;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    queue::{
        QueueConfig,
        QueueContext,
        QueueStats,
        RequestQueue,
        DEFAULT_MAX_SECTORS,
        DEFAULT_NR_REQUESTS,
    },
    request::{
        Bio,
        Direction,
        Request,
        RequestFlags,
        RequestId,
        Sector,
        NR_DIRECTIONS,
    },
    table::RequestTable,
};
