// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    block::request::{
        Request,
        RequestId,
    },
    runtime::fail::Fail,
};
use ::slab::Slab;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Request table. Owns every request of a queue and hands out stable [RequestId]s.
///
/// The table is a fixed-size free pool: it never holds more than `capacity` requests, so every handle it issues is
/// smaller than `capacity`. Schedulers rely on this to pre-allocate per-request data at attach time.
pub struct RequestTable {
    table: Slab<Request>,
    capacity: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Request Tables
impl RequestTable {
    /// Creates a request table with a free pool of `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self, Fail> {
        if capacity == 0 {
            let cause: &str = "request pool must not be empty";
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }

        Ok(Self {
            table: Slab::new(),
            capacity,
        })
    }

    /// Allocates a slot from the free pool for `request`.
    pub fn alloc(&mut self, request: Request) -> Result<RequestId, Fail> {
        if self.table.len() >= self.capacity {
            let cause: String = format!("request pool exhausted (capacity={})", self.capacity);
            warn!("alloc(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, &cause));
        }

        let ix: usize = self.table.insert(request);
        debug_assert!(ix < self.capacity);
        Ok(RequestId::from(ix))
    }

    /// Gets the request associated with a handle.
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.table.get(id.into())
    }

    /// Gets a mutable reference to the request associated with a handle.
    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.table.get_mut(id.into())
    }

    /// Returns a slot to the free pool.
    pub fn free(&mut self, id: RequestId) -> Option<Request> {
        if !self.table.contains(id.into()) {
            return None;
        }

        Some(self.table.remove(id.into()))
    }

    /// Number of slots in the free pool, in use or not.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently in use.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::RequestTable;
    use crate::block::request::{
        Direction,
        Request,
        RequestId,
    };
    use ::anyhow::Result;

    #[test]
    fn alloc_fails_when_pool_is_exhausted() -> Result<()> {
        let mut table: RequestTable = RequestTable::new(2)?;
        table.alloc(Request::new(Direction::Read, 0, 8))?;
        table.alloc(Request::new(Direction::Read, 8, 8))?;

        match table.alloc(Request::new(Direction::Read, 16, 8)) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EAGAIN),
            Ok(id) => anyhow::bail!("allocated past capacity: {:?}", id),
        }
        Ok(())
    }

    #[test]
    fn handles_stay_below_capacity() -> Result<()> {
        let mut table: RequestTable = RequestTable::new(4)?;
        for round in 0..16 {
            let mut ids: Vec<RequestId> = Vec::new();
            for i in 0..4 {
                ids.push(table.alloc(Request::new(Direction::Write, round * 64 + i * 8, 8))?);
            }
            for id in ids {
                crate::ensure_eq!(usize::from(id) < table.capacity(), true);
                crate::ensure_eq!(table.free(id).is_some(), true);
            }
        }
        crate::ensure_eq!(table.is_empty(), true);
        Ok(())
    }

    #[test]
    fn free_unknown_handle_is_none() -> Result<()> {
        let mut table: RequestTable = RequestTable::new(1)?;
        crate::ensure_eq!(table.free(RequestId::from(0)).is_none(), true);
        Ok(())
    }
}
